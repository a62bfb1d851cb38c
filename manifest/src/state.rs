use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shared::{LogEntry, Node, NodeStatus, Task, TaskStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {task_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {0} is not pending")]
    NotPending(String),
}

/// The replicated state: every task in flight and every worker in the fleet.
///
/// This is a pure container. It holds no locks and never reads the clock;
/// callers serialize mutation and every timestamp comes from the log entry
/// being applied. `BTreeMap` keeps iteration order identical on every
/// replica.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskManifest {
    tasks: BTreeMap<String, Task>,
    nodes: BTreeMap<String, Node>,
}

impl TaskManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one committed log entry. Precondition failures leave the
    /// manifest untouched and must be treated as non-fatal by the caller.
    pub fn apply_entry(&mut self, entry: &LogEntry) -> Result<(), ManifestError> {
        match entry {
            LogEntry::AddTask {
                task_id,
                task_type,
                task_data,
                created_at,
            } => {
                self.add_task(task_id, task_type, task_data, *created_at);
                Ok(())
            }
            LogEntry::AssignTask {
                task_id,
                node_id,
                assigned_at,
            } => self.assign_task(task_id, node_id, *assigned_at),
            LogEntry::UpdateTaskStatus {
                task_id, status, ..
            } => self.update_task_status(task_id, *status),
            LogEntry::CompleteTask {
                task_id,
                result_data,
                completed_at,
            } => self.complete_task(task_id, result_data, *completed_at),
            LogEntry::FailTask {
                task_id,
                error_message,
                failed_at,
            } => self.fail_task(task_id, error_message, *failed_at),
            LogEntry::NodeHeartbeat {
                node_id,
                cpu_usage,
                memory_usage,
                active_tasks,
                timestamp,
            } => {
                self.node_heartbeat(node_id, *cpu_usage, *memory_usage, *active_tasks, *timestamp);
                Ok(())
            }
            LogEntry::RegisterNode {
                node_id,
                address,
                cloud_provider,
                region,
                registered_at,
            } => {
                self.register_node(node_id, address, cloud_provider, region, *registered_at);
                Ok(())
            }
        }
    }

    /// Inserts a new PENDING task. A no-op when the id already exists, so
    /// replaying a log tail over a restored snapshot cannot double-insert.
    pub fn add_task(&mut self, task_id: &str, task_type: &str, task_data: &str, created_at: i64) {
        if self.tasks.contains_key(task_id) {
            return;
        }
        self.tasks.insert(
            task_id.to_string(),
            Task {
                task_id: task_id.to_string(),
                task_type: task_type.to_string(),
                task_data: task_data.to_string(),
                status: TaskStatus::Pending,
                assigned_node_id: String::new(),
                created_at,
                started_at: 0,
                completed_at: 0,
                result_data: String::new(),
            },
        );
    }

    /// Assigns a PENDING task to a node. Refusing non-pending tasks makes a
    /// replayed assignment a reported failure instead of a second
    /// `active_tasks` increment.
    pub fn assign_task(
        &mut self,
        task_id: &str,
        node_id: &str,
        assigned_at: i64,
    ) -> Result<(), ManifestError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ManifestError::TaskNotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Pending {
            return Err(ManifestError::NotPending(task_id.to_string()));
        }
        task.assigned_node_id = node_id.to_string();
        task.status = TaskStatus::Assigned;
        task.started_at = assigned_at;
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.active_tasks = node.active_tasks.saturating_add(1);
        }
        Ok(())
    }

    /// Advances a task's status within the non-terminal part of the
    /// lifecycle. Terminal transitions go through `complete_task` /
    /// `fail_task`, which also settle the node's `active_tasks`; routing
    /// them here would leak an increment.
    pub fn update_task_status(
        &mut self,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), ManifestError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ManifestError::TaskNotFound(task_id.to_string()))?;
        if status.is_terminal() || !task.status.can_advance_to(status) {
            return Err(ManifestError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status,
                to: status,
            });
        }
        task.status = status;
        Ok(())
    }

    pub fn complete_task(
        &mut self,
        task_id: &str,
        result_data: &str,
        completed_at: i64,
    ) -> Result<(), ManifestError> {
        self.finish_task(task_id, TaskStatus::Completed, result_data, completed_at)
    }

    /// Marks a task FAILED; the error message is stored as its result data.
    pub fn fail_task(
        &mut self,
        task_id: &str,
        error_message: &str,
        failed_at: i64,
    ) -> Result<(), ManifestError> {
        self.finish_task(task_id, TaskStatus::Failed, error_message, failed_at)
    }

    fn finish_task(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        result_data: &str,
        completed_at: i64,
    ) -> Result<(), ManifestError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ManifestError::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Err(ManifestError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status,
                to: status,
            });
        }
        task.status = status;
        task.completed_at = completed_at;
        task.result_data = result_data.to_string();
        let assigned = task.assigned_node_id.clone();
        if let Some(node) = self.nodes.get_mut(&assigned) {
            node.active_tasks = node.active_tasks.saturating_sub(1);
        }
        Ok(())
    }

    /// Records a heartbeat, creating the node with empty placement metadata
    /// when it has never registered. Heartbeats always force HEALTHY.
    pub fn node_heartbeat(
        &mut self,
        node_id: &str,
        cpu_usage: f64,
        memory_usage: f64,
        active_tasks: u32,
        timestamp: i64,
    ) {
        let node = self
            .nodes
            .entry(node_id.to_string())
            .or_insert_with(|| Node {
                node_id: node_id.to_string(),
                address: String::new(),
                cloud_provider: String::new(),
                region: String::new(),
                status: NodeStatus::Healthy,
                last_heartbeat: 0,
                cpu_usage: 0.0,
                memory_usage: 0.0,
                active_tasks: 0,
            });
        node.cpu_usage = cpu_usage;
        node.memory_usage = memory_usage;
        node.active_tasks = active_tasks;
        node.last_heartbeat = timestamp;
        node.status = NodeStatus::Healthy;
    }

    /// Inserts or overwrites the full node record.
    pub fn register_node(
        &mut self,
        node_id: &str,
        address: &str,
        cloud_provider: &str,
        region: &str,
        registered_at: i64,
    ) {
        self.nodes.insert(
            node_id.to_string(),
            Node {
                node_id: node_id.to_string(),
                address: address.to_string(),
                cloud_provider: cloud_provider.to_string(),
                region: region.to_string(),
                status: NodeStatus::Healthy,
                last_heartbeat: registered_at,
                cpu_usage: 0.0,
                memory_usage: 0.0,
                active_tasks: 0,
            },
        );
    }

    pub fn get_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn list_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn list_tasks_by_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.tasks.values().filter(|t| t.status == status).collect()
    }

    pub fn list_pending_tasks(&self) -> Vec<&Task> {
        self.list_tasks_by_status(TaskStatus::Pending)
    }

    pub fn get_node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn list_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn list_healthy_nodes(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Healthy)
            .collect()
    }

    /// The healthy node with the fewest active tasks. Ties break on the
    /// first candidate in node_id order, which is identical on every
    /// replica.
    pub fn select_least_loaded_healthy_node(&self) -> Option<&Node> {
        let mut best: Option<&Node> = None;
        for node in self.list_healthy_nodes() {
            match best {
                Some(b) if node.active_tasks >= b.active_tasks => {}
                _ => best = Some(node),
            }
        }
        best
    }

    /// HEALTHY nodes whose last heartbeat is older than `now - timeout`.
    /// `now` is supplied by the caller; the manifest never reads the clock.
    pub fn stale_nodes(&self, now: i64, timeout_seconds: i64) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Healthy && now - n.last_heartbeat > timeout_seconds)
            .collect()
    }

    pub fn node_task_count(&self, node_id: &str) -> u32 {
        self.nodes.get(node_id).map_or(0, |n| n.active_tasks)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(id: &str) -> LogEntry {
        LogEntry::AddTask {
            task_id: id.into(),
            task_type: "matmul".into(),
            task_data: r#"{"x":1}"#.into(),
            created_at: 100,
        }
    }

    fn register(id: &str) -> LogEntry {
        LogEntry::RegisterNode {
            node_id: id.into(),
            address: format!("{id}.internal:50051"),
            cloud_provider: "aws".into(),
            region: "eu-west-1".into(),
            registered_at: 100,
        }
    }

    fn assign(task: &str, node: &str) -> LogEntry {
        LogEntry::AssignTask {
            task_id: task.into(),
            node_id: node.into(),
            assigned_at: 200,
        }
    }

    fn complete(task: &str) -> LogEntry {
        LogEntry::CompleteTask {
            task_id: task.into(),
            result_data: r#"{"ok":true}"#.into(),
            completed_at: 300,
        }
    }

    fn apply_all(manifest: &mut TaskManifest, entries: &[LogEntry]) {
        for entry in entries {
            manifest.apply_entry(entry).unwrap();
        }
    }

    #[test]
    fn test_add_task_starts_pending() {
        let mut m = TaskManifest::new();
        apply_all(&mut m, &[add("t1")]);
        let task = m.get_task("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.created_at, 100);
        assert_eq!(task.assigned_node_id, "");
        assert_eq!(task.started_at, 0);
    }

    #[test]
    fn test_add_task_is_idempotent() {
        let mut m = TaskManifest::new();
        apply_all(&mut m, &[add("t1"), register("n1"), assign("t1", "n1")]);

        // A replayed insert must not resurrect or duplicate the task.
        m.apply_entry(&add("t1")).unwrap();
        assert_eq!(m.task_count(), 1);
        assert_eq!(m.get_task("t1").unwrap().status, TaskStatus::Assigned);
    }

    #[test]
    fn test_register_node_starts_healthy() {
        let mut m = TaskManifest::new();
        apply_all(&mut m, &[register("n1")]);
        let node = m.get_node("n1").unwrap();
        assert_eq!(node.status, NodeStatus::Healthy);
        assert_eq!(node.last_heartbeat, 100);
        assert_eq!(node.cloud_provider, "aws");
    }

    #[test]
    fn test_assign_task_tracks_node_load() {
        let mut m = TaskManifest::new();
        apply_all(&mut m, &[register("n1"), add("t1"), assign("t1", "n1")]);

        let task = m.get_task("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_node_id, "n1");
        assert_eq!(task.started_at, 200);
        assert_eq!(m.node_task_count("n1"), 1);
    }

    #[test]
    fn test_assign_missing_task_fails() {
        let mut m = TaskManifest::new();
        assert!(matches!(
            m.apply_entry(&assign("ghost", "n1")),
            Err(ManifestError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_replayed_assignment_does_not_double_count() {
        let mut m = TaskManifest::new();
        apply_all(&mut m, &[register("n1"), add("t1"), assign("t1", "n1")]);

        assert!(m.apply_entry(&assign("t1", "n1")).is_err());
        assert_eq!(m.node_task_count("n1"), 1);
    }

    #[test]
    fn test_complete_task_settles_load() {
        let mut m = TaskManifest::new();
        apply_all(
            &mut m,
            &[register("n1"), add("t1"), assign("t1", "n1"), complete("t1")],
        );

        let task = m.get_task("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.completed_at, 300);
        assert_eq!(task.result_data, r#"{"ok":true}"#);
        assert_eq!(m.node_task_count("n1"), 0);
    }

    #[test]
    fn test_fail_task_stores_error_message() {
        let mut m = TaskManifest::new();
        apply_all(&mut m, &[register("n1"), add("t1"), assign("t1", "n1")]);
        m.apply_entry(&LogEntry::FailTask {
            task_id: "t1".into(),
            error_message: "OOM on worker".into(),
            failed_at: 300,
        })
        .unwrap();

        let task = m.get_task("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.result_data, "OOM on worker");
        assert_eq!(m.node_task_count("n1"), 0);
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        let mut m = TaskManifest::new();
        apply_all(
            &mut m,
            &[register("n1"), add("t1"), assign("t1", "n1"), complete("t1")],
        );

        assert!(m
            .apply_entry(&LogEntry::FailTask {
                task_id: "t1".into(),
                error_message: "late failure".into(),
                failed_at: 400,
            })
            .is_err());
        assert!(m
            .apply_entry(&LogEntry::UpdateTaskStatus {
                task_id: "t1".into(),
                status: TaskStatus::Running,
                updated_at: 400,
            })
            .is_err());

        let task = m.get_task("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result_data, r#"{"ok":true}"#);
        // The already-settled decrement must not run twice.
        assert_eq!(m.node_task_count("n1"), 0);
    }

    #[test]
    fn test_update_status_rejects_terminal_target() {
        let mut m = TaskManifest::new();
        apply_all(&mut m, &[add("t1")]);
        assert!(matches!(
            m.update_task_status("t1", TaskStatus::Completed),
            Err(ManifestError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_update_status_advances_assigned_to_running() {
        let mut m = TaskManifest::new();
        apply_all(&mut m, &[register("n1"), add("t1"), assign("t1", "n1")]);
        m.update_task_status("t1", TaskStatus::Running).unwrap();
        assert_eq!(m.get_task("t1").unwrap().status, TaskStatus::Running);
        // Status updates never touch node load.
        assert_eq!(m.node_task_count("n1"), 1);
    }

    #[test]
    fn test_heartbeat_creates_unknown_node() {
        let mut m = TaskManifest::new();
        m.node_heartbeat("n2", 10.0, 20.0, 0, 7000);

        let node = m.get_node("n2").unwrap();
        assert_eq!(node.status, NodeStatus::Healthy);
        assert_eq!(node.last_heartbeat, 7000);
        assert_eq!(node.cpu_usage, 10.0);
        assert_eq!(node.memory_usage, 20.0);
        assert_eq!(node.address, "");
    }

    #[test]
    fn test_decrement_clamps_at_zero() {
        let mut m = TaskManifest::new();
        // The node reports zero active tasks itself; a completion recorded
        // afterwards must not wrap the counter.
        apply_all(&mut m, &[register("n1"), add("t1"), assign("t1", "n1")]);
        m.node_heartbeat("n1", 1.0, 1.0, 0, 7000);
        m.apply_entry(&complete("t1")).unwrap();
        assert_eq!(m.node_task_count("n1"), 0);
    }

    #[test]
    fn test_select_least_loaded_empty_set() {
        let m = TaskManifest::new();
        assert!(m.select_least_loaded_healthy_node().is_none());
    }

    #[test]
    fn test_select_least_loaded_prefers_idle_and_breaks_ties_by_id() {
        let mut m = TaskManifest::new();
        apply_all(&mut m, &[register("n1"), register("n2"), register("n3")]);
        apply_all(&mut m, &[add("t1"), assign("t1", "n1")]);

        // n2 and n3 both idle; n2 wins on id order.
        assert_eq!(
            m.select_least_loaded_healthy_node().unwrap().node_id,
            "n2"
        );
    }

    #[test]
    fn test_stale_nodes_fresh_heartbeat_is_not_stale() {
        let mut m = TaskManifest::new();
        m.node_heartbeat("n1", 0.0, 0.0, 0, 7000);
        assert!(m.stale_nodes(7000, 30).is_empty());
        assert_eq!(m.stale_nodes(7031, 30).len(), 1);
    }

    #[test]
    fn test_determinism_same_log_same_state() {
        let entries = vec![
            register("n1"),
            register("n2"),
            add("t1"),
            add("t2"),
            add("t3"),
            assign("t1", "n1"),
            assign("t2", "n2"),
            LogEntry::UpdateTaskStatus {
                task_id: "t1".into(),
                status: TaskStatus::Running,
                updated_at: 250,
            },
            LogEntry::NodeHeartbeat {
                node_id: "n1".into(),
                cpu_usage: 55.5,
                memory_usage: 70.1,
                active_tasks: 1,
                timestamp: 260,
            },
            complete("t1"),
            LogEntry::FailTask {
                task_id: "t2".into(),
                error_message: "preempted".into(),
                failed_at: 310,
            },
        ];

        let mut a = TaskManifest::new();
        let mut b = TaskManifest::new();
        for entry in &entries {
            let ra = a.apply_entry(entry);
            let rb = b.apply_entry(entry);
            assert_eq!(ra.is_ok(), rb.is_ok());
        }
        assert_eq!(a, b);
    }

    #[test]
    fn test_active_task_conservation() {
        let mut m = TaskManifest::new();
        apply_all(&mut m, &[register("n1"), register("n2")]);
        for i in 0..10 {
            apply_all(&mut m, &[add(&format!("t{i}"))]);
        }
        for i in 0..6 {
            let node = if i % 2 == 0 { "n1" } else { "n2" };
            apply_all(&mut m, &[assign(&format!("t{i}"), node)]);
        }
        apply_all(&mut m, &[complete("t0")]);
        m.apply_entry(&LogEntry::FailTask {
            task_id: "t1".into(),
            error_message: "boom".into(),
            failed_at: 400,
        })
        .unwrap();

        for node in ["n1", "n2"] {
            let live = m
                .list_tasks()
                .filter(|t| {
                    t.assigned_node_id == node
                        && matches!(t.status, TaskStatus::Assigned | TaskStatus::Running)
                })
                .count() as u32;
            assert_eq!(m.node_task_count(node), live);
        }
    }
}

use serde::{Deserialize, Serialize};

/// Lifecycle of a task: PENDING -> ASSIGNED -> RUNNING -> (COMPLETED | FAILED).
/// COMPLETED and FAILED are absorbing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    // Transitions are only legal towards a higher rank.
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Assigned => 1,
            TaskStatus::Running => 2,
            TaskStatus::Completed | TaskStatus::Failed => 3,
        }
    }

    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn from_wire(s: &str) -> Option<TaskStatus> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "ASSIGNED" => Some(TaskStatus::Assigned),
            "RUNNING" => Some(TaskStatus::Running),
            "COMPLETED" => Some(TaskStatus::Completed),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NodeStatus::Healthy => "HEALTHY",
            NodeStatus::Unhealthy => "UNHEALTHY",
        })
    }
}

/// A unit of work tracked by the control plane.
///
/// `task_data` and `result_data` are opaque to the control plane and are
/// carried verbatim. Timestamps are seconds since epoch; zero means unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub task_id: String,
    pub task_type: String,
    pub task_data: String,
    pub status: TaskStatus,
    pub assigned_node_id: String,
    pub created_at: i64,
    pub started_at: i64,
    pub completed_at: i64,
    pub result_data: String,
}

/// A worker node in the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub node_id: String,
    pub address: String,
    pub cloud_provider: String,
    pub region: String,
    pub status: NodeStatus,
    pub last_heartbeat: i64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub active_tasks: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_forward_only() {
        assert!(TaskStatus::Pending.can_advance_to(TaskStatus::Assigned));
        assert!(TaskStatus::Assigned.can_advance_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_advance_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_advance_to(TaskStatus::Failed));
        assert!(TaskStatus::Assigned.can_advance_to(TaskStatus::Completed));

        assert!(!TaskStatus::Assigned.can_advance_to(TaskStatus::Pending));
        assert!(!TaskStatus::Running.can_advance_to(TaskStatus::Assigned));
        assert!(!TaskStatus::Pending.can_advance_to(TaskStatus::Pending));
    }

    #[test]
    fn test_terminal_states_absorbing() {
        for terminal in [TaskStatus::Completed, TaskStatus::Failed] {
            assert!(terminal.is_terminal());
            for next in [
                TaskStatus::Pending,
                TaskStatus::Assigned,
                TaskStatus::Running,
                TaskStatus::Completed,
                TaskStatus::Failed,
            ] {
                assert!(!terminal.can_advance_to(next));
            }
        }
    }

    #[test]
    fn test_status_wire_names() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::from_wire(status.as_wire()), Some(status));
        }
        assert_eq!(TaskStatus::from_wire("CANCELLED"), None);
        assert_eq!(TaskStatus::from_wire("pending"), None);
    }
}

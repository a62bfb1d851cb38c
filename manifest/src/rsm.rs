use std::io::Write;

use shared::{LogEntry, Node, Task, TaskStatus};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::state::{ManifestError, TaskManifest};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
}

/// The replicated state machine: the task manifest behind a readers-writer
/// lock. The consensus layer calls `apply` once per committed entry in
/// commit order; RPC reads go through the accessors under the read lock and
/// may lag the leader.
#[derive(Debug, Default)]
pub struct Rsm {
    manifest: RwLock<TaskManifest>,
}

impl Rsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one committed entry. A `ManifestError` is a non-fatal
    /// outcome: the entry is committed regardless and the error is only
    /// reported back to the proposer.
    pub async fn apply(&self, entry: &LogEntry) -> Result<(), ManifestError> {
        self.manifest.write().await.apply_entry(entry)
    }

    /// Deep-copies the manifest under the read lock.
    pub async fn snapshot(&self) -> ManifestSnapshot {
        ManifestSnapshot {
            manifest: self.manifest.read().await.clone(),
        }
    }

    /// Replaces the manifest wholesale from a persisted snapshot. Any prior
    /// state is discarded.
    pub async fn restore(&self, data: &[u8]) -> Result<(), SnapshotError> {
        let restored: TaskManifest = serde_json::from_slice(data)?;
        *self.manifest.write().await = restored;
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        self.manifest.read().await.get_task(task_id).cloned()
    }

    /// Tasks in id order, optionally filtered by status. `limit == 0` means
    /// no limit.
    pub async fn list_tasks(&self, filter: Option<TaskStatus>, limit: u32) -> Vec<Task> {
        let manifest = self.manifest.read().await;
        let matching = manifest
            .list_tasks()
            .filter(|t| filter.map_or(true, |f| t.status == f));
        if limit > 0 {
            matching.take(limit as usize).cloned().collect()
        } else {
            matching.cloned().collect()
        }
    }

    pub async fn first_pending_task(&self) -> Option<Task> {
        self.manifest
            .read()
            .await
            .list_pending_tasks()
            .first()
            .map(|t| (*t).clone())
    }

    pub async fn get_node(&self, node_id: &str) -> Option<Node> {
        self.manifest.read().await.get_node(node_id).cloned()
    }

    pub async fn list_nodes(&self) -> Vec<Node> {
        self.manifest.read().await.list_nodes().cloned().collect()
    }

    pub async fn select_least_loaded_healthy_node(&self) -> Option<Node> {
        self.manifest
            .read()
            .await
            .select_least_loaded_healthy_node()
            .cloned()
    }

    pub async fn stale_nodes(&self, now: i64, timeout_seconds: i64) -> Vec<Node> {
        self.manifest
            .read()
            .await
            .stale_nodes(now, timeout_seconds)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn node_task_count(&self, node_id: &str) -> u32 {
        self.manifest.read().await.node_task_count(node_id)
    }

    pub async fn task_count(&self) -> usize {
        self.manifest.read().await.task_count()
    }
}

/// A point-in-time deep copy of the manifest, detached from the lock.
pub struct ManifestSnapshot {
    manifest: TaskManifest,
}

impl ManifestSnapshot {
    /// Canonical serialization: both mappings in key order, suitable for
    /// byte-comparison across replicas.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(serde_json::to_vec(&self.manifest)?)
    }

    pub fn persist<W: Write>(&self, sink: &mut W) -> Result<(), SnapshotError> {
        sink.write_all(&self.to_bytes()?)?;
        Ok(())
    }

    /// Cleanup hook; the copy is dropped with the value.
    pub fn release(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries(tasks: usize, nodes: usize) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        for n in 0..nodes {
            entries.push(LogEntry::RegisterNode {
                node_id: format!("node-{n:02}"),
                address: format!("10.0.0.{n}:50051"),
                cloud_provider: "gcp".into(),
                region: "us-central1".into(),
                registered_at: 100,
            });
        }
        for t in 0..tasks {
            entries.push(LogEntry::AddTask {
                task_id: format!("task-{t:04}"),
                task_type: "train".into(),
                task_data: format!(r#"{{"shard":{t}}}"#),
                created_at: 100 + t as i64,
            });
        }
        for t in 0..tasks / 2 {
            entries.push(LogEntry::AssignTask {
                task_id: format!("task-{t:04}"),
                node_id: format!("node-{:02}", t % nodes),
                assigned_at: 200 + t as i64,
            });
        }
        entries
    }

    #[tokio::test]
    async fn test_snapshot_restore_roundtrip() {
        let rsm = Rsm::new();
        for entry in sample_entries(100, 5) {
            rsm.apply(&entry).await.unwrap();
        }

        let bytes = rsm.snapshot().await.to_bytes().unwrap();

        let restored = Rsm::new();
        restored.restore(&bytes).await.unwrap();

        assert_eq!(restored.task_count().await, 100);
        assert_eq!(
            restored.list_tasks(None, 0).await,
            rsm.list_tasks(None, 0).await
        );
        assert_eq!(restored.list_nodes().await, rsm.list_nodes().await);
        assert_eq!(
            restored.snapshot().await.to_bytes().unwrap(),
            bytes,
            "restored state must reserialize to identical bytes"
        );
    }

    #[tokio::test]
    async fn test_restore_discards_prior_state() {
        let empty = Rsm::new().snapshot().await.to_bytes().unwrap();

        let rsm = Rsm::new();
        for entry in sample_entries(10, 2) {
            rsm.apply(&entry).await.unwrap();
        }
        rsm.restore(&empty).await.unwrap();
        assert_eq!(rsm.task_count().await, 0);
        assert!(rsm.list_nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_rejects_garbage() {
        let rsm = Rsm::new();
        assert!(matches!(
            rsm.restore(b"not a snapshot").await,
            Err(SnapshotError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_list_tasks_filter_and_limit() {
        let rsm = Rsm::new();
        for entry in sample_entries(10, 2) {
            rsm.apply(&entry).await.unwrap();
        }

        assert_eq!(rsm.list_tasks(None, 0).await.len(), 10);
        assert_eq!(rsm.list_tasks(None, 3).await.len(), 3);
        assert_eq!(
            rsm.list_tasks(Some(TaskStatus::Assigned), 0).await.len(),
            5
        );
        // PENDING is a real filter, not "no filter".
        assert_eq!(rsm.list_tasks(Some(TaskStatus::Pending), 0).await.len(), 5);
        assert_eq!(rsm.list_tasks(Some(TaskStatus::Failed), 0).await.len(), 0);
    }

    #[tokio::test]
    async fn test_first_pending_task_in_id_order() {
        let rsm = Rsm::new();
        for entry in sample_entries(4, 1) {
            rsm.apply(&entry).await.unwrap();
        }
        // task-0000 and task-0001 were assigned; the first pending one left
        // is task-0002.
        assert_eq!(
            rsm.first_pending_task().await.unwrap().task_id,
            "task-0002"
        );
    }
}

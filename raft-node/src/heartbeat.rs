//! Heartbeats are high-frequency, loss-tolerant telemetry. Instead of
//! blocking every worker on a consensus round, handlers enqueue the entry
//! here and a small pool of drainers proposes in the background. When the
//! queue is full the oldest heartbeat is shed; a newer report supersedes it
//! anyway.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use cluster::RaftCluster;
use shared::LogEntry;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

const HEARTBEAT_PROPOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct HeartbeatQueue {
    queue: Mutex<VecDeque<LogEntry>>,
    notify: Notify,
    capacity: usize,
}

impl HeartbeatQueue {
    pub fn new(capacity: usize) -> Arc<HeartbeatQueue> {
        Arc::new(HeartbeatQueue {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        })
    }

    /// Enqueues a heartbeat entry, shedding the oldest one when full.
    pub async fn push(&self, entry: LogEntry) {
        let mut queue = self.queue.lock().await;
        if queue.len() == self.capacity {
            queue.pop_front();
            debug!("heartbeat queue full, dropping oldest entry");
        }
        queue.push_back(entry);
        drop(queue);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<LogEntry> {
        self.queue.lock().await.pop_front()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Spawns the drainer pool. Propose failures are logged and swallowed;
    /// they must never reach the worker that sent the heartbeat.
    pub fn spawn_drainers(self: &Arc<Self>, cluster: Arc<RaftCluster>, workers: usize) {
        for _ in 0..workers {
            let queue = Arc::clone(self);
            let cluster = Arc::clone(&cluster);
            tokio::spawn(async move {
                loop {
                    while let Some(entry) = queue.pop().await {
                        if let Err(err) =
                            cluster.propose(entry, HEARTBEAT_PROPOSE_TIMEOUT).await
                        {
                            warn!(error = %err, "failed to apply heartbeat");
                        }
                    }
                    queue.notify.notified().await;
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beat(node: &str, ts: i64) -> LogEntry {
        LogEntry::NodeHeartbeat {
            node_id: node.to_string(),
            cpu_usage: 1.0,
            memory_usage: 1.0,
            active_tasks: 0,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_overflow_sheds_oldest() {
        let queue = HeartbeatQueue::new(2);
        queue.push(beat("n1", 1)).await;
        queue.push(beat("n2", 2)).await;
        queue.push(beat("n3", 3)).await;

        assert_eq!(queue.len().await, 2);
        match queue.pop().await.unwrap() {
            LogEntry::NodeHeartbeat { node_id, .. } => assert_eq!(node_id, "n2"),
            other => panic!("unexpected entry: {other}"),
        }
        match queue.pop().await.unwrap() {
            LogEntry::NodeHeartbeat { node_id, .. } => assert_eq!(node_id, "n3"),
            other => panic!("unexpected entry: {other}"),
        }
        assert!(queue.pop().await.is_none());
    }
}

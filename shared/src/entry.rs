use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TaskStatus;

/// One atomic mutation of the task manifest, replicated through the log.
///
/// The wire form is adjacently tagged JSON (`{"type": ..., "data": ...}`),
/// which is canonical for a given logical value: struct fields serialize in
/// declaration order and the opaque `task_data` / `result_data` strings are
/// carried verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LogEntry {
    AddTask {
        task_id: String,
        task_type: String,
        task_data: String,
        created_at: i64,
    },
    AssignTask {
        task_id: String,
        node_id: String,
        assigned_at: i64,
    },
    UpdateTaskStatus {
        task_id: String,
        status: TaskStatus,
        updated_at: i64,
    },
    CompleteTask {
        task_id: String,
        result_data: String,
        completed_at: i64,
    },
    FailTask {
        task_id: String,
        error_message: String,
        failed_at: i64,
    },
    NodeHeartbeat {
        node_id: String,
        cpu_usage: f64,
        memory_usage: f64,
        active_tasks: u32,
        timestamp: i64,
    },
    RegisterNode {
        node_id: String,
        address: String,
        cloud_provider: String,
        region: String,
        registered_at: i64,
    },
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogEntry::AddTask { task_id, task_type, .. } => {
                write!(f, "add_task {task_id} ({task_type})")
            }
            LogEntry::AssignTask { task_id, node_id, .. } => {
                write!(f, "assign_task {task_id} -> {node_id}")
            }
            LogEntry::UpdateTaskStatus { task_id, status, .. } => {
                write!(f, "update_task_status {task_id} -> {status}")
            }
            LogEntry::CompleteTask { task_id, .. } => write!(f, "complete_task {task_id}"),
            LogEntry::FailTask { task_id, .. } => write!(f, "fail_task {task_id}"),
            LogEntry::NodeHeartbeat { node_id, .. } => write!(f, "node_heartbeat {node_id}"),
            LogEntry::RegisterNode { node_id, .. } => write!(f, "register_node {node_id}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EntryCodecError {
    #[error("failed to encode log entry: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed log entry: {0}")]
    Malformed(#[source] serde_json::Error),
}

pub fn encode_entry(entry: &LogEntry) -> Result<Vec<u8>, EntryCodecError> {
    serde_json::to_vec(entry).map_err(EntryCodecError::Encode)
}

pub fn decode_entry(data: &[u8]) -> Result<LogEntry, EntryCodecError> {
    serde_json::from_slice(data).map_err(EntryCodecError::Malformed)
}

/// Replicated outcome of applying one committed entry, returned to the
/// proposer. A rejected outcome means the entry was committed but a mutator
/// precondition failed; replicas stay in lockstep either way.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApplyOutcome {
    pub applied: bool,
    pub error: Option<String>,
}

impl ApplyOutcome {
    pub fn ok() -> Self {
        ApplyOutcome {
            applied: true,
            error: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        ApplyOutcome {
            applied: false,
            error: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_is_deterministic() {
        let entry = LogEntry::AddTask {
            task_id: "t-1".into(),
            task_type: "matmul".into(),
            task_data: r#"{"x":1}"#.into(),
            created_at: 1700000000,
        };
        assert_eq!(
            encode_entry(&entry).unwrap(),
            encode_entry(&entry.clone()).unwrap()
        );
    }

    #[test]
    fn test_opaque_payload_roundtrips_bit_exact() {
        // Deliberately odd spacing and key order; the codec must not
        // re-normalize opaque payloads.
        let payload = r#"{ "b":2,  "a": [1, 2,3] ,"nested":{"k":"v"}}"#;
        let entry = LogEntry::AddTask {
            task_id: "t-2".into(),
            task_type: "etl".into(),
            task_data: payload.into(),
            created_at: 42,
        };
        let decoded = decode_entry(&encode_entry(&entry).unwrap()).unwrap();
        match decoded {
            LogEntry::AddTask { task_data, .. } => assert_eq!(task_data, payload),
            other => panic!("decoded wrong kind: {other}"),
        }
    }

    #[test]
    fn test_decode_unknown_kind_is_malformed() {
        let raw = br#"{"type":"drop_task","data":{"task_id":"t-1"}}"#;
        assert!(matches!(
            decode_entry(raw),
            Err(EntryCodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_truncated_is_malformed() {
        let mut bytes = encode_entry(&LogEntry::NodeHeartbeat {
            node_id: "n-1".into(),
            cpu_usage: 10.0,
            memory_usage: 20.0,
            active_tasks: 0,
            timestamp: 7,
        })
        .unwrap();
        bytes.truncate(bytes.len() / 2);
        assert!(matches!(
            decode_entry(&bytes),
            Err(EntryCodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_missing_field_is_malformed() {
        let raw = br#"{"type":"assign_task","data":{"task_id":"t-1"}}"#;
        assert!(matches!(
            decode_entry(raw),
            Err(EntryCodecError::Malformed(_))
        ));
    }
}

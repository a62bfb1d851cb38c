use shared::{ApplyOutcome, LogEntry};

pub type NodeId = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = LogEntry,
        R = ApplyOutcome,
        NodeId = NodeId,
        Node = openraft::impls::BasicNode,
        Entry = openraft::impls::Entry<TypeConfig>,
        SnapshotData = std::io::Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

pub type Raft = openraft::Raft<TypeConfig>;
pub type Entry = openraft::impls::Entry<TypeConfig>;
pub type Vote = openraft::impls::Vote<TypeConfig>;
pub type LogId = openraft::LogId<TypeConfig>;
pub type SnapshotMeta = openraft::SnapshotMeta<TypeConfig>;
pub type StoredMembership = openraft::StoredMembership<TypeConfig>;

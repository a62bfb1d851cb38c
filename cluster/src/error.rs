use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors the consensus layer reports to callers. `NotLeader` and
/// `ProposeTimeout` leave the outcome of an in-flight proposal unknown; the
/// caller must re-check state before retrying.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("not the leader, current leader: {leader_address}")]
    NotLeader { leader_address: String },

    #[error("proposal did not commit within {0:?}")]
    ProposeTimeout(Duration),

    #[error("entry committed but rejected by the state machine: {0}")]
    ApplyRejected(String),

    #[error("no leader elected within {0:?}")]
    LeaderWaitTimeout(Duration),

    #[error("cluster is shutting down")]
    Shutdown,

    #[error("store error: {0}")]
    Store(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("membership change failed: {0}")]
    Membership(String),

    #[error("raft initialization failed: {0}")]
    Init(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

//! Consensus layer for the control plane.
//!
//! Wraps openraft with everything a node needs to take part in the cluster:
//!
//! - `typ`: openraft type configuration for our log entries
//! - `config`: node configuration file loading and validation
//! - `log_store`: durable log and stable stores backed by redb
//! - `snapshot_store`: file snapshot store retaining the last few snapshots
//! - `state_machine`: adapter between openraft and the manifest RSM
//! - `network`: HTTP peer transport, client side
//! - `server`: HTTP peer transport, serving side
//! - `cluster`: the `RaftCluster` facade the RPC layer talks to

pub mod cluster;
pub mod config;
pub mod error;
pub mod log_store;
pub mod network;
pub mod server;
pub mod snapshot_store;
pub mod state_machine;
pub mod typ;

pub use cluster::RaftCluster;
pub use config::{ClusterConfig, NodeConfig, PeerConfig};
pub use error::ClusterError;
pub use typ::{NodeId, TypeConfig};

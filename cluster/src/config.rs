use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::typ::NodeId;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

/// On-disk node configuration (JSON). Missing optional fields fall back to
/// defaults; required fields are checked after parsing so the error names
/// the field instead of pointing at a byte offset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node_id: NodeId,
    #[serde(default)]
    pub bind_address: String,
    #[serde(default)]
    pub advertise_address: String,
    #[serde(default)]
    pub cloud_provider: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub data_dir: String,
    #[serde(default)]
    pub bootstrap_expect: u32,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub raft: RaftSection,
    #[serde(default)]
    pub api: ApiSection,
}

/// A peer carries an explicit id so operators can renumber addresses
/// without changing cluster identity.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RaftSection {
    pub heartbeat_timeout: String,
    pub election_timeout: String,
    pub commit_timeout: String,
    pub snapshot_interval: String,
    pub snapshot_threshold: u64,
}

impl Default for RaftSection {
    fn default() -> Self {
        RaftSection {
            heartbeat_timeout: "500ms".into(),
            election_timeout: "1s".into(),
            commit_timeout: "50ms".into(),
            snapshot_interval: "120s".into(),
            snapshot_threshold: 8192,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub port: u16,
    pub max_concurrent_streams: u32,
}

impl Default for ApiSection {
    fn default() -> Self {
        ApiSection {
            port: 8080,
            max_concurrent_streams: 1000,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &str) -> Result<NodeConfig, ConfigError> {
        let data = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: NodeConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id == 0 {
            return Err(ConfigError::MissingField("node_id"));
        }
        if self.bind_address.is_empty() {
            return Err(ConfigError::MissingField("bind_address"));
        }
        if self.data_dir.is_empty() {
            return Err(ConfigError::MissingField("data_dir"));
        }
        for peer in &self.peers {
            if peer.id == 0 || peer.id == self.node_id {
                return Err(ConfigError::InvalidField {
                    field: "peers",
                    reason: format!("peer id {} conflicts with this node", peer.id),
                });
            }
        }
        Ok(())
    }

    /// Resolves duration strings into a runnable cluster configuration.
    pub fn to_cluster_config(&self) -> Result<ClusterConfig, ConfigError> {
        Ok(ClusterConfig {
            node_id: self.node_id,
            bind_address: self.bind_address.clone(),
            advertise_address: self.advertise_address.clone(),
            data_dir: PathBuf::from(&self.data_dir),
            bootstrap_expect: self.bootstrap_expect,
            peers: self.peers.clone(),
            heartbeat_timeout: parse_field("raft.heartbeat_timeout", &self.raft.heartbeat_timeout)?,
            election_timeout: parse_field("raft.election_timeout", &self.raft.election_timeout)?,
            commit_timeout: parse_field("raft.commit_timeout", &self.raft.commit_timeout)?,
            snapshot_interval: parse_field("raft.snapshot_interval", &self.raft.snapshot_interval)?,
            snapshot_threshold: self.raft.snapshot_threshold,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    pub bind_address: String,
    pub advertise_address: String,
    pub data_dir: PathBuf,
    pub bootstrap_expect: u32,
    pub peers: Vec<PeerConfig>,
    pub heartbeat_timeout: Duration,
    pub election_timeout: Duration,
    pub commit_timeout: Duration,
    pub snapshot_interval: Duration,
    pub snapshot_threshold: u64,
}

impl ClusterConfig {
    /// The address peers should dial; falls back to the bind address.
    pub fn advertised(&self) -> &str {
        if self.advertise_address.is_empty() {
            &self.bind_address
        } else {
            &self.advertise_address
        }
    }

    /// Maps our knobs onto openraft's. The election timeout becomes the
    /// lower bound of openraft's randomized window; the snapshot threshold
    /// drives its logs-since-last policy. `commit_timeout` and
    /// `snapshot_interval` have no openraft counterpart (commit waiting is
    /// per-proposal, snapshotting is threshold-scheduled) and are kept for
    /// the operator surface.
    pub(crate) fn to_openraft(&self) -> Result<openraft::Config, ClusterConfigInvalid> {
        let election_ms = self.election_timeout.as_millis() as u64;
        let config = openraft::Config {
            heartbeat_interval: self.heartbeat_timeout.as_millis() as u64,
            election_timeout_min: election_ms,
            election_timeout_max: election_ms * 2,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            ..Default::default()
        };
        config
            .validate()
            .map_err(|e| ClusterConfigInvalid(e.to_string()))
    }
}

#[derive(Error, Debug)]
#[error("invalid raft configuration: {0}")]
pub(crate) struct ClusterConfigInvalid(String);

fn parse_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidField {
        field,
        reason: format!("unparsable duration {value:?}"),
    })
}

/// Parses Go-style duration strings: a decimal number followed by one of
/// `ms`, `s`, `m`, `h`.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    let seconds = match unit {
        "ms" => number / 1000.0,
        "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(seconds))
}

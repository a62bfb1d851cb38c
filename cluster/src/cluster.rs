use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use manifest::Rsm;
use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::impls::BasicNode;
use openraft::ChangeMembers;
use shared::LogEntry;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::log_store::LogStore;
use crate::network::HttpNetworkFactory;
use crate::server::raft_router;
use crate::snapshot_store::{SnapshotStore, DEFAULT_RETAIN};
use crate::state_machine::StateMachineStore;
use crate::typ::{NodeId, Raft};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(100);

type WriteError = RaftError<crate::typ::TypeConfig, ClientWriteError<crate::typ::TypeConfig>>;

/// One node's membership in the consensus cluster.
///
/// Owns the durable stores, the peer transport, and the raft instance, and
/// drives the supplied RSM with committed entries. Dropping the value after
/// `shutdown` releases the log store before the stable store.
pub struct RaftCluster {
    node_id: NodeId,
    config: ClusterConfig,
    raft: Raft,
    rsm: Arc<Rsm>,
    peer_server: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl RaftCluster {
    /// Opens or creates all durable state and joins (or bootstraps) the
    /// cluster. Store failures here are fatal.
    pub async fn new(config: ClusterConfig, rsm: Arc<Rsm>) -> Result<RaftCluster, ClusterError> {
        std::fs::create_dir_all(&config.data_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&config.data_dir, std::fs::Permissions::from_mode(0o755))?;
        }

        let log_store = LogStore::open(&config.data_dir)?;
        let snapshot_store = SnapshotStore::open(&config.data_dir, DEFAULT_RETAIN)?;
        let has_state = log_store.has_existing_state()? || snapshot_store.has_any()?;

        let state_machine = StateMachineStore::open(rsm.clone(), snapshot_store).await?;
        let raft_config = Arc::new(
            config
                .to_openraft()
                .map_err(|e| ClusterError::Init(e.to_string()))?,
        );
        let network = HttpNetworkFactory::new(DIAL_TIMEOUT)
            .map_err(|e| ClusterError::Transport(e.to_string()))?;

        let raft = Raft::new(
            config.node_id,
            raft_config,
            network,
            log_store.clone(),
            state_machine,
        )
        .await
        .map_err(|e| ClusterError::Init(e.to_string()))?;

        let peer_server = Self::serve_peers(&config.bind_address, raft.clone()).await?;

        let cluster = RaftCluster {
            node_id: config.node_id,
            config,
            raft,
            rsm,
            peer_server: Mutex::new(Some(peer_server)),
        };

        if cluster.config.bootstrap_expect > 0 {
            if has_state {
                info!("existing raft state found, skipping bootstrap");
            } else {
                cluster.bootstrap().await?;
            }
        }

        Ok(cluster)
    }

    async fn serve_peers(
        bind_address: &str,
        raft: Raft,
    ) -> Result<(oneshot::Sender<()>, JoinHandle<()>), ClusterError> {
        let listener = tokio::net::TcpListener::bind(bind_address).await?;
        info!(address = %bind_address, "raft peer transport listening");
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let shutdown = async {
                let _ = rx.await;
            };
            if let Err(err) = axum::serve(listener, raft_router(raft))
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %err, "raft peer transport failed");
            }
        });
        Ok((tx, handle))
    }

    /// One-shot cluster formation from this node plus the configured peers.
    /// Only reached when no on-disk state exists; a recovered node rejoins
    /// with its persisted membership instead.
    async fn bootstrap(&self) -> Result<(), ClusterError> {
        let mut members = BTreeMap::new();
        members.insert(self.node_id, BasicNode::new(self.config.advertised()));
        for peer in &self.config.peers {
            members.insert(peer.id, BasicNode::new(&peer.address));
        }

        match self.raft.initialize(members).await {
            Ok(()) => {
                info!(
                    voters = self.config.peers.len() + 1,
                    "bootstrapped raft cluster"
                );
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                info!("cluster already initialized, skipping bootstrap");
                Ok(())
            }
            Err(err) => Err(ClusterError::Init(err.to_string())),
        }
    }

    /// Submits an entry for replication and waits until it is committed and
    /// applied locally, or the deadline passes. On `NotLeader` or
    /// `ProposeTimeout` the entry may or may not have been committed; the
    /// caller must re-check state before retrying.
    pub async fn propose(&self, entry: LogEntry, timeout: Duration) -> Result<(), ClusterError> {
        match tokio::time::timeout(timeout, self.raft.client_write(entry)).await {
            Err(_) => Err(ClusterError::ProposeTimeout(timeout)),
            Ok(Ok(response)) => {
                let outcome = response.data;
                if outcome.applied {
                    Ok(())
                } else {
                    Err(ClusterError::ApplyRejected(
                        outcome.error.unwrap_or_else(|| "rejected".to_string()),
                    ))
                }
            }
            Ok(Err(err)) => Err(self.write_error(err)),
        }
    }

    fn write_error(&self, err: WriteError) -> ClusterError {
        match err {
            RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => {
                ClusterError::NotLeader {
                    leader_address: forward
                        .leader_node
                        .map(|node| node.addr)
                        .unwrap_or_default(),
                }
            }
            RaftError::APIError(ClientWriteError::ChangeMembershipError(err)) => {
                ClusterError::Membership(err.to_string())
            }
            RaftError::Fatal(_) => ClusterError::Shutdown,
        }
    }

    fn current_leader_id(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    pub async fn is_leader(&self) -> bool {
        self.current_leader_id() == Some(self.node_id)
    }

    /// Address of the current leader, or an empty string when unknown.
    pub async fn leader_address(&self) -> String {
        let Some(leader) = self.current_leader_id() else {
            return String::new();
        };
        if leader == self.node_id {
            return self.config.advertised().to_string();
        }
        let metrics = self.raft.metrics().borrow().clone();
        metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|node| node.addr.clone())
            .unwrap_or_default()
    }

    /// Diagnostic counters for the operator surface.
    pub fn stats(&self) -> BTreeMap<String, String> {
        let metrics = self.raft.metrics().borrow().clone();
        let mut stats = BTreeMap::new();
        stats.insert("node_id".to_string(), metrics.id.to_string());
        stats.insert("state".to_string(), format!("{:?}", metrics.state));
        stats.insert(
            "current_term".to_string(),
            metrics.current_term.to_string(),
        );
        stats.insert(
            "current_leader".to_string(),
            metrics
                .current_leader
                .map(|id| id.to_string())
                .unwrap_or_default(),
        );
        stats.insert(
            "last_log_index".to_string(),
            metrics
                .last_log_index
                .map(|index| index.to_string())
                .unwrap_or_default(),
        );
        stats.insert(
            "last_applied".to_string(),
            metrics
                .last_applied
                .map(|id| id.to_string())
                .unwrap_or_default(),
        );
        stats.insert(
            "snapshot".to_string(),
            metrics
                .snapshot
                .map(|id| id.to_string())
                .unwrap_or_default(),
        );
        stats.insert(
            "membership".to_string(),
            format!("{:?}", metrics.membership_config.membership()),
        );
        stats
    }

    /// Polls every 100 ms until some node holds leadership.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String, ClusterError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.current_leader_id().is_some() {
                return Ok(self.leader_address().await);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClusterError::LeaderWaitTimeout(timeout));
            }
            tokio::time::sleep(LEADER_POLL_INTERVAL).await;
        }
    }

    /// Adds a voting member. Rejected locally on non-leaders so the caller
    /// gets a redirect instead of a consensus round-trip.
    pub async fn add_voter(
        &self,
        id: NodeId,
        address: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        if !self.is_leader().await {
            return Err(ClusterError::NotLeader {
                leader_address: self.leader_address().await,
            });
        }
        let change = async {
            self.raft
                .add_learner(id, BasicNode::new(address), true)
                .await
                .map_err(|err| self.write_error(err))?;
            self.raft
                .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false)
                .await
                .map_err(|err| self.write_error(err))?;
            Ok(())
        };
        match tokio::time::timeout(timeout, change).await {
            Err(_) => Err(ClusterError::ProposeTimeout(timeout)),
            Ok(result) => result,
        }
    }

    /// Removes a server from the membership entirely.
    pub async fn remove_server(&self, id: NodeId, timeout: Duration) -> Result<(), ClusterError> {
        if !self.is_leader().await {
            return Err(ClusterError::NotLeader {
                leader_address: self.leader_address().await,
            });
        }
        let change = async {
            self.raft
                .change_membership(ChangeMembers::RemoveVoters(BTreeSet::from([id])), false)
                .await
                .map_err(|err| self.write_error(err))?;
            Ok(())
        };
        match tokio::time::timeout(timeout, change).await {
            Err(_) => Err(ClusterError::ProposeTimeout(timeout)),
            Ok(result) => result,
        }
    }

    pub fn rsm(&self) -> &Arc<Rsm> {
        &self.rsm
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Stops the peer transport, then raft itself; the stores close when
    /// the cluster is dropped. Safe to call once.
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        if let Some((stop, handle)) = self.peer_server.lock().await.take() {
            let _ = stop.send(());
            if let Err(err) = handle.await {
                warn!(error = %err, "peer transport task ended abnormally");
            }
        }
        self.raft
            .shutdown()
            .await
            .map_err(|_| ClusterError::Shutdown)?;
        info!("raft cluster shut down");
        Ok(())
    }
}

//! Adapter between openraft and the manifest RSM.
//!
//! openraft owns commit ordering and calls `apply` exactly once per
//! committed entry; the manifest mutators own the semantics. A mutator
//! precondition failure is replicated state like any other: the entry stays
//! committed on every replica and only the proposer sees the rejection,
//! carried back through `ApplyOutcome`.

use std::io::{self, Cursor};
use std::sync::Arc;

use futures::StreamExt;
use manifest::Rsm;
use openraft::storage::{EntryResponder, RaftStateMachine, Snapshot};
use openraft::{EntryPayload, OptionalSend, RaftSnapshotBuilder};
use tokio::sync::RwLock;
use tracing::{debug, info};

use shared::ApplyOutcome;

use crate::snapshot_store::SnapshotStore;
use crate::typ::{LogId, SnapshotMeta, StoredMembership, TypeConfig};

#[derive(Debug, Default)]
struct AppliedState {
    log_id: Option<LogId>,
    membership: StoredMembership,
}

#[derive(Clone)]
pub struct StateMachineStore {
    rsm: Arc<Rsm>,
    snapshots: SnapshotStore,
    applied: Arc<RwLock<AppliedState>>,
}

impl StateMachineStore {
    /// Opens the state machine, restoring the newest on-disk snapshot so a
    /// restart only replays the log tail past it.
    pub async fn open(rsm: Arc<Rsm>, snapshots: SnapshotStore) -> io::Result<StateMachineStore> {
        let mut applied = AppliedState::default();
        if let Some((meta, data)) = snapshots.load_latest()? {
            rsm.restore(&data).await.map_err(io::Error::other)?;
            info!(
                snapshot_id = %meta.snapshot_id,
                last_log_id = ?meta.last_log_id,
                "restored manifest from snapshot"
            );
            applied.log_id = meta.last_log_id;
            applied.membership = meta.last_membership.clone();
        }
        Ok(StateMachineStore {
            rsm,
            snapshots,
            applied: Arc::new(RwLock::new(applied)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for StateMachineStore {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId>, StoredMembership), io::Error> {
        let applied = self.applied.read().await;
        Ok((applied.log_id, applied.membership.clone()))
    }

    async fn apply<Strm>(&mut self, mut entries: Strm) -> Result<(), io::Error>
    where
        Strm: futures::Stream<Item = Result<EntryResponder<TypeConfig>, io::Error>>
            + Unpin
            + OptionalSend,
    {
        while let Some(Ok((entry, responder))) = entries.next().await {
            let log_id = entry.log_id;
            let mut applied = self.applied.write().await;
            applied.log_id = Some(log_id);

            let outcome = match entry.payload {
                EntryPayload::Normal(op) => match self.rsm.apply(&op).await {
                    Ok(()) => ApplyOutcome::ok(),
                    Err(err) => {
                        debug!(entry = %op, error = %err, "committed entry rejected by manifest");
                        ApplyOutcome::rejected(err.to_string())
                    }
                },
                EntryPayload::Blank => ApplyOutcome::ok(),
                EntryPayload::Membership(membership) => {
                    applied.membership = StoredMembership::new(Some(log_id), membership);
                    ApplyOutcome::ok()
                }
            };
            drop(applied);

            if let Some(responder) = responder {
                responder.send(outcome);
            }
        }
        Ok(())
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(&mut self) -> Result<Cursor<Vec<u8>>, io::Error> {
        Ok(Cursor::new(Vec::new()))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        snapshot: Cursor<Vec<u8>>,
    ) -> Result<(), io::Error> {
        let data = snapshot.into_inner();
        self.rsm.restore(&data).await.map_err(io::Error::other)?;
        self.snapshots.save(meta, &data)?;

        let mut applied = self.applied.write().await;
        applied.log_id = meta.last_log_id;
        applied.membership = meta.last_membership.clone();
        info!(snapshot_id = %meta.snapshot_id, "installed snapshot from leader");
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot<TypeConfig>>, io::Error> {
        Ok(self.snapshots.load_latest()?.map(|(meta, data)| Snapshot {
            meta,
            snapshot: Cursor::new(data),
        }))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for StateMachineStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, io::Error> {
        let data = self
            .rsm
            .snapshot()
            .await
            .to_bytes()
            .map_err(io::Error::other)?;
        let applied = self.applied.read().await;
        let meta = SnapshotMeta {
            last_log_id: applied.log_id,
            last_membership: applied.membership.clone(),
            snapshot_id: format!("{:020}", applied.log_id.map_or(0, |id| id.index)),
        };
        drop(applied);

        self.snapshots.save(&meta, &data)?;
        Ok(Snapshot {
            meta,
            snapshot: Cursor::new(data),
        })
    }
}

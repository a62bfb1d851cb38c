//! Client side of the peer transport: raft RPCs as JSON over HTTP.

use std::future::Future;
use std::time::Duration;

use openraft::error::{NetworkError, RPCError, ReplicationClosed, StreamingError};
use openraft::network::v2::RaftNetworkV2;
use openraft::network::{RPCOption, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, SnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::storage::Snapshot;
use openraft::{AnyError, OptionalSend};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::typ::{NodeId, SnapshotMeta, TypeConfig, Vote};

/// Wire form of a full-snapshot transfer: openraft streams snapshots
/// chunk-free through `RaftNetworkV2`, so the whole payload rides in one
/// request.
#[derive(Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub vote: Vote,
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

#[derive(Clone)]
pub struct HttpNetworkFactory {
    client: reqwest::Client,
}

impl HttpNetworkFactory {
    /// `dial_timeout` bounds connection establishment to a peer; requests
    /// themselves are bounded by openraft's own RPC deadlines.
    pub fn new(dial_timeout: Duration) -> Result<HttpNetworkFactory, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(dial_timeout)
            .build()?;
        Ok(HttpNetworkFactory { client })
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpConnection;

    async fn new_client(
        &mut self,
        target: NodeId,
        node: &openraft::impls::BasicNode,
    ) -> Self::Network {
        HttpConnection {
            client: self.client.clone(),
            target,
            base: format!("http://{}", node.addr),
        }
    }
}

pub struct HttpConnection {
    client: reqwest::Client,
    #[allow(dead_code)]
    target: NodeId,
    base: String,
}

impl HttpConnection {
    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, NetworkError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await
            .map_err(|e| NetworkError::new(&e))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(NetworkError::new(&AnyError::error(format!(
                "peer returned {status}: {detail}"
            ))));
        }
        response.json().await.map_err(|e| NetworkError::new(&e))
    }
}

impl RaftNetworkV2<TypeConfig> for HttpConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<TypeConfig>, RPCError<TypeConfig, openraft::error::Infallible>>
    {
        self.post("/raft/append-entries", &req)
            .await
            .map_err(RPCError::Network)
    }

    async fn vote(
        &mut self,
        req: VoteRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<VoteResponse<TypeConfig>, RPCError<TypeConfig, openraft::error::Infallible>> {
        self.post("/raft/vote", &req).await.map_err(RPCError::Network)
    }

    async fn full_snapshot(
        &mut self,
        vote: Vote,
        snapshot: Snapshot<TypeConfig>,
        _cancel: impl Future<Output = ReplicationClosed> + OptionalSend + 'static,
        _option: RPCOption,
    ) -> Result<SnapshotResponse<TypeConfig>, StreamingError<TypeConfig>> {
        let req = InstallSnapshotRequest {
            vote,
            meta: snapshot.meta,
            data: snapshot.snapshot.into_inner(),
        };
        self.post("/raft/install-snapshot", &req)
            .await
            .map_err(StreamingError::Network)
    }
}

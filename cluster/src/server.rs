//! Serving side of the peer transport. The cluster binds this router on the
//! configured raft address; incoming RPCs are handed straight to openraft.

use std::io::Cursor;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, SnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::storage::Snapshot;

use crate::network::InstallSnapshotRequest;
use crate::typ::{Raft, TypeConfig};

pub fn raft_router(raft: Raft) -> Router {
    Router::new()
        .route("/raft/append-entries", post(append_entries))
        .route("/raft/vote", post(vote))
        .route("/raft/install-snapshot", post(install_snapshot))
        // Snapshot transfers carry the whole manifest in one request.
        .layer(DefaultBodyLimit::disable())
        .with_state(raft)
}

type RpcResult<T> = Result<Json<T>, (StatusCode, String)>;

fn internal<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

async fn append_entries(
    State(raft): State<Raft>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> RpcResult<AppendEntriesResponse<TypeConfig>> {
    raft.append_entries(req).await.map(Json).map_err(internal)
}

async fn vote(
    State(raft): State<Raft>,
    Json(req): Json<VoteRequest<TypeConfig>>,
) -> RpcResult<VoteResponse<TypeConfig>> {
    raft.vote(req).await.map(Json).map_err(internal)
}

async fn install_snapshot(
    State(raft): State<Raft>,
    Json(req): Json<InstallSnapshotRequest>,
) -> RpcResult<SnapshotResponse<TypeConfig>> {
    let snapshot = Snapshot {
        meta: req.meta,
        snapshot: Cursor::new(req.data),
    };
    raft.install_full_snapshot(req.vote, snapshot)
        .await
        .map(Json)
        .map_err(internal)
}

//! Operator surface: raft diagnostics and cluster membership changes.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};

use crate::AppState;

const MEMBERSHIP_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn raft_stats(State(state): State<AppState>) -> Json<BTreeMap<String, String>> {
    Json(state.cluster.stats())
}

#[derive(Deserialize)]
pub struct AddVoterRequest {
    pub node_id: u64,
    pub address: String,
}

#[derive(Serialize)]
pub struct MembershipResponse {
    pub success: bool,
    pub error_message: String,
}

impl MembershipResponse {
    fn from_result(result: Result<(), cluster::ClusterError>) -> MembershipResponse {
        match result {
            Ok(()) => MembershipResponse {
                success: true,
                error_message: String::new(),
            },
            Err(err) => MembershipResponse {
                success: false,
                error_message: err.to_string(),
            },
        }
    }
}

pub async fn add_voter(
    State(state): State<AppState>,
    Json(req): Json<AddVoterRequest>,
) -> Json<MembershipResponse> {
    let result = state
        .cluster
        .add_voter(req.node_id, &req.address, MEMBERSHIP_TIMEOUT)
        .await;
    Json(MembershipResponse::from_result(result))
}

pub async fn remove_server(
    State(state): State<AppState>,
    Path(node_id): Path<u64>,
) -> Json<MembershipResponse> {
    let result = state.cluster.remove_server(node_id, MEMBERSHIP_TIMEOUT).await;
    Json(MembershipResponse::from_result(result))
}

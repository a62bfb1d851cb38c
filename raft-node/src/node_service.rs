//! Worker-facing RPCs: heartbeat, registration, task polling, and result
//! reporting. Heartbeats and polls silently no-op on non-leaders; the other
//! writes return the leader address for redirection.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use shared::{LogEntry, Node, Task, TaskStatus};
use tracing::warn;

use crate::{epoch_seconds, AppState};

const PROPOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub active_tasks: u32,
}

#[derive(Serialize)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
    pub leader_address: String,
}

/// Acknowledges unconditionally on the leader: the entry is proposed in the
/// background so worker liveness never waits on cluster latency.
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    let leader_address = state.cluster.leader_address().await;
    if !state.cluster.is_leader().await {
        return Json(HeartbeatResponse {
            acknowledged: false,
            leader_address,
        });
    }

    state
        .heartbeats
        .push(LogEntry::NodeHeartbeat {
            node_id: req.node_id,
            cpu_usage: req.cpu_usage,
            memory_usage: req.memory_usage,
            active_tasks: req.active_tasks,
            timestamp: epoch_seconds(),
        })
        .await;

    Json(HeartbeatResponse {
        acknowledged: true,
        leader_address,
    })
}

#[derive(Deserialize)]
pub struct RegisterNodeRequest {
    pub node_id: String,
    pub address: String,
    #[serde(default)]
    pub cloud_provider: String,
    #[serde(default)]
    pub region: String,
}

#[derive(Serialize)]
pub struct RegisterNodeResponse {
    pub acknowledged: bool,
    pub leader_address: String,
    pub error_message: String,
}

pub async fn register_node(
    State(state): State<AppState>,
    Json(req): Json<RegisterNodeRequest>,
) -> Json<RegisterNodeResponse> {
    let leader_address = state.cluster.leader_address().await;
    if !state.cluster.is_leader().await {
        return Json(RegisterNodeResponse {
            acknowledged: false,
            leader_address,
            error_message: format!("not leader, current leader: {leader_address}"),
        });
    }

    let entry = LogEntry::RegisterNode {
        node_id: req.node_id,
        address: req.address,
        cloud_provider: req.cloud_provider,
        region: req.region,
        registered_at: epoch_seconds(),
    };
    match state.cluster.propose(entry, PROPOSE_TIMEOUT).await {
        Ok(()) => Json(RegisterNodeResponse {
            acknowledged: true,
            leader_address,
            error_message: String::new(),
        }),
        Err(err) => Json(RegisterNodeResponse {
            acknowledged: false,
            leader_address,
            error_message: err.to_string(),
        }),
    }
}

#[derive(Serialize)]
pub struct PollTaskResponse {
    pub task: Option<Task>,
    pub has_task: bool,
    pub error_message: String,
}

impl PollTaskResponse {
    fn none() -> PollTaskResponse {
        PollTaskResponse {
            task: None,
            has_task: false,
            error_message: String::new(),
        }
    }
}

/// Hands the first pending task to the polling node. The assignment commits
/// through consensus before the reply; the follow-up transition to RUNNING
/// is proposed best-effort, since a task resting in ASSIGNED is still
/// completable.
pub async fn poll_task(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Json<PollTaskResponse> {
    if !state.cluster.is_leader().await {
        return Json(PollTaskResponse::none());
    }

    let Some(task) = state.cluster.rsm().first_pending_task().await else {
        return Json(PollTaskResponse::none());
    };

    let assign = LogEntry::AssignTask {
        task_id: task.task_id.clone(),
        node_id,
        assigned_at: epoch_seconds(),
    };
    if let Err(err) = state.cluster.propose(assign, PROPOSE_TIMEOUT).await {
        return Json(PollTaskResponse {
            task: None,
            has_task: false,
            error_message: err.to_string(),
        });
    }

    let update = LogEntry::UpdateTaskStatus {
        task_id: task.task_id.clone(),
        status: TaskStatus::Running,
        updated_at: epoch_seconds(),
    };
    if let Err(err) = state.cluster.propose(update, PROPOSE_TIMEOUT).await {
        warn!(task_id = %task.task_id, error = %err, "task left assigned, running update failed");
    }

    let task = state
        .cluster
        .rsm()
        .get_task(&task.task_id)
        .await
        .unwrap_or(task);
    Json(PollTaskResponse {
        task: Some(task),
        has_task: true,
        error_message: String::new(),
    })
}

#[derive(Deserialize)]
pub struct ReportTaskResultRequest {
    pub final_status: String,
    #[serde(default)]
    pub result_data: String,
}

#[derive(Serialize)]
pub struct ReportTaskResultResponse {
    pub acknowledged: bool,
    pub error_message: String,
}

pub async fn report_task_result(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(req): Json<ReportTaskResultRequest>,
) -> Result<Json<ReportTaskResultResponse>, (StatusCode, String)> {
    if !state.cluster.is_leader().await {
        return Ok(Json(ReportTaskResultResponse {
            acknowledged: false,
            error_message: format!(
                "not leader, current leader: {}",
                state.cluster.leader_address().await
            ),
        }));
    }

    // Only the two terminal statuses are valid here; anything else is a
    // client error and nothing is proposed.
    let entry = match TaskStatus::from_wire(&req.final_status) {
        Some(TaskStatus::Completed) => LogEntry::CompleteTask {
            task_id,
            result_data: req.result_data,
            completed_at: epoch_seconds(),
        },
        Some(TaskStatus::Failed) => LogEntry::FailTask {
            task_id,
            error_message: req.result_data,
            failed_at: epoch_seconds(),
        },
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("invalid final status: {}", req.final_status),
            ))
        }
    };

    match state.cluster.propose(entry, PROPOSE_TIMEOUT).await {
        Ok(()) => Ok(Json(ReportTaskResultResponse {
            acknowledged: true,
            error_message: String::new(),
        })),
        Err(err) => Ok(Json(ReportTaskResultResponse {
            acknowledged: false,
            error_message: err.to_string(),
        })),
    }
}

#[derive(Serialize)]
pub struct ListNodesResponse {
    pub nodes: Vec<Node>,
}

pub async fn list_nodes(State(state): State<AppState>) -> Json<ListNodesResponse> {
    Json(ListNodesResponse {
        nodes: state.cluster.rsm().list_nodes().await,
    })
}

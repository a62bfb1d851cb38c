//! Task-facing RPCs: submit, fetch, list. Writes are leader-gated and
//! proposed through consensus; reads come straight from the local manifest
//! and may lag the leader.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use shared::{LogEntry, Task, TaskStatus};
use uuid::Uuid;

use crate::{epoch_seconds, AppState};

const PROPOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
pub struct SubmitTaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub task_data: String,
}

#[derive(Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: String,
    pub success: bool,
    pub error_message: String,
}

impl SubmitTaskResponse {
    fn failure(message: String) -> SubmitTaskResponse {
        SubmitTaskResponse {
            task_id: String::new(),
            success: false,
            error_message: message,
        }
    }
}

pub async fn submit_task(
    State(state): State<AppState>,
    Json(req): Json<SubmitTaskRequest>,
) -> Json<SubmitTaskResponse> {
    if !state.cluster.is_leader().await {
        let leader = state.cluster.leader_address().await;
        return Json(SubmitTaskResponse::failure(format!(
            "not leader, current leader: {leader}"
        )));
    }

    let task_id = Uuid::new_v4().to_string();
    let entry = LogEntry::AddTask {
        task_id: task_id.clone(),
        task_type: req.task_type,
        task_data: req.task_data,
        created_at: epoch_seconds(),
    };

    match state.cluster.propose(entry, PROPOSE_TIMEOUT).await {
        Ok(()) => Json(SubmitTaskResponse {
            task_id,
            success: true,
            error_message: String::new(),
        }),
        Err(err) => Json(SubmitTaskResponse::failure(err.to_string())),
    }
}

#[derive(Serialize)]
pub struct GetTaskResponse {
    pub task: Option<Task>,
    pub found: bool,
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Json<GetTaskResponse> {
    let task = state.cluster.rsm().get_task(&task_id).await;
    Json(GetTaskResponse {
        found: task.is_some(),
        task,
    })
}

#[derive(Deserialize)]
pub struct ListTasksParams {
    /// Absent means no filter; `PENDING` really means only pending tasks.
    pub status: Option<String>,
    #[serde(default)]
    pub limit: u32,
}

#[derive(Serialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<Task>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListTasksParams>,
) -> Result<Json<ListTasksResponse>, (StatusCode, String)> {
    let filter = match &params.status {
        None => None,
        Some(raw) => Some(TaskStatus::from_wire(raw).ok_or((
            StatusCode::BAD_REQUEST,
            format!("unknown task status: {raw}"),
        ))?),
    };
    let tasks = state.cluster.rsm().list_tasks(filter, params.limit).await;
    Ok(Json(ListTasksResponse { tasks }))
}

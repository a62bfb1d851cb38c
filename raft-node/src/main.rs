use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{delete, get, post};
use axum::Router;
use cluster::{NodeConfig, RaftCluster};
use manifest::Rsm;
use tokio::signal::unix::{signal, SignalKind};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

mod admin;
mod heartbeat;
mod node_service;
mod task_service;

use heartbeat::HeartbeatQueue;

const DEFAULT_CONFIG_PATH: &str = "/etc/raft/config.json";
const LEADER_ELECTION_WAIT: Duration = Duration::from_secs(30);
const HEARTBEAT_QUEUE_CAPACITY: usize = 1024;
const HEARTBEAT_DRAINERS: usize = 2;
const STALE_NODE_TIMEOUT_SECS: i64 = 30;
const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<RaftCluster>,
    pub heartbeats: Arc<HeartbeatQueue>,
}

/// Proposer-side clock. Timestamps enter the system here, never inside the
/// state machine.
pub fn epoch_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = config_path_from_args();
    info!(path = %config_path, "loading configuration");
    let node_config = NodeConfig::load(&config_path)?;
    let cluster_config = node_config.to_cluster_config()?;

    info!(
        node_id = node_config.node_id,
        cloud = %node_config.cloud_provider,
        region = %node_config.region,
        bind = %node_config.bind_address,
        "starting control plane node"
    );

    let rsm = Arc::new(Rsm::new());
    let cluster = Arc::new(RaftCluster::new(cluster_config, rsm).await?);

    let leader = cluster.wait_for_leader(LEADER_ELECTION_WAIT).await?;
    if cluster.is_leader().await {
        info!("this node is the leader");
    } else {
        info!(leader = %leader, "leader elected");
    }

    let heartbeats = HeartbeatQueue::new(HEARTBEAT_QUEUE_CAPACITY);
    heartbeats.spawn_drainers(cluster.clone(), HEARTBEAT_DRAINERS);
    spawn_stale_node_monitor(cluster.clone());

    let state = AppState {
        cluster: cluster.clone(),
        heartbeats,
    };
    let app = router(state)
        .layer(ConcurrencyLimitLayer::new(
            node_config.api.max_concurrent_streams as usize,
        ))
        .layer(CorsLayer::permissive()); // TODO: restrict origins for production deployments

    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", node_config.api.port)).await?;
    info!(port = node_config.api.port, "API server listening");

    // The API server drains in-flight handlers first; only then does the
    // cluster give up its stores and transport.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal()?)
        .await?;
    info!("API server stopped, shutting down cluster");
    cluster.shutdown().await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/v1/tasks",
            post(task_service::submit_task).get(task_service::list_tasks),
        )
        .route("/v1/tasks/:id", get(task_service::get_task))
        .route("/v1/tasks/:id/result", post(node_service::report_task_result))
        .route("/v1/nodes", get(node_service::list_nodes))
        .route("/v1/nodes/register", post(node_service::register_node))
        .route("/v1/nodes/heartbeat", post(node_service::heartbeat))
        .route("/v1/nodes/:id/poll", post(node_service::poll_task))
        .route("/admin/raft/stats", get(admin::raft_stats))
        .route("/admin/cluster/voters", post(admin::add_voter))
        .route("/admin/cluster/servers/:id", delete(admin::remove_server))
        .with_state(state)
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "healthy" }))
}

/// Logs HEALTHY nodes that stopped heartbeating. Leader-only and read-only:
/// there is deliberately no log entry that marks a node unhealthy, so this
/// is an operator signal rather than a state change.
fn spawn_stale_node_monitor(cluster: Arc<RaftCluster>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STALE_CHECK_INTERVAL);
        loop {
            ticker.tick().await;
            if !cluster.is_leader().await {
                continue;
            }
            let now = epoch_seconds();
            for node in cluster.rsm().stale_nodes(now, STALE_NODE_TIMEOUT_SECS).await {
                warn!(
                    node_id = %node.node_id,
                    last_heartbeat = node.last_heartbeat,
                    age_seconds = now - node.last_heartbeat,
                    "worker node heartbeat is stale"
                );
            }
        }
    });
}

fn config_path_from_args() -> String {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return path;
            }
        } else if let Some(path) = arg.strip_prefix("--config=") {
            return path.to_string();
        }
    }
    DEFAULT_CONFIG_PATH.to_string()
}

fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received");
    })
}

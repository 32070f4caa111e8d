//! System routes: identity, health, status, dashboard summary, metrics.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use skalds_controller::repository::TaskFilter;
use skalds_controller::runtime::{AdapterHealth, ComponentStatus};
use skalds_core::{SkaldKind, SkaldStatus, TaskLifecycleStatus};

use crate::error::ApiResult;
use crate::server::AppState;

/// Service identity served at `/`.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceIdentity {
    /// Service name.
    pub service: String,
    /// Crate version.
    pub version: String,
    /// Active run mode.
    pub mode: String,
}

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `healthy` iff all three adapters are reachable.
    pub status: String,
    /// Per-adapter reachability.
    #[schema(value_type = Object)]
    pub services: AdapterHealth,
}

/// System status response.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatusResponse {
    /// Active run mode.
    pub mode: String,
    /// Whether the controller loops are live.
    pub running: bool,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Per-component status.
    #[schema(value_type = Vec<Object>)]
    pub components: Vec<ComponentStatus>,
}

/// Dashboard summary counts.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    /// Registered skalds.
    pub total_skalds: usize,
    /// Skalds currently ONLINE.
    pub online_skalds: usize,
    /// Node-kind skalds.
    pub node_skalds: usize,
    /// Edge-kind skalds.
    pub edge_skalds: usize,
    /// Tasks in the document store.
    pub total_tasks: u64,
    /// Tasks currently Running.
    pub running_tasks: u64,
    /// Tasks currently Assigning.
    pub assigning_tasks: u64,
    /// Tasks that finished successfully.
    pub finished_tasks: u64,
    /// Tasks that failed.
    pub failed_tasks: u64,
    /// Tasks that were cancelled.
    pub cancelled_tasks: u64,
}

/// Creates system routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(identity))
        .route("/api/system/health", get(health))
        .route("/api/system/status", get(status))
        .route("/api/system/dashboard/summary", get(dashboard_summary))
        .route("/api/system/metrics", get(system_metrics))
}

/// Service identity.
#[utoipa::path(get, path = "/", responses((status = 200, body = ServiceIdentity)))]
pub(crate) async fn identity(State(state): State<Arc<AppState>>) -> Json<ServiceIdentity> {
    Json(ServiceIdentity {
        service: "skalds-system-controller".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        mode: state.controller.config().run_mode.to_string(),
    })
}

/// Adapter-level health.
#[utoipa::path(get, path = "/api/system/health", responses((status = 200, body = HealthResponse)))]
pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let services = state.controller.adapter_health().await;
    let status = if services.is_healthy() {
        "healthy"
    } else {
        "degraded"
    };
    Json(HealthResponse {
        status: status.to_string(),
        services,
    })
}

/// Run mode and per-component status.
#[utoipa::path(get, path = "/api/system/status", responses((status = 200, body = SystemStatusResponse)))]
pub(crate) async fn status(State(state): State<Arc<AppState>>) -> Json<SystemStatusResponse> {
    let controller = &state.controller;
    Json(SystemStatusResponse {
        mode: controller.config().run_mode.to_string(),
        running: controller.is_running(),
        uptime_secs: controller.uptime_secs(),
        components: controller.component_statuses(),
    })
}

async fn count_tasks(state: &AppState, statuses: Vec<TaskLifecycleStatus>) -> ApiResult<u64> {
    let filter = TaskFilter {
        statuses,
        ..TaskFilter::default()
    };
    let page = state.controller.repository().list_tasks(&filter, 1, 1).await?;
    Ok(page.total)
}

/// Fleet and task counts for the dashboard.
#[utoipa::path(get, path = "/api/system/dashboard/summary", responses((status = 200, body = DashboardSummary)))]
pub(crate) async fn dashboard_summary(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<DashboardSummary>> {
    let fleet = state.controller.skald_store().snapshot();
    let online_skalds = fleet
        .iter()
        .filter(|skald| skald.status == SkaldStatus::Online)
        .count();
    let node_skalds = fleet
        .iter()
        .filter(|skald| skald.kind == SkaldKind::Node)
        .count();

    Ok(Json(DashboardSummary {
        total_skalds: fleet.len(),
        online_skalds,
        node_skalds,
        edge_skalds: fleet.len() - node_skalds,
        total_tasks: count_tasks(&state, Vec::new()).await?,
        running_tasks: count_tasks(&state, vec![TaskLifecycleStatus::Running]).await?,
        assigning_tasks: count_tasks(&state, vec![TaskLifecycleStatus::Assigning]).await?,
        finished_tasks: count_tasks(&state, vec![TaskLifecycleStatus::Finished]).await?,
        failed_tasks: count_tasks(&state, vec![TaskLifecycleStatus::Failed]).await?,
        cancelled_tasks: count_tasks(&state, vec![TaskLifecycleStatus::Cancelled]).await?,
    }))
}

/// Detailed counts and utilization.
#[utoipa::path(get, path = "/api/system/metrics", responses((status = 200)))]
pub(crate) async fn system_metrics(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let fleet = state.controller.skald_store().snapshot();
    let monitored = state.controller.task_store().snapshot();

    let online: Vec<_> = fleet
        .iter()
        .filter(|skald| skald.status == SkaldStatus::Online)
        .collect();
    let nodes: Vec<_> = fleet
        .iter()
        .filter(|skald| skald.kind == SkaldKind::Node)
        .collect();
    let available_nodes: Vec<_> = nodes
        .iter()
        .filter(|skald| skald.status == SkaldStatus::Online)
        .collect();
    let busy_nodes = available_nodes
        .iter()
        .filter(|skald| skald.task_count() > 0)
        .count();

    let total_claimed: usize = fleet.iter().map(|skald| skald.task_count()).sum();
    #[allow(clippy::cast_precision_loss)]
    let average_tasks_per_skald = if online.is_empty() {
        0.0
    } else {
        total_claimed as f64 / online.len() as f64
    };

    let task_distribution: serde_json::Map<String, serde_json::Value> = available_nodes
        .iter()
        .map(|skald| {
            (
                skald.id.to_string(),
                serde_json::Value::from(skald.task_count()),
            )
        })
        .collect();

    let running = monitored
        .iter()
        .filter(|task| task.lifecycle_status == TaskLifecycleStatus::Running)
        .count();

    #[allow(clippy::cast_precision_loss)]
    let utilization = |part: usize, whole: usize| -> f64 {
        if whole == 0 {
            0.0
        } else {
            (part as f64 / whole as f64 * 100.0 * 100.0).round() / 100.0
        }
    };

    Ok(Json(serde_json::json!({
        "timestamp": chrono::Utc::now().timestamp_millis().to_string(),
        "skalds": {
            "total": fleet.len(),
            "online": online.len(),
            "offline": fleet.len() - online.len(),
            "nodes": nodes.len(),
            "edges": fleet.len() - nodes.len(),
            "availableNodes": available_nodes.len(),
            "busyNodes": busy_nodes,
            "idleNodes": available_nodes.len() - busy_nodes,
        },
        "tasks": {
            "monitored": monitored.len(),
            "running": running,
            "assigning": monitored.len() - running,
            "totalClaimed": total_claimed,
        },
        "performance": {
            "averageTasksPerSkald": average_tasks_per_skald,
            "taskDistribution": task_distribution,
            "skaldUtilization": utilization(online.len(), fleet.len()),
            "nodeUtilization": utilization(busy_nodes, available_nodes.len()),
        },
    })))
}

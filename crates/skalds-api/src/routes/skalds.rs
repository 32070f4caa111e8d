//! Skald query routes, served from the live fleet view.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use skalds_controller::state::SkaldRecord;
use skalds_core::{SkaldId, SkaldKind, SkaldStatus};

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// One skald in API responses.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SkaldResponse {
    /// Skald identifier.
    pub id: String,
    /// Deployment kind (`Node` / `Edge`).
    pub kind: String,
    /// Derived liveness (`Online` / `Offline`).
    pub status: String,
    /// Last-active instant, epoch millis as a string.
    pub last_active: String,
    /// Last observed heartbeat counter.
    pub heartbeat: i32,
    /// Advertised task classes.
    pub supported_task_types: Vec<String>,
    /// Claimed task ids.
    pub current_tasks: Vec<String>,
    /// Claimed task count.
    pub task_count: usize,
}

impl From<&SkaldRecord> for SkaldResponse {
    fn from(record: &SkaldRecord) -> Self {
        Self {
            id: record.id.to_string(),
            kind: record.kind.to_string(),
            status: record.status.to_string(),
            last_active: record.last_active.timestamp_millis().to_string(),
            heartbeat: record.heartbeat,
            supported_task_types: record.supported_task_types.iter().cloned().collect(),
            current_tasks: record
                .current_tasks
                .iter()
                .map(ToString::to_string)
                .collect(),
            task_count: record.task_count(),
        }
    }
}

/// Filters for the skald list.
#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct ListSkaldsQuery {
    /// Filter by kind (`node` / `edge`).
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Filter by status (`online` / `offline`).
    pub status: Option<String>,
}

/// Skald list response.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListSkaldsResponse {
    /// Matching skalds.
    pub items: Vec<SkaldResponse>,
    /// Matching count.
    pub total: usize,
}

/// Creates skald routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/skalds", get(list_skalds))
        .route("/api/skalds/summary/statistics", get(summary_statistics))
        .route("/api/skalds/{id}", get(get_skald))
        .route("/api/skalds/{id}/tasks", get(get_skald_tasks))
        .route("/api/skalds/{id}/status", get(get_skald_status))
}

fn parse_kind(raw: &str) -> ApiResult<SkaldKind> {
    SkaldKind::parse(raw).map_err(|_| ApiError::validation(format!("unknown skald type: {raw}")))
}

fn parse_status(raw: &str) -> ApiResult<SkaldStatus> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "online" => Ok(SkaldStatus::Online),
        "offline" => Ok(SkaldStatus::Offline),
        other => Err(ApiError::validation(format!(
            "unknown skald status: {other}"
        ))),
    }
}

fn lookup(state: &AppState, id: &str) -> ApiResult<SkaldRecord> {
    let id = SkaldId::new(id).map_err(|_| ApiError::validation("skald id cannot be empty"))?;
    state
        .controller
        .skald_store()
        .get(&id)
        .ok_or_else(|| ApiError::skald_not_found(&id))
}

/// Lists skalds, optionally filtered by kind and status.
#[utoipa::path(
    get,
    path = "/api/skalds",
    params(ListSkaldsQuery),
    responses((status = 200, body = ListSkaldsResponse))
)]
pub(crate) async fn list_skalds(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSkaldsQuery>,
) -> ApiResult<Json<ListSkaldsResponse>> {
    let kind = query.kind.as_deref().map(parse_kind).transpose()?;
    let status = query.status.as_deref().map(parse_status).transpose()?;

    let mut records: Vec<SkaldRecord> = state
        .controller
        .skald_store()
        .snapshot()
        .into_iter()
        .filter(|record| kind.is_none_or(|kind| record.kind == kind))
        .filter(|record| status.is_none_or(|status| record.status == status))
        .collect();
    records.sort_by(|a, b| a.id.cmp(&b.id));

    let items: Vec<SkaldResponse> = records.iter().map(SkaldResponse::from).collect();
    Ok(Json(ListSkaldsResponse {
        total: items.len(),
        items,
    }))
}

/// Gets one skald.
#[utoipa::path(
    get,
    path = "/api/skalds/{id}",
    responses((status = 200, body = SkaldResponse), (status = 404))
)]
pub(crate) async fn get_skald(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SkaldResponse>> {
    let record = lookup(&state, &id)?;
    Ok(Json(SkaldResponse::from(&record)))
}

/// Gets the task ids a skald claims.
#[utoipa::path(
    get,
    path = "/api/skalds/{id}/tasks",
    responses((status = 200), (status = 404))
)]
pub(crate) async fn get_skald_tasks(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = lookup(&state, &id)?;
    let tasks: Vec<String> = record
        .current_tasks
        .iter()
        .map(ToString::to_string)
        .collect();
    Ok(Json(serde_json::json!({
        "skaldId": record.id.to_string(),
        "tasks": tasks,
        "taskCount": record.task_count(),
    })))
}

/// Gets a skald's liveness.
#[utoipa::path(
    get,
    path = "/api/skalds/{id}/status",
    responses((status = 200), (status = 404))
)]
pub(crate) async fn get_skald_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = lookup(&state, &id)?;
    Ok(Json(serde_json::json!({
        "skaldId": record.id.to_string(),
        "status": record.status.to_string(),
        "lastActive": record.last_active.timestamp_millis().to_string(),
        "heartbeat": record.heartbeat,
    })))
}

/// Fleet-wide statistics.
#[utoipa::path(get, path = "/api/skalds/summary/statistics", responses((status = 200)))]
pub(crate) async fn summary_statistics(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let fleet = state.controller.skald_store().snapshot();

    let online = fleet
        .iter()
        .filter(|record| record.status == SkaldStatus::Online)
        .count();
    let nodes = fleet
        .iter()
        .filter(|record| record.kind == SkaldKind::Node)
        .count();
    let busy = fleet
        .iter()
        .filter(|record| record.status == SkaldStatus::Online && record.task_count() > 0)
        .count();
    let total_claimed: usize = fleet.iter().map(SkaldRecord::task_count).sum();

    let distribution: serde_json::Map<String, serde_json::Value> = fleet
        .iter()
        .map(|record| {
            (
                record.id.to_string(),
                serde_json::Value::from(record.task_count()),
            )
        })
        .collect();

    Ok(Json(serde_json::json!({
        "totalSkalds": fleet.len(),
        "onlineSkalds": online,
        "offlineSkalds": fleet.len() - online,
        "nodeSkalds": nodes,
        "edgeSkalds": fleet.len() - nodes,
        "busySkalds": busy,
        "idleSkalds": online.saturating_sub(busy),
        "totalClaimedTasks": total_claimed,
        "taskDistribution": distribution,
    })))
}

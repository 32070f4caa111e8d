//! OpenAPI document for the controller API.

use axum::Json;
use utoipa::OpenApi;

use crate::error::ApiErrorBody;
use crate::routes::skalds::{ListSkaldsResponse, SkaldResponse};
use crate::routes::system::{
    DashboardSummary, HealthResponse, ServiceIdentity, SystemStatusResponse,
};
use crate::routes::tasks::{
    ListTasksResponse, TaskHeartbeatResponse, TaskResponse, UpdateAttachmentsRequest,
    UpdateStatusRequest,
};

/// The OpenAPI document.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Skalds System Controller API",
        description = "Query and mutation surface of the Skalds task orchestration controller",
    ),
    paths(
        crate::routes::system::identity,
        crate::routes::system::health,
        crate::routes::system::status,
        crate::routes::system::dashboard_summary,
        crate::routes::system::system_metrics,
        crate::routes::skalds::list_skalds,
        crate::routes::skalds::get_skald,
        crate::routes::skalds::get_skald_tasks,
        crate::routes::skalds::get_skald_status,
        crate::routes::skalds::summary_statistics,
        crate::routes::tasks::list_tasks,
        crate::routes::tasks::get_task,
        crate::routes::tasks::get_task_heartbeat,
        crate::routes::tasks::update_task_status,
        crate::routes::tasks::update_task_attachments,
    ),
    components(schemas(
        ApiErrorBody,
        ServiceIdentity,
        HealthResponse,
        SystemStatusResponse,
        DashboardSummary,
        SkaldResponse,
        ListSkaldsResponse,
        TaskResponse,
        ListTasksResponse,
        TaskHeartbeatResponse,
        UpdateStatusRequest,
        UpdateAttachmentsRequest,
    ))
)]
pub struct ApiDoc;

/// Serves the OpenAPI document as JSON.
pub async fn serve_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

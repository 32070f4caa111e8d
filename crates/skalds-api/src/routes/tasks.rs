//! Task query and mutation routes.
//!
//! Reads serve from the document store and the monitored-task view;
//! mutations funnel through the repository CAS and the event bus so
//! every effective change lands on the log exactly once.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use skalds_controller::reconciler::cancel_task_external;
use skalds_controller::repository::TaskFilter;
use skalds_core::cache::keys;
use skalds_core::model::task::validate_attachments;
use skalds_core::{EventTopic, Task, TaskEventPayload, TaskId, TaskLifecycleStatus};

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

const DEFAULT_PAGE_SIZE: u32 = 20;

/// One task in API responses.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    /// Task identifier.
    pub id: String,
    /// Executor-side implementation class.
    pub class_name: String,
    /// Where the definition came from.
    pub source: String,
    /// Assigned executor, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    /// Delivery mode.
    pub mode: String,
    /// Lifecycle status.
    pub lifecycle_status: String,
    /// Dispatch priority.
    pub priority: u8,
    /// Parameter payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<serde_json::Value>,
    /// Informational dependencies.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Creation instant, epoch millis as a string.
    pub create_date_time: String,
    /// Last-update instant, epoch millis as a string.
    pub update_date_time: String,
    /// Deadline instant, epoch millis as a string.
    pub deadline_date_time: String,
    /// Opaque persistence flag.
    pub is_persistent: bool,
}

impl From<&Task> for TaskResponse {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.to_string(),
            class_name: task.class_name.clone(),
            source: task.source.clone(),
            executor: task.executor.as_ref().map(ToString::to_string),
            mode: task.mode.to_string(),
            lifecycle_status: task.lifecycle_status.to_string(),
            priority: task.priority,
            attachments: task.attachments.clone(),
            dependencies: task.dependencies.iter().map(ToString::to_string).collect(),
            create_date_time: task.create_date_time.timestamp_millis().to_string(),
            update_date_time: task.update_date_time.timestamp_millis().to_string(),
            deadline_date_time: task.deadline_date_time.timestamp_millis().to_string(),
            is_persistent: task.is_persistent,
        }
    }
}

/// Filters and pagination for the task list.
#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksQuery {
    /// 1-based page number.
    pub page: Option<u32>,
    /// Page size; clamped to the configured maximum.
    pub page_size: Option<u32>,
    /// Filter by lifecycle status.
    pub status: Option<String>,
    /// Filter by implementation class.
    #[serde(rename = "type")]
    pub class_name: Option<String>,
    /// Filter by assigned executor.
    pub executor: Option<String>,
}

/// Task list response.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksResponse {
    /// The tasks on this page.
    pub items: Vec<TaskResponse>,
    /// Total matching tasks.
    pub total: u64,
    /// The served page number.
    pub page: u32,
    /// The effective page size.
    pub page_size: u32,
}

/// Body for `PUT /api/tasks/{id}/status`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateStatusRequest {
    /// Requested status: `Created` (re-queue) or `Cancelled`.
    pub status: String,
}

/// Body for `PUT /api/tasks/{id}/attachments`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateAttachmentsRequest {
    /// Replacement parameter payload; must be a JSON object.
    pub attachments: serde_json::Value,
}

/// Volatile heartbeat view of one task.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskHeartbeatResponse {
    /// Task identifier.
    pub task_id: String,
    /// Latest heartbeat counter, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<i32>,
    /// Worker-reported error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Worker-reported exception.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    /// Lifecycle status at the last observation.
    pub lifecycle_status: String,
}

/// Creates task routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/heartbeat", get(get_task_heartbeat))
        .route("/api/tasks/{id}/status", put(update_task_status))
        .route("/api/tasks/{id}/attachments", put(update_task_attachments))
}

fn parse_task_id(raw: &str) -> ApiResult<TaskId> {
    TaskId::new(raw).map_err(|_| ApiError::validation("task id cannot be empty"))
}

async fn load_task(state: &AppState, id: &TaskId) -> ApiResult<Task> {
    state
        .controller
        .repository()
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::task_not_found(id))
}

/// Lists tasks, paginated and filtered.
#[utoipa::path(
    get,
    path = "/api/tasks",
    params(ListTasksQuery),
    responses((status = 200, body = ListTasksResponse), (status = 400))
)]
pub(crate) async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<ListTasksResponse>> {
    let page = query.page.unwrap_or(1);
    if page == 0 {
        return Err(ApiError::validation("page must be at least 1"));
    }
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if page_size == 0 {
        return Err(ApiError::validation("pageSize must be at least 1"));
    }
    // Oversized requests are clamped rather than rejected.
    let page_size = page_size.min(state.controller.config().page_size_max);

    let statuses = match query.status.as_deref() {
        Some(raw) => vec![
            TaskLifecycleStatus::parse(raw)
                .map_err(|_| ApiError::validation(format!("unknown status: {raw}")))?,
        ],
        None => Vec::new(),
    };
    let executor = query
        .executor
        .as_deref()
        .map(|raw| {
            skalds_core::SkaldId::new(raw)
                .map_err(|_| ApiError::validation("executor cannot be empty"))
        })
        .transpose()?;

    let filter = TaskFilter {
        statuses,
        class_name: query.class_name,
        executor,
        id: None,
    };
    let result = state
        .controller
        .repository()
        .list_tasks(&filter, page, page_size)
        .await?;

    Ok(Json(ListTasksResponse {
        items: result.items.iter().map(TaskResponse::from).collect(),
        total: result.total,
        page,
        page_size,
    }))
}

/// Gets one task document.
#[utoipa::path(
    get,
    path = "/api/tasks/{id}",
    responses((status = 200, body = TaskResponse), (status = 404))
)]
pub(crate) async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskResponse>> {
    let id = parse_task_id(&id)?;
    let task = load_task(&state, &id).await?;
    Ok(Json(TaskResponse::from(&task)))
}

/// Gets a task's volatile heartbeat view.
///
/// Serves from the monitored-task store when the task is live, falling
/// back to a direct cache read so terminal tasks still report their last
/// written values.
#[utoipa::path(
    get,
    path = "/api/tasks/{id}/heartbeat",
    responses((status = 200, body = TaskHeartbeatResponse), (status = 404))
)]
pub(crate) async fn get_task_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskHeartbeatResponse>> {
    let id = parse_task_id(&id)?;
    let task = load_task(&state, &id).await?;

    if let Some(record) = state.controller.task_store().get(&id) {
        return Ok(Json(TaskHeartbeatResponse {
            task_id: id.to_string(),
            heartbeat: record.heartbeat,
            error: record.error,
            exception: record.exception,
            lifecycle_status: record.lifecycle_status.to_string(),
        }));
    }

    let cache = state.controller.cache();
    let heartbeat = cache
        .get_string(&keys::task_heartbeat(&id))
        .await
        .map_err(skalds_controller::error::Error::Core)?
        .and_then(|raw| raw.trim().parse::<i32>().ok());
    let error = cache
        .get_string(&keys::task_error(&id))
        .await
        .map_err(skalds_controller::error::Error::Core)?
        .filter(|raw| !raw.is_empty());
    let exception = cache
        .get_string(&keys::task_exception(&id))
        .await
        .map_err(skalds_controller::error::Error::Core)?
        .filter(|raw| !raw.is_empty());

    Ok(Json(TaskHeartbeatResponse {
        task_id: id.to_string(),
        heartbeat,
        error,
        exception,
        lifecycle_status: task.lifecycle_status.to_string(),
    }))
}

/// Updates a task's lifecycle status.
///
/// `Cancelled` cancels any non-terminal task and emits one `task.cancel`
/// event per effective transition; repeating the request is a no-op.
/// `Created` re-queues a `Paused` task for dispatch.
#[utoipa::path(
    put,
    path = "/api/tasks/{id}/status",
    request_body = UpdateStatusRequest,
    responses((status = 200, body = TaskResponse), (status = 400), (status = 404))
)]
pub(crate) async fn update_task_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateStatusRequest>,
) -> ApiResult<Json<TaskResponse>> {
    let id = parse_task_id(&id)?;
    let requested = TaskLifecycleStatus::parse(&body.status)
        .map_err(|_| ApiError::validation(format!("unknown status: {}", body.status)))?;
    let task = load_task(&state, &id).await?;
    let current = task.lifecycle_status;

    match requested {
        TaskLifecycleStatus::Cancelled => {
            if current == TaskLifecycleStatus::Cancelled {
                // Idempotent repeat: no transition, no event.
                return Ok(Json(TaskResponse::from(&task)));
            }
            if current.is_terminal() {
                return Err(ApiError::invalid_status(format!(
                    "cannot cancel a {current} task"
                )));
            }
            cancel_task_external(state.controller.repository(), state.controller.events(), &id)
                .await?;
        }
        TaskLifecycleStatus::Created => {
            if current == TaskLifecycleStatus::Created {
                return Ok(Json(TaskResponse::from(&task)));
            }
            if current != TaskLifecycleStatus::Paused {
                return Err(ApiError::invalid_status(format!(
                    "only Paused tasks can be re-queued (task is {current})"
                )));
            }
            state
                .controller
                .repository()
                .update_lifecycle_status(
                    &id,
                    TaskLifecycleStatus::Created,
                    &[TaskLifecycleStatus::Paused],
                )
                .await?;
        }
        other => {
            return Err(ApiError::invalid_status(format!(
                "status {other} cannot be set externally"
            )));
        }
    }

    let task = load_task(&state, &id).await?;
    Ok(Json(TaskResponse::from(&task)))
}

/// Replaces a task's attachment payload and notifies executors.
#[utoipa::path(
    put,
    path = "/api/tasks/{id}/attachments",
    request_body = UpdateAttachmentsRequest,
    responses((status = 200, body = TaskResponse), (status = 400), (status = 404))
)]
pub(crate) async fn update_task_attachments(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateAttachmentsRequest>,
) -> ApiResult<Json<TaskResponse>> {
    let id = parse_task_id(&id)?;
    validate_attachments(&body.attachments)
        .map_err(|e| ApiError::validation(e.to_string()))?;

    // 404 before mutation so a missing task never emits an event.
    load_task(&state, &id).await?;
    state
        .controller
        .repository()
        .update_attachments(&id, body.attachments)
        .await?;

    let task = load_task(&state, &id).await?;
    state
        .controller
        .events()
        .publish(
            EventTopic::TaskUpdateAttachment,
            &TaskEventPayload::update_attachment(
                id.clone(),
                task.create_date_time,
                task.update_date_time,
            ),
        )
        .await?;

    Ok(Json(TaskResponse::from(&task)))
}

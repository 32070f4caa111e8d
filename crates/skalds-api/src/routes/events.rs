//! Server-push streams over the state stores.
//!
//! Each client subscription holds a broadcast receiver on the relevant
//! store; every record change matching the optional id filter becomes one
//! SSE message. Comment keep-alives hold the connection through proxies.
//! A client that falls more than the configured queue depth behind is
//! closed with reason `slow_consumer` instead of blocking the producer.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use metrics::gauge;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use skalds_controller::metrics::names;
use skalds_controller::state::{SkaldStoreEvent, TaskStoreEvent};

use crate::routes::skalds::SkaldResponse;
use crate::server::AppState;

/// Filter for the skald stream.
#[derive(Debug, Deserialize)]
pub struct SkaldStreamQuery {
    /// Only push changes for this skald.
    pub skald_id: Option<String>,
}

/// Filter for the task stream.
#[derive(Debug, Deserialize)]
pub struct TaskStreamQuery {
    /// Only push changes for this task.
    pub task_id: Option<String>,
}

/// Creates event-stream routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/events/skalds", get(skald_events))
        .route("/api/events/tasks", get(task_events))
        .route("/api/events/status", get(stream_status))
}

// Counts a connected client for as long as the stream is held.
struct ClientGuard(Arc<AtomicUsize>);

impl ClientGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        let connected = counter.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!(names::SSE_CONNECTED_CLIENTS).set(connected as f64);
        Self(counter)
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let connected = self.0.fetch_sub(1, Ordering::SeqCst) - 1;
        gauge!(names::SSE_CONNECTED_CLIENTS).set(connected as f64);
    }
}

fn slow_consumer_event() -> Event {
    Event::default().event("error").data("slow_consumer")
}

/// Skald status/heartbeat stream.
async fn skald_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SkaldStreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut receiver = state.controller.skald_store().subscribe();
    let guard = ClientGuard::new(Arc::clone(&state.sse_clients));
    let filter = query.skald_id;

    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            match receiver.recv().await {
                Ok(SkaldStoreEvent::Updated(record)) => {
                    if filter.as_deref().is_some_and(|id| record.id.as_str() != id) {
                        continue;
                    }
                    if let Ok(event) = Event::default()
                        .event("skald_update")
                        .json_data(SkaldResponse::from(&record))
                    {
                        yield Ok(event);
                    }
                }
                Ok(SkaldStoreEvent::Removed(id)) => {
                    if filter.as_deref().is_some_and(|wanted| id.as_str() != wanted) {
                        continue;
                    }
                    if let Ok(event) = Event::default()
                        .event("skald_removed")
                        .json_data(serde_json::json!({ "id": id.to_string() }))
                    {
                        yield Ok(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "dropping slow skald-stream consumer");
                    yield Ok(slow_consumer_event());
                    break;
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(keep_alive(&state))
}

/// Task heartbeat/error/exception stream.
async fn task_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TaskStreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut receiver = state.controller.task_store().subscribe();
    let guard = ClientGuard::new(Arc::clone(&state.sse_clients));
    let filter = query.task_id;

    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            match receiver.recv().await {
                Ok(TaskStoreEvent::Updated(record)) => {
                    if filter.as_deref().is_some_and(|id| record.id.as_str() != id) {
                        continue;
                    }
                    if let Ok(event) = Event::default()
                        .event("task_update")
                        .json_data(&record)
                    {
                        yield Ok(event);
                    }
                }
                Ok(TaskStoreEvent::Removed(id)) => {
                    if filter.as_deref().is_some_and(|wanted| id.as_str() != wanted) {
                        continue;
                    }
                    if let Ok(event) = Event::default()
                        .event("task_removed")
                        .json_data(serde_json::json!({ "id": id.to_string() }))
                    {
                        yield Ok(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "dropping slow task-stream consumer");
                    yield Ok(slow_consumer_event());
                    break;
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(keep_alive(&state))
}

fn keep_alive(state: &AppState) -> KeepAlive {
    KeepAlive::new()
        .interval(state.controller.config().sse_keepalive_interval)
        .text("keep-alive")
}

/// Connected-client count.
async fn stream_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "connectedClients": state.sse_clients.load(Ordering::SeqCst),
        "status": "ok",
    }))
}

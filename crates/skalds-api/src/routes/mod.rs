//! HTTP route handlers.

pub mod events;
pub mod skalds;
pub mod system;
pub mod tasks;

use std::sync::Arc;

use axum::Router;

use crate::server::AppState;

/// All `/api` routes plus the service-identity root.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(system::routes())
        .merge(skalds::routes())
        .merge(tasks::routes())
        .merge(events::routes())
}

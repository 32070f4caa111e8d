//! API server assembly.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use axum::Router;
use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::middleware;
use axum::routing::get;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use skalds_controller::runtime::SystemController;

use crate::error::{ApiErrorBody, ServerError};
use crate::metrics::{metrics_middleware, serve_metrics};
use crate::openapi::serve_openapi;
use crate::routes;

const HTTP_HANDLER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Shared application state for all request handlers.
pub struct AppState {
    /// The composed controller this process serves.
    pub controller: Arc<SystemController>,
    /// Live server-push client count.
    pub sse_clients: Arc<AtomicUsize>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

/// The Skalds API server.
pub struct Server {
    controller: Arc<SystemController>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("controller", &self.controller)
            .finish()
    }
}

fn panic_response(
    _err: Box<dyn std::any::Any + Send + 'static>,
) -> axum::http::Response<Body> {
    // Panic payloads never reach clients.
    let body = serde_json::to_vec(&ApiErrorBody {
        error: "internal error".to_string(),
        detail: None,
        code: "INTERNAL".to_string(),
        timestamp: chrono::Utc::now().timestamp_millis().to_string(),
    })
    .unwrap_or_default();

    axum::http::Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| axum::http::Response::new(Body::empty()))
}

impl Server {
    /// Creates a server over the given controller.
    #[must_use]
    pub fn new(controller: Arc<SystemController>) -> Self {
        Self { controller }
    }

    /// Creates the router with all routes and middleware.
    #[must_use]
    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            controller: Arc::clone(&self.controller),
            sse_clients: Arc::new(AtomicUsize::new(0)),
        });

        Router::new()
            .merge(routes::api_routes())
            .route("/metrics", get(serve_metrics))
            .route("/api/openapi.json", get(serve_openapi))
            // Authentication is deliberately absent; the API is expected
            // to sit behind a private network boundary.
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(HTTP_HANDLER_TIMEOUT))
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(middleware::from_fn(metrics_middleware))
            .with_state(state)
    }

    /// Binds and serves until the shutdown future resolves, then lets
    /// in-flight requests drain.
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be bound (fatal at startup) or
    /// the server fails while running.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let config = self.controller.config();
        let raw_addr = format!("{}:{}", config.host, config.port);
        let addr: SocketAddr = raw_addr.parse().map_err(|e| ServerError::InvalidBindAddress {
            addr: raw_addr.clone(),
            message: format!("{e}"),
        })?;

        let router = self.router();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        tracing::info!(%addr, "http server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|source| ServerError::Serve { source })
    }
}

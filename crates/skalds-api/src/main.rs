//! `skalds-api` binary entrypoint.
//!
//! Loads configuration from environment variables, connects the three
//! external adapters (fatal on failure, per the startup contract), starts
//! the controller loops for the configured run mode, and serves HTTP
//! until interrupted. Shutdown drains HTTP first, then the controller
//! stages in order.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;

use anyhow::{Context, Result};

use skalds_api::Server;
use skalds_api::metrics::init_metrics;
use skalds_controller::config::Config;
use skalds_controller::events::{EventBus, KafkaEventBus};
use skalds_controller::repository::{MongoTaskRepository, TaskRepository};
use skalds_controller::runtime::SystemController;
use skalds_core::observability::init_logging;
use skalds_core::{CacheBackend, RedisCacheBackend};

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    init_logging(config.log_format);
    init_metrics();

    tracing::info!(
        mode = %config.run_mode,
        instance = %config.instance_id,
        "starting skalds system controller"
    );

    let cache: Arc<dyn CacheBackend> = Arc::new(
        RedisCacheBackend::connect(&config.redis_url, config.cache_op_timeout)
            .await
            .context("initial cache connection failed")?,
    );
    let repository: Arc<dyn TaskRepository> = Arc::new(
        MongoTaskRepository::connect(&config.mongo_url, &config.mongo_db, config.store_op_timeout)
            .await
            .context("initial store connection failed")?,
    );
    let events: Arc<dyn EventBus> = Arc::new(
        KafkaEventBus::connect(
            &config.kafka_brokers,
            config.kafka_username.as_deref(),
            config.kafka_password.as_deref(),
            config.event_publish_timeout,
        )
        .context("initial event log connection failed")?,
    );

    let controller = Arc::new(SystemController::with_system_clock(
        config, cache, repository, events,
    ));
    controller.start();

    let server = Server::new(Arc::clone(&controller));
    let result = server.serve(shutdown_signal()).await;

    controller.shutdown().await;
    result.context("http server failed")
}

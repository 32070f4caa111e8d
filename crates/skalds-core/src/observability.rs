//! Observability infrastructure for Skalds.
//!
//! Structured logging with consistent spans across all controller
//! components. This module provides initialization helpers and span
//! constructors.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name (`"json"` / `"pretty"`, case-insensitive).
    /// Unknown values fall back to `Pretty`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops. Levels are controlled via `RUST_LOG`.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for a controller loop cycle.
#[must_use]
pub fn cycle_span(component: &str) -> Span {
    tracing::info_span!("cycle", component = component)
}

/// Creates a span for a task lifecycle operation.
#[must_use]
pub fn task_span(operation: &str, task_id: &str) -> Span {
    tracing::info_span!("task", op = operation, task_id = task_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn format_parse_defaults_to_pretty() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("yaml"), LogFormat::Pretty);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = cycle_span("skald_monitor");
        let _guard = span.enter();
        tracing::info!("test message in span");

        let span = task_span("transition", "t-1");
        let _guard = span.enter();
        tracing::debug!("transition message");
    }
}

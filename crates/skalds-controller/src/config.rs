//! Controller configuration.
//!
//! All settings are loaded from `SKALDS_*` environment variables with
//! defaults; a value that is present but unparsable fails startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use skalds_core::observability::LogFormat;

/// Which component set this process runs.
///
/// Modes compose additively: `Monitor` includes everything `Controller`
/// runs, and `Dispatcher` includes everything `Monitor` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// State stores, event fanout, and the query API only.
    Controller,
    /// Controller plus the skald/task monitors and the reconciler.
    Monitor,
    /// Monitor plus the dispatcher.
    Dispatcher,
}

impl RunMode {
    /// Returns true if the monitors and reconciler run in this mode.
    #[must_use]
    pub const fn runs_monitors(self) -> bool {
        matches!(self, Self::Monitor | Self::Dispatcher)
    }

    /// Returns true if the dispatcher runs in this mode.
    #[must_use]
    pub const fn runs_dispatcher(self) -> bool {
        matches!(self, Self::Dispatcher)
    }

    /// Returns the lowercase mode label.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Monitor => "monitor",
            Self::Dispatcher => "dispatcher",
        }
    }
}

impl Default for RunMode {
    fn default() -> Self {
        Self::Controller
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// The dispatch balancing policy selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicyKind {
    /// Pick the candidate with the fewest current tasks.
    LeastTasks,
    /// Rotate a cursor across candidates.
    RoundRobin,
    /// Uniform choice, seeded per tick.
    Random,
}

impl Default for DispatchPolicyKind {
    fn default() -> Self {
        Self::LeastTasks
    }
}

/// Configuration for the Skalds system controller.
#[derive(Debug, Clone)]
pub struct Config {
    /// Run mode (component composition).
    pub run_mode: RunMode,
    /// HTTP bind host.
    pub host: String,
    /// HTTP bind port.
    pub port: u16,

    /// Cache endpoint (`redis://...`).
    pub redis_url: String,
    /// Document store endpoint (`mongodb://...`).
    pub mongo_url: String,
    /// Document store database name.
    pub mongo_db: String,
    /// Event log bootstrap servers (`host:port[,host:port]`).
    pub kafka_brokers: String,
    /// Optional SASL username for the event log.
    pub kafka_username: Option<String>,
    /// Optional SASL password for the event log.
    pub kafka_password: Option<String>,

    /// Skald monitor cycle interval.
    pub skald_sync_interval: Duration,
    /// Task monitor cycle interval.
    pub task_sync_interval: Duration,
    /// Dispatcher tick interval.
    pub dispatch_interval: Duration,
    /// Server-push keep-alive interval.
    pub sse_keepalive_interval: Duration,

    /// A skald whose last-active exceeds this is OFFLINE.
    pub skald_stale_threshold: Duration,
    /// A skald absent from the registry for longer than this is evicted.
    pub skald_evict_threshold: Duration,
    /// Consecutive identical heartbeat samples that force a failure.
    pub stuck_window: usize,
    /// How long an ASSIGNING task may wait for its first heartbeat.
    pub assignment_timeout: Duration,
    /// Minimum spacing of repeated orphan cancels per (skald, task) pair;
    /// zero means once per monitor cycle.
    pub orphan_cancel_interval: Duration,

    /// Dispatch balancing policy.
    pub dispatch_policy: DispatchPolicyKind,
    /// Maximum page size served by the query API.
    pub page_size_max: u32,
    /// Server-push queue depth before a client is dropped as slow.
    pub sse_backpressure_high: usize,
    /// Per-stage drain bound during shutdown.
    pub shutdown_grace: Duration,

    /// Cache per-operation deadline.
    pub cache_op_timeout: Duration,
    /// Repository per-operation deadline.
    pub store_op_timeout: Duration,
    /// Event publish deadline.
    pub event_publish_timeout: Duration,

    /// Log output format.
    pub log_format: LogFormat,
    /// Identifier stamped as the `initiator` of produced events.
    pub instance_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Controller,
            host: "0.0.0.0".to_string(),
            port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            mongo_url: "mongodb://localhost:27017".to_string(),
            mongo_db: "skalds".to_string(),
            kafka_brokers: "localhost:9092".to_string(),
            kafka_username: None,
            kafka_password: None,
            skald_sync_interval: Duration::from_secs(5),
            task_sync_interval: Duration::from_secs(3),
            dispatch_interval: Duration::from_secs(5),
            sse_keepalive_interval: Duration::from_secs(15),
            skald_stale_threshold: Duration::from_secs(10),
            skald_evict_threshold: Duration::from_secs(30),
            stuck_window: 5,
            assignment_timeout: Duration::from_secs(30),
            orphan_cancel_interval: Duration::ZERO,
            dispatch_policy: DispatchPolicyKind::LeastTasks,
            page_size_max: 100,
            sse_backpressure_high: 256,
            shutdown_grace: Duration::from_secs(10),
            cache_op_timeout: Duration::from_secs(1),
            store_op_timeout: Duration::from_secs(3),
            event_publish_timeout: Duration::from_secs(2),
            log_format: LogFormat::Pretty,
            instance_id: format!("skalds-controller-{}", ulid::Ulid::new()),
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Supported env vars:
    /// - `SKALDS_RUN_MODE` (`controller` | `monitor` | `dispatcher`)
    /// - `SKALDS_HOST`, `SKALDS_PORT`
    /// - `SKALDS_REDIS_URL`
    /// - `SKALDS_MONGO_URL`, `SKALDS_MONGO_DB`
    /// - `SKALDS_KAFKA_BROKERS`, `SKALDS_KAFKA_USERNAME`, `SKALDS_KAFKA_PASSWORD`
    /// - `SKALDS_SKALD_SYNC_INTERVAL_SECS`, `SKALDS_TASK_SYNC_INTERVAL_SECS`
    /// - `SKALDS_DISPATCH_INTERVAL_SECS`, `SKALDS_SSE_KEEPALIVE_SECS`
    /// - `SKALDS_SKALD_STALE_THRESHOLD_SECS`, `SKALDS_SKALD_EVICT_THRESHOLD_SECS`
    /// - `SKALDS_STUCK_WINDOW`, `SKALDS_ASSIGNMENT_TIMEOUT_SECS`
    /// - `SKALDS_ORPHAN_CANCEL_INTERVAL_SECS`
    /// - `SKALDS_DISPATCH_POLICY` (`least_tasks` | `round_robin` | `random`)
    /// - `SKALDS_PAGE_SIZE_MAX`, `SKALDS_SSE_BACKPRESSURE_HIGH`
    /// - `SKALDS_SHUTDOWN_GRACE_SECS`
    /// - `SKALDS_CACHE_OP_TIMEOUT_MS`, `SKALDS_STORE_OP_TIMEOUT_MS`,
    ///   `SKALDS_EVENT_PUBLISH_TIMEOUT_MS`
    /// - `SKALDS_LOG_FORMAT` (`pretty` | `json`), `SKALDS_INSTANCE_ID`
    ///
    /// # Errors
    ///
    /// Returns an error if any variable is present but cannot be parsed,
    /// or if the resulting configuration is invalid.
    #[allow(clippy::too_many_lines)]
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(mode) = env_string("SKALDS_RUN_MODE") {
            config.run_mode = parse_run_mode(&mode)?;
        }
        if let Some(host) = env_string("SKALDS_HOST") {
            config.host = host;
        }
        if let Some(port) = env_u16("SKALDS_PORT")? {
            config.port = port;
        }

        if let Some(url) = env_string("SKALDS_REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(url) = env_string("SKALDS_MONGO_URL") {
            config.mongo_url = url;
        }
        if let Some(db) = env_string("SKALDS_MONGO_DB") {
            config.mongo_db = db;
        }
        if let Some(brokers) = env_string("SKALDS_KAFKA_BROKERS") {
            config.kafka_brokers = brokers;
        }
        config.kafka_username = env_string("SKALDS_KAFKA_USERNAME");
        config.kafka_password = env_string("SKALDS_KAFKA_PASSWORD");

        if let Some(secs) = env_u64("SKALDS_SKALD_SYNC_INTERVAL_SECS")? {
            config.skald_sync_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("SKALDS_TASK_SYNC_INTERVAL_SECS")? {
            config.task_sync_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("SKALDS_DISPATCH_INTERVAL_SECS")? {
            config.dispatch_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("SKALDS_SSE_KEEPALIVE_SECS")? {
            config.sse_keepalive_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("SKALDS_SKALD_STALE_THRESHOLD_SECS")? {
            config.skald_stale_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("SKALDS_SKALD_EVICT_THRESHOLD_SECS")? {
            config.skald_evict_threshold = Duration::from_secs(secs);
        }
        if let Some(window) = env_u64("SKALDS_STUCK_WINDOW")? {
            config.stuck_window = usize::try_from(window)
                .map_err(|_| Error::configuration("SKALDS_STUCK_WINDOW out of range"))?;
        }
        if let Some(secs) = env_u64("SKALDS_ASSIGNMENT_TIMEOUT_SECS")? {
            config.assignment_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("SKALDS_ORPHAN_CANCEL_INTERVAL_SECS")? {
            config.orphan_cancel_interval = Duration::from_secs(secs);
        }
        if let Some(policy) = env_string("SKALDS_DISPATCH_POLICY") {
            config.dispatch_policy = parse_dispatch_policy(&policy)?;
        }
        if let Some(max) = env_u64("SKALDS_PAGE_SIZE_MAX")? {
            config.page_size_max = u32::try_from(max)
                .map_err(|_| Error::configuration("SKALDS_PAGE_SIZE_MAX out of range"))?;
        }
        if let Some(high) = env_u64("SKALDS_SSE_BACKPRESSURE_HIGH")? {
            config.sse_backpressure_high = usize::try_from(high)
                .map_err(|_| Error::configuration("SKALDS_SSE_BACKPRESSURE_HIGH out of range"))?;
        }
        if let Some(secs) = env_u64("SKALDS_SHUTDOWN_GRACE_SECS")? {
            config.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(ms) = env_u64("SKALDS_CACHE_OP_TIMEOUT_MS")? {
            config.cache_op_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("SKALDS_STORE_OP_TIMEOUT_MS")? {
            config.store_op_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("SKALDS_EVENT_PUBLISH_TIMEOUT_MS")? {
            config.event_publish_timeout = Duration::from_millis(ms);
        }
        if let Some(format) = env_string("SKALDS_LOG_FORMAT") {
            config.log_format = LogFormat::parse(&format);
        }
        if let Some(id) = env_string("SKALDS_INSTANCE_ID") {
            config.instance_id = id;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error if any interval is zero, the stuck window is too
    /// small, or the evict threshold is under twice the stale threshold.
    pub fn validate(&self) -> Result<()> {
        for (name, interval) in [
            ("SKALDS_SKALD_SYNC_INTERVAL_SECS", self.skald_sync_interval),
            ("SKALDS_TASK_SYNC_INTERVAL_SECS", self.task_sync_interval),
            ("SKALDS_DISPATCH_INTERVAL_SECS", self.dispatch_interval),
            ("SKALDS_SSE_KEEPALIVE_SECS", self.sse_keepalive_interval),
            (
                "SKALDS_SKALD_STALE_THRESHOLD_SECS",
                self.skald_stale_threshold,
            ),
            ("SKALDS_ASSIGNMENT_TIMEOUT_SECS", self.assignment_timeout),
        ] {
            if interval.is_zero() {
                return Err(Error::configuration(format!("{name} must be positive")));
            }
        }
        if self.stuck_window < 2 {
            return Err(Error::configuration(
                "SKALDS_STUCK_WINDOW must be at least 2",
            ));
        }
        if self.skald_evict_threshold < self.skald_stale_threshold * 2 {
            return Err(Error::configuration(
                "SKALDS_SKALD_EVICT_THRESHOLD_SECS must be at least twice the stale threshold",
            ));
        }
        if self.page_size_max == 0 {
            return Err(Error::configuration("SKALDS_PAGE_SIZE_MAX must be positive"));
        }
        if self.sse_backpressure_high == 0 {
            return Err(Error::configuration(
                "SKALDS_SSE_BACKPRESSURE_HIGH must be positive",
            ));
        }
        Ok(())
    }
}

fn parse_run_mode(value: &str) -> Result<RunMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "controller" => Ok(RunMode::Controller),
        "monitor" => Ok(RunMode::Monitor),
        "dispatcher" => Ok(RunMode::Dispatcher),
        other => Err(Error::configuration(format!(
            "SKALDS_RUN_MODE must be one of: controller, monitor, dispatcher (got {other})"
        ))),
    }
}

fn parse_dispatch_policy(value: &str) -> Result<DispatchPolicyKind> {
    match value.trim().to_ascii_lowercase().as_str() {
        "least_tasks" => Ok(DispatchPolicyKind::LeastTasks),
        "round_robin" => Ok(DispatchPolicyKind::RoundRobin),
        "random" => Ok(DispatchPolicyKind::Random),
        other => Err(Error::configuration(format!(
            "SKALDS_DISPATCH_POLICY must be one of: least_tasks, round_robin, random (got {other})"
        ))),
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::configuration(format!("{name} must be a u16: {e}")))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::configuration(format!("{name} must be a u64: {e}")))
}

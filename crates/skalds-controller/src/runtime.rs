//! Composition root: wires adapters, stores, and loops per run mode.
//!
//! Everything is constructor-injected; no process globals. The API crate
//! holds a [`SystemController`] and serves reads from its stores. On
//! shutdown the stages drain in order — dispatcher, reconciler, monitors
//! — each bounded by the configured grace window (the HTTP server drains
//! first, in the binary).

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use skalds_core::{CacheBackend, Clock, SystemClock};

use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::events::EventBus;
use crate::monitor::skald_monitor::SkaldMonitorConfig;
use crate::monitor::task_monitor::TaskMonitorConfig;
use crate::monitor::{SkaldMonitor, TaskMonitor};
use crate::reconciler::{Reconciler, TaskObservation};
use crate::repository::TaskRepository;
use crate::state::{SkaldStore, TaskStore};

const OBSERVATION_QUEUE: usize = 1024;

/// Status of one controller component, for the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    /// Component name.
    pub name: String,
    /// Whether the component's loop is live.
    pub running: bool,
    /// Component-specific details.
    pub details: serde_json::Value,
}

/// Reachability of the three external collaborators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterHealth {
    /// Cache reachability (`healthy` or the failure).
    pub cache: String,
    /// Document store reachability.
    pub store: String,
    /// Event log reachability.
    pub event: String,
}

impl AdapterHealth {
    /// Returns true if all three adapters are reachable.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        [&self.cache, &self.store, &self.event]
            .iter()
            .all(|state| state.as_str() == "healthy")
    }
}

struct Stage {
    name: &'static str,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// The orchestration brain, composed per run mode.
pub struct SystemController {
    config: Config,
    cache: Arc<dyn CacheBackend>,
    repository: Arc<dyn TaskRepository>,
    events: Arc<dyn EventBus>,
    skald_store: Arc<SkaldStore>,
    task_store: Arc<TaskStore>,
    skald_monitor: Option<Arc<SkaldMonitor>>,
    task_monitor: Option<Arc<TaskMonitor>>,
    reconciler: Option<Arc<Reconciler>>,
    dispatcher: Option<Arc<Dispatcher>>,
    observations: Mutex<Option<mpsc::Receiver<TaskObservation>>>,
    stages: Mutex<Vec<Stage>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for SystemController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemController")
            .field("mode", &self.config.run_mode)
            .finish_non_exhaustive()
    }
}

impl SystemController {
    /// Composes the controller from injected adapters.
    ///
    /// Loops are constructed per the configured run mode but not spawned
    /// until [`start`](Self::start).
    #[must_use]
    pub fn new(
        config: Config,
        cache: Arc<dyn CacheBackend>,
        repository: Arc<dyn TaskRepository>,
        events: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let skald_store = Arc::new(SkaldStore::new(config.sse_backpressure_high));
        let task_store = Arc::new(TaskStore::new(config.sse_backpressure_high));

        let mut skald_monitor = None;
        let mut task_monitor = None;
        let mut reconciler = None;
        let mut dispatcher = None;
        let mut observation_rx = None;

        if config.run_mode.runs_monitors() {
            skald_monitor = Some(Arc::new(SkaldMonitor::new(
                Arc::clone(&cache),
                Arc::clone(&skald_store),
                Arc::clone(&clock),
                SkaldMonitorConfig {
                    sync_interval: config.skald_sync_interval,
                    stale_threshold: config.skald_stale_threshold,
                    evict_threshold: config.skald_evict_threshold,
                    stuck_window: config.stuck_window,
                },
            )));

            let (tx, rx) = mpsc::channel(OBSERVATION_QUEUE);
            observation_rx = Some(rx);
            task_monitor = Some(Arc::new(TaskMonitor::new(
                Arc::clone(&cache),
                Arc::clone(&repository),
                Arc::clone(&events),
                Arc::clone(&skald_store),
                Arc::clone(&task_store),
                Arc::clone(&clock),
                TaskMonitorConfig {
                    sync_interval: config.task_sync_interval,
                    stuck_window: config.stuck_window,
                    orphan_cancel_interval: config.orphan_cancel_interval,
                },
                tx,
            )));
            reconciler = Some(Arc::new(Reconciler::new(
                Arc::clone(&repository),
                config.assignment_timeout,
            )));
        }

        if config.run_mode.runs_dispatcher() {
            dispatcher = Some(Arc::new(Dispatcher::new(
                Arc::clone(&repository),
                Arc::clone(&events),
                Arc::clone(&skald_store),
                DispatcherConfig {
                    interval: config.dispatch_interval,
                    policy: config.dispatch_policy,
                    instance_id: config.instance_id.clone(),
                },
            )));
        }

        Self {
            config,
            cache,
            repository,
            events,
            skald_store,
            task_store,
            skald_monitor,
            task_monitor,
            reconciler,
            dispatcher,
            observations: Mutex::new(observation_rx),
            stages: Mutex::new(Vec::new()),
            started_at: Mutex::new(None),
        }
    }

    /// Composes a controller on the system clock.
    #[must_use]
    pub fn with_system_clock(
        config: Config,
        cache: Arc<dyn CacheBackend>,
        repository: Arc<dyn TaskRepository>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self::new(config, cache, repository, events, Arc::new(SystemClock))
    }

    /// Spawns the loops for the configured run mode.
    ///
    /// Idempotent; a second call is a no-op.
    pub fn start(&self) {
        let mut stages = self.stages.lock().expect("stage lock poisoned");
        if !stages.is_empty() {
            tracing::warn!("system controller already started");
            return;
        }
        *self.started_at.lock().expect("uptime lock poisoned") = Some(Utc::now());
        tracing::info!(mode = %self.config.run_mode, "starting system controller");

        // Stages are pushed in drain order: dispatcher first, then the
        // reconciler, then the monitors.
        if let Some(dispatcher) = &self.dispatcher {
            let token = CancellationToken::new();
            let handle = {
                let dispatcher = Arc::clone(dispatcher);
                let token = token.clone();
                tokio::spawn(async move { dispatcher.run(token).await })
            };
            stages.push(Stage {
                name: "dispatcher",
                token,
                handles: vec![handle],
            });
        }

        if let Some(reconciler) = &self.reconciler {
            let receiver = self
                .observations
                .lock()
                .expect("observation lock poisoned")
                .take()
                .expect("observation receiver consumed twice");
            let token = CancellationToken::new();
            let handle = {
                let reconciler = Arc::clone(reconciler);
                let token = token.clone();
                tokio::spawn(async move { reconciler.run(receiver, token).await })
            };
            stages.push(Stage {
                name: "reconciler",
                token,
                handles: vec![handle],
            });
        }

        if self.skald_monitor.is_some() || self.task_monitor.is_some() {
            let token = CancellationToken::new();
            let mut handles = Vec::new();
            if let Some(monitor) = &self.skald_monitor {
                let monitor = Arc::clone(monitor);
                let token = token.clone();
                handles.push(tokio::spawn(async move { monitor.run(token).await }));
            }
            if let Some(monitor) = &self.task_monitor {
                let monitor = Arc::clone(monitor);
                let token = token.clone();
                handles.push(tokio::spawn(async move { monitor.run(token).await }));
            }
            stages.push(Stage {
                name: "monitors",
                token,
                handles,
            });
        }
    }

    /// Drains all stages in order, each bounded by the grace window.
    pub async fn shutdown(&self) {
        let stages: Vec<Stage> = {
            let mut guard = self.stages.lock().expect("stage lock poisoned");
            guard.drain(..).collect()
        };
        for stage in stages {
            tracing::info!(stage = stage.name, "draining");
            stage.token.cancel();
            for handle in stage.handles {
                match tokio::time::timeout(self.config.shutdown_grace, handle).await {
                    Ok(_) => {}
                    Err(_) => {
                        tracing::warn!(stage = stage.name, "drain exceeded grace window");
                    }
                }
            }
        }
        *self.started_at.lock().expect("uptime lock poisoned") = None;
        tracing::info!("system controller stopped");
    }

    /// Returns true if the controller loops are live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.started_at
            .lock()
            .expect("uptime lock poisoned")
            .is_some()
    }

    /// Seconds since start, or zero when stopped.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at
            .lock()
            .expect("uptime lock poisoned")
            .map_or(0, |at| {
                u64::try_from(Utc::now().signed_duration_since(at).num_seconds()).unwrap_or(0)
            })
    }

    /// Per-component status for the status endpoint.
    #[must_use]
    pub fn component_statuses(&self) -> Vec<ComponentStatus> {
        let running = self.is_running();
        let mut components = Vec::new();
        if let Some(monitor) = &self.skald_monitor {
            components.push(ComponentStatus {
                name: "SkaldMonitor".to_string(),
                running,
                details: monitor.status_details(),
            });
        }
        if let Some(monitor) = &self.task_monitor {
            components.push(ComponentStatus {
                name: "TaskMonitor".to_string(),
                running,
                details: monitor.status_details(),
            });
        }
        if self.reconciler.is_some() {
            components.push(ComponentStatus {
                name: "Reconciler".to_string(),
                running,
                details: serde_json::json!({
                    "assignmentTimeoutSecs": self.config.assignment_timeout.as_secs(),
                }),
            });
        }
        if let Some(dispatcher) = &self.dispatcher {
            components.push(ComponentStatus {
                name: "Dispatcher".to_string(),
                running,
                details: dispatcher.status_details(),
            });
        }
        components
    }

    /// Pings the three adapters for the health endpoint.
    pub async fn adapter_health(&self) -> AdapterHealth {
        let probe = |result: Result<(), String>| match result {
            Ok(()) => "healthy".to_string(),
            Err(error) => format!("unreachable: {error}"),
        };
        AdapterHealth {
            cache: probe(self.cache.ping().await.map_err(|e| e.to_string())),
            store: probe(self.repository.ping().await.map_err(|e| e.to_string())),
            event: probe(self.events.ping().await.map_err(|e| e.to_string())),
        }
    }

    /// The controller configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The fleet view.
    #[must_use]
    pub fn skald_store(&self) -> &Arc<SkaldStore> {
        &self.skald_store
    }

    /// The monitored-task view.
    #[must_use]
    pub fn task_store(&self) -> &Arc<TaskStore> {
        &self.task_store
    }

    /// The task repository.
    #[must_use]
    pub fn repository(&self) -> &Arc<dyn TaskRepository> {
        &self.repository
    }

    /// The event bus.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventBus> {
        &self.events
    }

    /// The cache backend.
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunMode;
    use crate::events::MemoryEventBus;
    use crate::repository::MemoryTaskRepository;
    use skalds_core::MemoryCacheBackend;

    fn controller(mode: RunMode) -> SystemController {
        let config = Config {
            run_mode: mode,
            ..Config::default()
        };
        SystemController::with_system_clock(
            config,
            Arc::new(MemoryCacheBackend::new()),
            Arc::new(MemoryTaskRepository::new()),
            Arc::new(MemoryEventBus::new()),
        )
    }

    #[test]
    fn controller_mode_builds_no_loops() {
        let controller = controller(RunMode::Controller);
        assert!(controller.component_statuses().is_empty());
    }

    #[test]
    fn monitor_mode_builds_monitors_and_reconciler() {
        let controller = controller(RunMode::Monitor);
        let names: Vec<String> = controller
            .component_statuses()
            .into_iter()
            .map(|status| status.name)
            .collect();
        assert_eq!(names, vec!["SkaldMonitor", "TaskMonitor", "Reconciler"]);
    }

    #[test]
    fn dispatcher_mode_builds_everything() {
        let controller = controller(RunMode::Dispatcher);
        let names: Vec<String> = controller
            .component_statuses()
            .into_iter()
            .map(|status| status.name)
            .collect();
        assert_eq!(
            names,
            vec!["SkaldMonitor", "TaskMonitor", "Reconciler", "Dispatcher"]
        );
    }

    #[tokio::test]
    async fn start_and_shutdown_roundtrip() {
        let controller = controller(RunMode::Dispatcher);
        assert!(!controller.is_running());

        controller.start();
        assert!(controller.is_running());
        // A second start is a no-op.
        controller.start();

        controller.shutdown().await;
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn memory_adapters_report_healthy() {
        let controller = controller(RunMode::Controller);
        let health = controller.adapter_health().await;
        assert!(health.is_healthy());
        assert_eq!(health.cache, "healthy");
    }
}

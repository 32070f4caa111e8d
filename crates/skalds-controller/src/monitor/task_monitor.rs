//! Task monitor: periodic rebuild of the monitored-task view.
//!
//! Per cycle the monitor asks the repository for every Assigning/Running
//! task, polls each task's heartbeat, error, and exception keys from the
//! cache, refreshes the [`TaskStore`], and emits one observation per task
//! to the reconciler. An orphan scan then compares every skald's claimed
//! task set against the monitored set and asks executors to release
//! ghosts via `task.cancel`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use skalds_core::cache::keys;
use skalds_core::{
    CacheBackend, Clock, EventTopic, SkaldId, SkaldStatus, TaskEventPayload, TaskId,
    TaskLifecycleStatus,
};

use crate::error::Result;
use crate::events::EventBus;
use crate::metrics::{labels, names};
use crate::reconciler::TaskObservation;
use crate::repository::TaskRepository;
use crate::state::{SkaldStore, TaskRecord, TaskStore};

/// Tuning for the task monitor.
#[derive(Debug, Clone)]
pub struct TaskMonitorConfig {
    /// Cycle interval.
    pub sync_interval: Duration,
    /// Heartbeat window length for stuck detection.
    pub stuck_window: usize,
    /// Minimum spacing of repeated orphan cancels per (skald, task)
    /// pair; zero means once per cycle.
    pub orphan_cancel_interval: Duration,
}

/// Rebuilds the [`TaskStore`] and feeds the reconciler.
pub struct TaskMonitor {
    cache: Arc<dyn CacheBackend>,
    repository: Arc<dyn TaskRepository>,
    events: Arc<dyn EventBus>,
    skald_store: Arc<SkaldStore>,
    task_store: Arc<TaskStore>,
    clock: Arc<dyn Clock>,
    config: TaskMonitorConfig,
    observations: mpsc::Sender<TaskObservation>,
    orphan_cancelled_at: Mutex<HashMap<(SkaldId, TaskId), DateTime<Utc>>>,
}

impl std::fmt::Debug for TaskMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TaskMonitor {
    /// Creates a monitor over the given adapters and stores.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        repository: Arc<dyn TaskRepository>,
        events: Arc<dyn EventBus>,
        skald_store: Arc<SkaldStore>,
        task_store: Arc<TaskStore>,
        clock: Arc<dyn Clock>,
        config: TaskMonitorConfig,
        observations: mpsc::Sender<TaskObservation>,
    ) -> Self {
        Self {
            cache,
            repository,
            events,
            skald_store,
            task_store,
            clock,
            config,
            observations,
            orphan_cancelled_at: Mutex::new(HashMap::new()),
        }
    }

    /// Runs cycles until shutdown is requested.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sync_interval);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if shutdown.is_cancelled() {
                break;
            }
            if let Err(error) = self.run_cycle().await {
                counter!(
                    names::MONITOR_CYCLE_FAILURES_TOTAL,
                    labels::COMPONENT => "task_monitor",
                )
                .increment(1);
                tracing::warn!(error = %error, "task monitor cycle failed; skipping");
            }
        }
        tracing::info!("task monitor drained");
    }

    /// Runs one monitor cycle.
    ///
    /// # Errors
    ///
    /// Returns an error when the monitored-task list cannot be read;
    /// per-task cache failures only skip that task.
    pub async fn run_cycle(&self) -> Result<()> {
        let monitored = self.repository.list_monitored_tasks().await?;
        let now = self.clock.now();
        let monitored_ids: HashSet<TaskId> =
            monitored.iter().map(|task| task.id.clone()).collect();

        for task in &monitored {
            if let Err(error) = self.observe_task(task, now).await {
                tracing::warn!(task_id = %task.id, error = %error, "task poll failed; skipping");
            }
        }

        // Records for tasks that left the monitored set (reconciled to a
        // terminal state, or cancelled externally) are dropped here.
        for id in self.task_store.ids() {
            if !monitored_ids.contains(&id) {
                self.task_store.remove(&id);
            }
        }

        self.orphan_scan(&monitored_ids, now).await;
        gauge!(names::TASKS_MONITORED).set(self.task_store.len() as f64);
        Ok(())
    }

    async fn observe_task(&self, task: &skalds_core::Task, now: DateTime<Utc>) -> Result<()> {
        let heartbeat = self
            .cache
            .get_string(&keys::task_heartbeat(&task.id))
            .await?
            .and_then(|raw| raw.trim().parse::<i32>().ok());
        let error = self
            .cache
            .get_string(&keys::task_error(&task.id))
            .await?
            .filter(|raw| !raw.is_empty());
        let exception = self
            .cache
            .get_string(&keys::task_exception(&task.id))
            .await?
            .filter(|raw| !raw.is_empty());

        let window = self.config.stuck_window;
        let status = task.lifecycle_status;
        let executor = task.executor.clone();
        self.task_store.merge(
            &task.id,
            || TaskRecord::new(task.id.clone(), status, now),
            |record| {
                record.lifecycle_status = status;
                record.executor = executor.clone();
                if let Some(heartbeat) = heartbeat {
                    record.record_heartbeat(heartbeat, window);
                }
                record.error.clone_from(&error);
                record.exception.clone_from(&exception);
                record.observed_at = now;
            },
        );

        let record = self
            .task_store
            .get(&task.id)
            .expect("record exists after merge");

        let executor_online = task
            .executor
            .as_ref()
            .and_then(|executor| self.skald_store.get(executor))
            .is_some_and(|skald| skald.status == SkaldStatus::Online);

        let assigning_for = if status == TaskLifecycleStatus::Assigning && heartbeat.is_none() {
            now.signed_duration_since(task.update_date_time).to_std().ok()
        } else {
            None
        };

        let observation = TaskObservation {
            task_id: task.id.clone(),
            prev_status: status,
            executor: task.executor.clone(),
            executor_online,
            heartbeat,
            history_saturated_equal: record.history_saturated_equal(window),
            error,
            exception,
            assigning_for,
        };

        // The reconciler owning the receiver has drained on shutdown;
        // dropping the observation is fine then.
        let _ = self.observations.send(observation).await;
        Ok(())
    }

    /// Emits `task.cancel` for every (skald, task) claim with no
    /// monitored counterpart, rate-limited per pair.
    async fn orphan_scan(&self, monitored_ids: &HashSet<TaskId>, now: DateTime<Utc>) {
        let rate_limit =
            chrono::Duration::from_std(self.config.orphan_cancel_interval)
                .unwrap_or_else(|_| chrono::Duration::zero());

        for skald in self.skald_store.snapshot() {
            for task_id in &skald.current_tasks {
                if monitored_ids.contains(task_id) {
                    continue;
                }
                let pair = (skald.id.clone(), task_id.clone());
                {
                    let mut cancelled_at = self
                        .orphan_cancelled_at
                        .lock()
                        .expect("orphan bookkeeping lock poisoned");
                    if let Some(last) = cancelled_at.get(&pair) {
                        if now.signed_duration_since(*last) < rate_limit {
                            continue;
                        }
                    }
                    cancelled_at.insert(pair.clone(), now);
                }

                let payload = match self.repository.get_task(task_id).await {
                    Ok(Some(task)) => TaskEventPayload::cancel(
                        task_id.clone(),
                        task.create_date_time,
                        task.update_date_time,
                    ),
                    _ => TaskEventPayload::cancel(task_id.clone(), now, now),
                };
                match self.events.publish(EventTopic::TaskCancel, &payload).await {
                    Ok(()) => {
                        counter!(names::ORPHAN_CANCELS_TOTAL).increment(1);
                        tracing::info!(
                            skald_id = %skald.id,
                            task_id = %task_id,
                            "asked executor to release orphan task"
                        );
                    }
                    Err(error) => {
                        tracing::warn!(task_id = %task_id, error = %error, "orphan cancel failed");
                        // Allow a retry before the rate limit elapses.
                        self.orphan_cancelled_at
                            .lock()
                            .expect("orphan bookkeeping lock poisoned")
                            .remove(&pair);
                    }
                }
            }
        }

        // Claims that disappeared stop occupying bookkeeping memory.
        self.orphan_cancelled_at
            .lock()
            .expect("orphan bookkeeping lock poisoned")
            .retain(|(_, task_id), _| !monitored_ids.contains(task_id));
    }

    /// Component details for the status endpoint.
    #[must_use]
    pub fn status_details(&self) -> serde_json::Value {
        serde_json::json!({
            "intervalSecs": self.config.sync_interval.as_secs(),
            "stuckWindow": self.config.stuck_window,
            "monitoredTasks": self.task_store.len(),
        })
    }
}

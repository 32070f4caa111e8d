//! Dispatcher: assigns eligible tasks to eligible skalds.
//!
//! Per tick the dispatcher reads the dispatchable backlog (Passive tasks
//! in Created or Paused, priority-ordered), filters the fleet snapshot
//! down to candidates (`Node` ∧ `Online` ∧ supports the class), picks one
//! per the configured policy, and performs the ordered triple:
//! `update_executor` → status CAS → `task.assign` publish. The CAS is the
//! linearization point; losing it skips the publish. A publish failure
//! after a won CAS is compensated by the assignment timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use skalds_core::{EventTopic, SkaldId, TaskEventPayload, TaskLifecycleStatus};

use crate::config::DispatchPolicyKind;
use crate::error::Result;
use crate::events::EventBus;
use crate::metrics::names;
use crate::repository::TaskRepository;
use crate::state::{SkaldRecord, SkaldStore};

/// Tuning for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Tick interval.
    pub interval: Duration,
    /// Balancing policy.
    pub policy: DispatchPolicyKind,
    /// Stamped as the `initiator` on assignment events.
    pub instance_id: String,
}

/// Counters from one dispatcher tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Tasks assigned (CAS won and event published).
    pub assigned: usize,
    /// Tasks left for the next tick because no candidate existed.
    pub unplaced: usize,
    /// Tasks skipped because another writer won the status race.
    pub cas_lost: usize,
}

/// The pluggable balancing policy.
///
/// All variants are pure functions of `(candidates, tie-break key)`;
/// `RoundRobin` additionally persists its cursor across ticks.
#[derive(Debug)]
pub enum DispatchPolicy {
    /// Fewest `current_tasks` plus assignments made this tick; ties break
    /// on lexicographic skald id.
    LeastTasks,
    /// Rotating cursor over the eligible candidates.
    RoundRobin {
        /// Next position in the candidate rotation.
        cursor: usize,
    },
    /// Uniform choice from a generator seeded per tick.
    Random {
        /// Tick counter used as the seed.
        tick: u64,
    },
}

impl DispatchPolicy {
    /// Creates the initial policy state for the configured kind.
    #[must_use]
    pub fn new(kind: DispatchPolicyKind) -> Self {
        match kind {
            DispatchPolicyKind::LeastTasks => Self::LeastTasks,
            DispatchPolicyKind::RoundRobin => Self::RoundRobin { cursor: 0 },
            DispatchPolicyKind::Random => Self::Random { tick: 0 },
        }
    }

    /// Returns the policy label.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::LeastTasks => "least_tasks",
            Self::RoundRobin { .. } => "round_robin",
            Self::Random { .. } => "random",
        }
    }
}

/// Picks one candidate under the `LeastTasks` policy.
///
/// `extra` carries the assignments already made this tick so a burst of
/// dispatchable tasks spreads across the fleet instead of piling onto
/// the initially-emptiest skald.
#[must_use]
pub fn choose_least_tasks<'a>(
    candidates: &[&'a SkaldRecord],
    extra: &HashMap<SkaldId, usize>,
) -> Option<&'a SkaldRecord> {
    candidates
        .iter()
        .min_by_key(|record| {
            let load = record.task_count() + extra.get(&record.id).copied().unwrap_or(0);
            (load, record.id.clone())
        })
        .copied()
}

/// Assigns tasks on a timer.
pub struct Dispatcher {
    repository: Arc<dyn TaskRepository>,
    events: Arc<dyn EventBus>,
    skald_store: Arc<SkaldStore>,
    config: DispatcherConfig,
    policy: Mutex<DispatchPolicy>,
    last_outcome: Mutex<DispatchOutcome>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher over the given adapters and fleet view.
    #[must_use]
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        events: Arc<dyn EventBus>,
        skald_store: Arc<SkaldStore>,
        config: DispatcherConfig,
    ) -> Self {
        let policy = DispatchPolicy::new(config.policy);
        Self {
            repository,
            events,
            skald_store,
            config,
            policy: Mutex::new(policy),
            last_outcome: Mutex::new(DispatchOutcome::default()),
        }
    }

    /// Runs ticks until shutdown is requested.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if shutdown.is_cancelled() {
                break;
            }
            match self.run_tick().await {
                Ok(outcome) => {
                    if outcome.assigned > 0 || outcome.unplaced > 0 {
                        tracing::info!(
                            assigned = outcome.assigned,
                            unplaced = outcome.unplaced,
                            cas_lost = outcome.cas_lost,
                            "dispatch tick complete"
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!(error = %error, "dispatch tick failed; skipping");
                }
            }
        }
        tracing::info!("dispatcher drained");
    }

    /// Runs one dispatch tick.
    ///
    /// Emits at most one assignment event per task and preserves the
    /// single-executor invariant via the status CAS.
    ///
    /// # Errors
    ///
    /// Returns an error when the backlog cannot be read; per-task
    /// failures only skip that task.
    pub async fn run_tick(&self) -> Result<DispatchOutcome> {
        let backlog = self.repository.list_dispatchable_tasks().await?;
        let mut outcome = DispatchOutcome::default();
        if backlog.is_empty() {
            *self.last_outcome.lock().expect("outcome lock poisoned") = outcome;
            return Ok(outcome);
        }

        let snapshot = self.skald_store.snapshot();
        let mut assignments_this_tick: HashMap<SkaldId, usize> = HashMap::new();

        // Per-tick policy state; the cursor is written back at the end.
        let (mut cursor, tick) = {
            let mut policy = self.policy.lock().expect("policy lock poisoned");
            match &mut *policy {
                DispatchPolicy::LeastTasks => (0, 0),
                DispatchPolicy::RoundRobin { cursor } => (*cursor, 0),
                DispatchPolicy::Random { tick } => {
                    *tick += 1;
                    (0, *tick)
                }
            }
        };
        let mut rng = StdRng::seed_from_u64(tick);

        for task in backlog {
            let mut candidates: Vec<&SkaldRecord> = snapshot
                .iter()
                .filter(|record| record.is_dispatch_candidate(&task.class_name))
                .collect();
            candidates.sort_by(|a, b| a.id.cmp(&b.id));

            if candidates.is_empty() {
                outcome.unplaced += 1;
                counter!(names::DISPATCH_UNPLACED_TOTAL).increment(1);
                continue;
            }

            let chosen = {
                let policy = self.policy.lock().expect("policy lock poisoned");
                match &*policy {
                    DispatchPolicy::LeastTasks => {
                        choose_least_tasks(&candidates, &assignments_this_tick)
                            .expect("candidates is non-empty")
                            .id
                            .clone()
                    }
                    DispatchPolicy::RoundRobin { .. } => {
                        let picked = candidates[cursor % candidates.len()].id.clone();
                        cursor = cursor.wrapping_add(1);
                        picked
                    }
                    DispatchPolicy::Random { .. } => {
                        candidates[rng.gen_range(0..candidates.len())].id.clone()
                    }
                }
            };

            match self.assign(&task, &chosen).await {
                Ok(true) => {
                    outcome.assigned += 1;
                    *assignments_this_tick.entry(chosen).or_insert(0) += 1;
                    counter!(names::DISPATCH_ASSIGNED_TOTAL).increment(1);
                }
                Ok(false) => outcome.cas_lost += 1,
                Err(error) => {
                    tracing::warn!(task_id = %task.id, error = %error, "assignment failed");
                }
            }
        }

        {
            let mut policy = self.policy.lock().expect("policy lock poisoned");
            if let DispatchPolicy::RoundRobin { cursor: persisted } = &mut *policy {
                *persisted = cursor;
            }
        }
        *self.last_outcome.lock().expect("outcome lock poisoned") = outcome;
        Ok(outcome)
    }

    /// Performs the ordered assignment triple for one task.
    async fn assign(&self, task: &skalds_core::Task, skald_id: &SkaldId) -> Result<bool> {
        self.repository
            .update_executor(&task.id, Some(skald_id.clone()))
            .await?;

        let cas = self
            .repository
            .update_lifecycle_status(
                &task.id,
                TaskLifecycleStatus::Assigning,
                &[TaskLifecycleStatus::Created, TaskLifecycleStatus::Paused],
            )
            .await?;
        if !cas.is_applied() {
            // Another writer (an external cancel, or a peer dispatcher)
            // moved the task first; the executor field it no longer needs
            // is inert and gets overwritten on any re-dispatch.
            tracing::debug!(task_id = %task.id, "lost assignment race; skipping publish");
            return Ok(false);
        }

        let updated = self
            .repository
            .get_task(&task.id)
            .await?
            .map_or(task.update_date_time, |fresh| fresh.update_date_time);

        let payload = TaskEventPayload::assign(
            task.id.clone(),
            skald_id.clone(),
            self.config.instance_id.clone(),
            task.create_date_time,
            updated,
        );
        if let Err(error) = self.events.publish(EventTopic::TaskAssign, &payload).await {
            // The task stays Assigning with no heartbeat; the reconciler
            // demotes it after the assignment timeout.
            tracing::warn!(
                task_id = %task.id,
                skald_id = %skald_id,
                error = %error,
                "assignment published nothing; timeout will recover"
            );
        } else {
            tracing::info!(task_id = %task.id, skald_id = %skald_id, "task assigned");
        }
        Ok(true)
    }

    /// Component details for the status endpoint.
    #[must_use]
    pub fn status_details(&self) -> serde_json::Value {
        let outcome = *self.last_outcome.lock().expect("outcome lock poisoned");
        let policy = self.policy.lock().expect("policy lock poisoned");
        serde_json::json!({
            "intervalSecs": self.config.interval.as_secs(),
            "policy": policy.as_label(),
            "lastTick": {
                "assigned": outcome.assigned,
                "unplaced": outcome.unplaced,
                "casLost": outcome.cas_lost,
            },
        })
    }
}

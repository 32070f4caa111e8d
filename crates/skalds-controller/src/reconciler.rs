//! State reconciliation: mapping heartbeat observations onto lifecycle
//! transitions.
//!
//! The decision core is a pure function of one observation tuple; the
//! [`Reconciler`] worker applies decisions through the repository using
//! compare-and-swap on the previous status. A losing CAS means some other
//! writer won the race and is treated as success.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use skalds_core::{SkaldId, TaskEventPayload, TaskId, TaskLifecycleStatus, heartbeat};

use crate::error::Result;
use crate::events::EventBus;
use crate::metrics::{labels, names};
use crate::repository::{CasOutcome, TaskRepository};

/// One observation of a monitored task, emitted per monitor cycle.
#[derive(Debug, Clone)]
pub struct TaskObservation {
    /// The observed task.
    pub task_id: TaskId,
    /// Status the repository reported at the start of the cycle.
    pub prev_status: TaskLifecycleStatus,
    /// Executor the repository names for the task.
    pub executor: Option<SkaldId>,
    /// Whether that executor is currently ONLINE in the fleet view.
    pub executor_online: bool,
    /// Latest heartbeat, if the worker has written one.
    pub heartbeat: Option<i32>,
    /// True when the heartbeat window is saturated with equal samples.
    pub history_saturated_equal: bool,
    /// Worker-reported error string.
    pub error: Option<String>,
    /// Worker-reported exception string.
    pub exception: Option<String>,
    /// How long the task has been in `Assigning` without a heartbeat.
    pub assigning_for: Option<Duration>,
}

/// Why a task was failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The worker reported a terminal exception heartbeat.
    WorkerException,
    /// The heartbeat held one value for the whole stuck window.
    Stuck,
    /// The executor went OFFLINE while the task was live.
    ExecutorOffline,
}

impl FailureReason {
    /// Returns the label used in logs and metrics.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::WorkerException => "worker_exception",
            Self::Stuck => "stuck",
            Self::ExecutorOffline => "executor_offline",
        }
    }
}

/// The lifecycle action an observation maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Transition to `Finished`.
    Finish,
    /// Transition to `Failed` for the given reason.
    Fail(FailureReason),
    /// Transition to `Cancelled` (worker acknowledged).
    Cancel,
    /// Promote `Assigning` to `Running` on the first progress heartbeat.
    Promote,
    /// Demote `Assigning` back to `Created` (assignment timeout),
    /// clearing the executor.
    Demote,
    /// Nothing to do this cycle.
    Hold,
}

/// Maps one observation onto a lifecycle decision.
///
/// Terminal heartbeats win over everything; a saturated flat window wins
/// over executor liveness; executor loss wins over promotion; the
/// assignment timeout only fires when no heartbeat has ever arrived.
#[must_use]
pub fn decide(observation: &TaskObservation, assignment_timeout: Duration) -> Decision {
    match observation.heartbeat {
        Some(heartbeat::FINISHED) => return Decision::Finish,
        Some(heartbeat::EXCEPTION) => return Decision::Fail(FailureReason::WorkerException),
        Some(heartbeat::CANCELLED) => return Decision::Cancel,
        _ => {}
    }

    if observation.history_saturated_equal
        && observation.heartbeat.is_some_and(heartbeat::is_progress)
    {
        return Decision::Fail(FailureReason::Stuck);
    }

    if observation.prev_status.is_monitored() && !observation.executor_online {
        return Decision::Fail(FailureReason::ExecutorOffline);
    }

    if observation.prev_status == TaskLifecycleStatus::Assigning {
        if observation.heartbeat.is_some_and(heartbeat::is_progress) {
            return Decision::Promote;
        }
        if observation.heartbeat.is_none()
            && observation
                .assigning_for
                .is_some_and(|waited| waited > assignment_timeout)
        {
            return Decision::Demote;
        }
    }

    Decision::Hold
}

/// Applies reconciliation decisions through the repository.
pub struct Reconciler {
    repository: Arc<dyn TaskRepository>,
    assignment_timeout: Duration,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("assignment_timeout", &self.assignment_timeout)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler over the given repository.
    #[must_use]
    pub fn new(repository: Arc<dyn TaskRepository>, assignment_timeout: Duration) -> Self {
        Self {
            repository,
            assignment_timeout,
        }
    }

    /// Consumes observations until the channel closes or shutdown is
    /// requested.
    pub async fn run(
        &self,
        mut observations: mpsc::Receiver<TaskObservation>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                observation = observations.recv() => {
                    let Some(observation) = observation else { break };
                    if let Err(error) = self.apply(&observation).await {
                        tracing::warn!(
                            task_id = %observation.task_id,
                            error = %error,
                            "reconcile failed; will retry next cycle"
                        );
                    }
                }
            }
        }
        tracing::info!("reconciler drained");
    }

    /// Applies the decision for one observation.
    ///
    /// # Errors
    ///
    /// Returns an error only on transport failures; CAS losses and
    /// missing tasks are absorbed here.
    pub async fn apply(&self, observation: &TaskObservation) -> Result<Option<Decision>> {
        let decision = decide(observation, self.assignment_timeout);
        let task_id = &observation.task_id;
        let prev = observation.prev_status;

        match decision {
            Decision::Hold => return Ok(None),
            Decision::Finish => {
                // A fast worker can report 200 before the promotion to
                // Running was ever observed; step through Running first.
                if prev == TaskLifecycleStatus::Assigning {
                    let promoted = self
                        .transition(task_id, TaskLifecycleStatus::Running, &[prev], "finish")
                        .await?;
                    if !promoted {
                        return Ok(Some(decision));
                    }
                    self.transition(
                        task_id,
                        TaskLifecycleStatus::Finished,
                        &[TaskLifecycleStatus::Running],
                        "finish",
                    )
                    .await?;
                } else {
                    self.transition(task_id, TaskLifecycleStatus::Finished, &[prev], "finish")
                        .await?;
                }
            }
            Decision::Fail(reason) => {
                if let Some(exception) = &observation.exception {
                    tracing::warn!(task_id = %task_id, exception = %exception, "task failed");
                }
                self.transition(
                    task_id,
                    TaskLifecycleStatus::Failed,
                    &[prev],
                    reason.as_label(),
                )
                .await?;
            }
            Decision::Cancel => {
                self.transition(
                    task_id,
                    TaskLifecycleStatus::Cancelled,
                    &[prev],
                    "worker_acknowledged",
                )
                .await?;
            }
            Decision::Promote => {
                self.transition(
                    task_id,
                    TaskLifecycleStatus::Running,
                    &[TaskLifecycleStatus::Assigning],
                    "first_heartbeat",
                )
                .await?;
            }
            Decision::Demote => {
                let applied = self
                    .transition(
                        task_id,
                        TaskLifecycleStatus::Created,
                        &[TaskLifecycleStatus::Assigning],
                        "assignment_timeout",
                    )
                    .await?;
                if applied {
                    self.repository.update_executor(task_id, None).await?;
                    counter!(names::ASSIGNMENT_TIMEOUTS_TOTAL).increment(1);
                }
            }
        }

        Ok(Some(decision))
    }

    async fn transition(
        &self,
        task_id: &TaskId,
        to: TaskLifecycleStatus,
        expected: &[TaskLifecycleStatus],
        reason: &'static str,
    ) -> Result<bool> {
        let outcome = self
            .repository
            .update_lifecycle_status(task_id, to, expected)
            .await?;
        match outcome {
            CasOutcome::Applied => {
                tracing::info!(task_id = %task_id, to = %to, reason, "task transitioned");
                counter!(
                    names::RECONCILE_TRANSITIONS_TOTAL,
                    labels::TO => to.as_label(),
                    labels::REASON => reason,
                )
                .increment(1);
                Ok(true)
            }
            CasOutcome::Lost { actual } => {
                tracing::debug!(
                    task_id = %task_id,
                    to = %to,
                    actual = %actual,
                    "lost transition race; treating as success"
                );
                counter!(names::RECONCILE_CAS_LOST_TOTAL).increment(1);
                Ok(false)
            }
            CasOutcome::NotFound => {
                tracing::debug!(task_id = %task_id, to = %to, "task vanished before transition");
                Ok(false)
            }
        }
    }
}

/// Applies an external cancellation requested through the API.
///
/// Performs the CAS from any non-terminal status and emits one
/// `task.cancel` event per effective transition. A second identical
/// request finds the task already `Cancelled` and emits nothing, which is
/// what makes the endpoint idempotent.
///
/// # Errors
///
/// Returns an error on transport failures.
pub async fn cancel_task_external(
    repository: &Arc<dyn TaskRepository>,
    events: &Arc<dyn EventBus>,
    task_id: &TaskId,
) -> Result<bool> {
    let outcome = repository
        .update_lifecycle_status(
            task_id,
            TaskLifecycleStatus::Cancelled,
            &[
                TaskLifecycleStatus::Created,
                TaskLifecycleStatus::Assigning,
                TaskLifecycleStatus::Running,
                TaskLifecycleStatus::Paused,
            ],
        )
        .await?;

    if !outcome.is_applied() {
        return Ok(false);
    }

    let task = repository.get_task(task_id).await?;
    let (created, updated) = task.map_or_else(
        || {
            let now = chrono::Utc::now();
            (now, now)
        },
        |task| (task.create_date_time, task.update_date_time),
    );
    events
        .publish(
            skalds_core::EventTopic::TaskCancel,
            &TaskEventPayload::cancel(task_id.clone(), created, updated),
        )
        .await?;
    counter!(
        names::RECONCILE_TRANSITIONS_TOTAL,
        labels::TO => TaskLifecycleStatus::Cancelled.as_label(),
        labels::REASON => "external",
    )
    .increment(1);
    Ok(true)
}

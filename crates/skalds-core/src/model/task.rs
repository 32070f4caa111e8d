//! Task model and lifecycle state machine.
//!
//! This module provides:
//! - `Task`: the persisted task document
//! - `TaskLifecycleStatus`: the authoritative state machine
//! - `TaskMode`: how a task reaches an executor
//! - `heartbeat`: the integer heartbeat protocol workers report through
//!   the cache

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::id::{SkaldId, TaskId};

/// Worker heartbeat protocol.
///
/// Workers write an integer counter to the cache. Values `0..=199` mean
/// the worker is progressing; the three reserved values encode terminal
/// outcomes.
pub mod heartbeat {
    /// Terminal: the worker completed successfully.
    pub const FINISHED: i32 = 200;
    /// Terminal: the worker raised an exception.
    pub const EXCEPTION: i32 = -1;
    /// Terminal: the worker acknowledged a cancellation.
    pub const CANCELLED: i32 = -2;

    /// Returns true if the value signals normal progress.
    #[must_use]
    pub const fn is_progress(value: i32) -> bool {
        value >= 0 && value < FINISHED
    }

    /// Returns true if the value signals a terminal outcome.
    #[must_use]
    pub const fn is_terminal(value: i32) -> bool {
        matches!(value, FINISHED | EXCEPTION | CANCELLED)
    }
}

/// How a task reaches an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskMode {
    /// Loaded by an executor from a local bundle; never dispatched.
    Active,
    /// Dispatched to an executor by the controller.
    Passive,
    /// Runs outside the orchestrator; not tracked by the controller.
    PassiveProcess,
}

impl TaskMode {
    /// Returns true if the dispatcher may assign tasks in this mode.
    #[must_use]
    pub const fn is_dispatchable(self) -> bool {
        matches!(self, Self::Passive)
    }
}

impl std::fmt::Display for TaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Passive => write!(f, "Passive"),
            Self::PassiveProcess => write!(f, "PassiveProcess"),
        }
    }
}

/// Task lifecycle state machine, authoritative in the document store.
///
/// ```text
///             dispatcher picks            heartbeat 0..=199
/// ┌─────────┐ sets executor ┌───────────┐                 ┌─────────┐
/// │ CREATED │──────────────►│ ASSIGNING │────────────────►│ RUNNING │
/// └─────────┘               └───────────┘                 └─────────┘
///      ▲                        │   │                     │    │   │
///      │   assignment timeout   │   │ executor offline    │    │   │ heartbeat 200
///      └────────────────────────┘   ▼                     ▼    │   ▼
///      │                      ┌────────┐  offline/stuck/-1     │ ┌──────────┐
///      │  re-queue            │ FAILED │◄──────────────────────┘ │ FINISHED │
/// ┌────────┐                  └────────┘                         └──────────┘
/// │ PAUSED │          heartbeat -2 or external update  ┌───────────┐
/// └────────┘─────────────────────────────────────────► │ CANCELLED │
///   (also directly dispatchable)                       └───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskLifecycleStatus {
    /// Waiting for the dispatcher (or paused re-queue target).
    Created,
    /// Dispatcher chose an executor; waiting for the first heartbeat.
    Assigning,
    /// Executor is reporting progress heartbeats.
    Running,
    /// Parked by an external actor; dispatchable or re-queueable.
    Paused,
    /// Terminal: completed successfully.
    Finished,
    /// Terminal: worker exception, stuck heartbeat, or executor loss.
    Failed,
    /// Terminal: cancelled by a worker acknowledgment or an external update.
    Cancelled,
}

impl TaskLifecycleStatus {
    /// Returns true if this is a terminal state (never re-dispatched).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the task monitor tracks tasks in this state.
    #[must_use]
    pub const fn is_monitored(self) -> bool {
        matches!(self, Self::Assigning | Self::Running)
    }

    /// Returns true if the dispatcher may pick tasks in this state.
    #[must_use]
    pub const fn is_dispatchable(self) -> bool {
        matches!(self, Self::Created | Self::Paused)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        match self {
            Self::Created => matches!(target, Self::Assigning | Self::Paused | Self::Cancelled),
            Self::Assigning => matches!(
                target,
                Self::Running | Self::Created | Self::Failed | Self::Cancelled
            ),
            Self::Running => matches!(target, Self::Finished | Self::Failed | Self::Cancelled),
            Self::Paused => matches!(target, Self::Created | Self::Assigning | Self::Cancelled),
            Self::Finished | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Returns all valid target states from the current state.
    #[must_use]
    pub fn valid_transitions(self) -> Vec<Self> {
        match self {
            Self::Created => vec![Self::Assigning, Self::Paused, Self::Cancelled],
            Self::Assigning => vec![Self::Running, Self::Created, Self::Failed, Self::Cancelled],
            Self::Running => vec![Self::Finished, Self::Failed, Self::Cancelled],
            Self::Paused => vec![Self::Created, Self::Assigning, Self::Cancelled],
            Self::Finished | Self::Failed | Self::Cancelled => vec![],
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Assigning => "assigning",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses the wire representation (`"Created"`, `"Running"`, ...).
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown status names.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "Created" => Ok(Self::Created),
            "Assigning" => Ok(Self::Assigning),
            "Running" => Ok(Self::Running),
            "Paused" => Ok(Self::Paused),
            "Finished" => Ok(Self::Finished),
            "Failed" => Ok(Self::Failed),
            "Cancelled" => Ok(Self::Cancelled),
            other => Err(Error::validation(format!(
                "unknown lifecycle status: {other}"
            ))),
        }
    }
}

impl Default for TaskLifecycleStatus {
    fn default() -> Self {
        Self::Created
    }
}

impl std::fmt::Display for TaskLifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Assigning => write!(f, "Assigning"),
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Paused"),
            Self::Finished => write!(f, "Finished"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// The persisted task document.
///
/// Volatile observations (heartbeat, error, exception) live in the cache
/// and never in this document; the monitor joins the two views.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Globally unique task identifier.
    pub id: TaskId,
    /// Executor-side implementation identifier.
    pub class_name: String,
    /// Where the task definition came from (submitter-defined).
    pub source: String,
    /// The skald currently responsible for the task, if assigned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<SkaldId>,
    /// Informational ordering dependencies; the controller does not block
    /// on them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<TaskId>,
    /// How the task reaches an executor.
    pub mode: TaskMode,
    /// Authoritative lifecycle state.
    pub lifecycle_status: TaskLifecycleStatus,
    /// Dispatch tiebreak, 0 (lowest) to 10 (highest).
    pub priority: u8,
    /// Structured parameter payload; must be a JSON object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Value>,
    /// Creation instant.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub create_date_time: DateTime<Utc>,
    /// Last mutation instant.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub update_date_time: DateTime<Utc>,
    /// Submitter-declared deadline.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub deadline_date_time: DateTime<Utc>,
    /// Only interpreted in `PassiveProcess` mode; opaque to the core.
    #[serde(default)]
    pub is_persistent: bool,
}

/// Maximum task priority.
pub const MAX_PRIORITY: u8 = 10;

impl Task {
    /// Creates a new task in `Created` state.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the priority is outside `0..=10` or
    /// the attachments payload is not a JSON object.
    pub fn new(
        id: TaskId,
        class_name: impl Into<String>,
        source: impl Into<String>,
        mode: TaskMode,
        priority: u8,
        attachments: Option<Value>,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Result<Self> {
        if priority > MAX_PRIORITY {
            return Err(Error::validation(format!(
                "priority must be 0..={MAX_PRIORITY} (got {priority})"
            )));
        }
        if let Some(value) = &attachments {
            validate_attachments(value)?;
        }
        Ok(Self {
            id,
            class_name: class_name.into(),
            source: source.into(),
            executor: None,
            dependencies: Vec::new(),
            mode,
            lifecycle_status: TaskLifecycleStatus::Created,
            priority,
            attachments,
            create_date_time: now,
            update_date_time: now,
            deadline_date_time: deadline,
            is_persistent: false,
        })
    }

    /// Returns true if the dispatcher may currently pick this task.
    #[must_use]
    pub fn is_dispatchable(&self) -> bool {
        self.mode.is_dispatchable() && self.lifecycle_status.is_dispatchable()
    }
}

/// Validates an attachments payload.
///
/// Attachment schemas are keyed by `class_name` on the executor side; the
/// controller only enforces the structural contract.
///
/// # Errors
///
/// Returns a validation error if the payload is not a JSON object.
pub fn validate_attachments(value: &Value) -> Result<()> {
    if value.is_object() {
        Ok(())
    } else {
        Err(Error::validation(
            "attachments must be a JSON object".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(mode: TaskMode, status: TaskLifecycleStatus) -> Task {
        let now = Utc::now();
        let mut task = Task::new(
            TaskId::new("t1").unwrap(),
            "VideoTranscode",
            "test",
            mode,
            5,
            None,
            now,
            now + chrono::Duration::days(7),
        )
        .unwrap();
        task.lifecycle_status = status;
        task
    }

    #[test]
    fn heartbeat_boundaries() {
        assert!(heartbeat::is_progress(0));
        assert!(heartbeat::is_progress(199));
        assert!(!heartbeat::is_progress(200));
        assert!(!heartbeat::is_progress(-1));
        assert!(heartbeat::is_terminal(heartbeat::FINISHED));
        assert!(heartbeat::is_terminal(heartbeat::EXCEPTION));
        assert!(heartbeat::is_terminal(heartbeat::CANCELLED));
        assert!(!heartbeat::is_terminal(42));
    }

    #[test]
    fn lifecycle_happy_path() {
        use TaskLifecycleStatus as S;
        assert!(S::Created.can_transition_to(S::Assigning));
        assert!(S::Assigning.can_transition_to(S::Running));
        assert!(S::Running.can_transition_to(S::Finished));
        assert!(!S::Created.can_transition_to(S::Running));
        assert!(!S::Created.can_transition_to(S::Finished));
    }

    #[test]
    fn lifecycle_failure_and_demotion() {
        use TaskLifecycleStatus as S;
        // Assignment timeout demotes back to Created.
        assert!(S::Assigning.can_transition_to(S::Created));
        assert!(S::Assigning.can_transition_to(S::Failed));
        assert!(S::Running.can_transition_to(S::Failed));
        assert!(!S::Running.can_transition_to(S::Created));
    }

    #[test]
    fn lifecycle_terminal_states_are_sinks() {
        use TaskLifecycleStatus as S;
        for terminal in [S::Finished, S::Failed, S::Cancelled] {
            assert!(terminal.is_terminal());
            assert!(terminal.valid_transitions().is_empty());
            assert!(!terminal.can_transition_to(S::Created));
        }
    }

    #[test]
    fn paused_requeues_and_dispatches() {
        use TaskLifecycleStatus as S;
        assert!(S::Paused.can_transition_to(S::Created));
        assert!(S::Paused.can_transition_to(S::Assigning));
        assert!(S::Paused.is_dispatchable());
    }

    #[test]
    fn any_non_terminal_cancels() {
        use TaskLifecycleStatus as S;
        for status in [S::Created, S::Assigning, S::Running, S::Paused] {
            assert!(status.can_transition_to(S::Cancelled));
        }
    }

    #[test]
    fn status_wire_format_roundtrip() {
        for status in [
            TaskLifecycleStatus::Created,
            TaskLifecycleStatus::Assigning,
            TaskLifecycleStatus::Running,
            TaskLifecycleStatus::Paused,
            TaskLifecycleStatus::Finished,
            TaskLifecycleStatus::Failed,
            TaskLifecycleStatus::Cancelled,
        ] {
            let parsed = TaskLifecycleStatus::parse(&status.to_string()).unwrap();
            assert_eq!(parsed, status);
        }
        assert!(TaskLifecycleStatus::parse("Exploded").is_err());
    }

    #[test]
    fn only_passive_tasks_are_dispatchable() {
        assert!(task(TaskMode::Passive, TaskLifecycleStatus::Created).is_dispatchable());
        assert!(task(TaskMode::Passive, TaskLifecycleStatus::Paused).is_dispatchable());
        assert!(!task(TaskMode::Active, TaskLifecycleStatus::Created).is_dispatchable());
        assert!(!task(TaskMode::PassiveProcess, TaskLifecycleStatus::Created).is_dispatchable());
        assert!(!task(TaskMode::Passive, TaskLifecycleStatus::Running).is_dispatchable());
    }

    #[test]
    fn priority_out_of_range_rejected() {
        let now = Utc::now();
        let result = Task::new(
            TaskId::new("t1").unwrap(),
            "W",
            "test",
            TaskMode::Passive,
            11,
            None,
            now,
            now,
        );
        assert!(result.is_err());
    }

    #[test]
    fn attachments_must_be_object() {
        assert!(validate_attachments(&serde_json::json!({"fps": 30})).is_ok());
        assert!(validate_attachments(&serde_json::json!([1, 2, 3])).is_err());
        assert!(validate_attachments(&serde_json::json!("raw")).is_err());
    }

    #[test]
    fn task_serializes_millis_and_camel_case() {
        let now = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let task = Task::new(
            TaskId::new("t1").unwrap(),
            "W",
            "test",
            TaskMode::Passive,
            3,
            None,
            now,
            now,
        )
        .unwrap();
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["className"], "W");
        assert_eq!(json["lifecycleStatus"], "Created");
        assert_eq!(json["createDateTime"], 1_700_000_000_000_i64);
    }
}

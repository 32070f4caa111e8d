//! Pluggable persistence for task documents.
//!
//! The `TaskRepository` trait defines the document-store surface the
//! controller needs. Lifecycle transitions use compare-and-swap against
//! the allowed current statuses so concurrent writers (dispatcher,
//! reconciler, API) cannot double-apply a transition; a losing CAS is a
//! normal outcome, not an error.

pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use serde_json::Value;

use skalds_core::{SkaldId, Task, TaskId, TaskLifecycleStatus};

use crate::error::Result;

pub use memory::MemoryTaskRepository;
pub use mongo::MongoTaskRepository;

/// Result of a compare-and-swap lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The transition was applied.
    Applied,
    /// The task does not exist.
    NotFound,
    /// The current status was outside the expected set; some other
    /// writer won the race.
    Lost {
        /// The status that was actually found.
        actual: TaskLifecycleStatus,
    },
}

impl CasOutcome {
    /// Returns true if the transition was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Filter for task list queries.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Match tasks whose status is in this set (empty = any).
    pub statuses: Vec<TaskLifecycleStatus>,
    /// Match tasks with this implementation class.
    pub class_name: Option<String>,
    /// Match tasks assigned to this executor.
    pub executor: Option<SkaldId>,
    /// Match a single task id.
    pub id: Option<TaskId>,
}

impl TaskFilter {
    /// Returns true if the task matches every set criterion.
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&task.lifecycle_status) {
            return false;
        }
        if let Some(class_name) = &self.class_name {
            if &task.class_name != class_name {
                return false;
            }
        }
        if let Some(executor) = &self.executor {
            if task.executor.as_ref() != Some(executor) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if &task.id != id {
                return false;
            }
        }
        true
    }
}

/// One page of a task list query.
#[derive(Debug, Clone)]
pub struct TaskPage {
    /// The tasks on this page.
    pub items: Vec<Task>,
    /// Total matching tasks across all pages.
    pub total: u64,
}

/// Document-store operations on the tasks collection.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Inserts a new task.
    ///
    /// Fails with `AlreadyExists` on id collision.
    async fn create_task(&self, task: &Task) -> Result<()>;

    /// Gets a task by id. Returns `None` when absent.
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>>;

    /// Lists tasks matching the filter, paginated (1-based pages).
    ///
    /// Results are ordered by creation time ascending for stable paging.
    async fn list_tasks(&self, filter: &TaskFilter, page: u32, page_size: u32) -> Result<TaskPage>;

    /// Returns all tasks whose status is `Assigning` or `Running`.
    async fn list_monitored_tasks(&self) -> Result<Vec<Task>>;

    /// Returns `Passive` tasks in `Created` or `Paused`, ordered by
    /// priority descending then creation time ascending.
    async fn list_dispatchable_tasks(&self) -> Result<Vec<Task>>;

    /// Atomically transitions the lifecycle status if the current status
    /// is within `expected`, bumping `update_date_time`.
    ///
    /// The transition is also validated against the state machine; an
    /// invalid `expected -> to` pair is an `InvalidStateTransition` error
    /// rather than a CAS loss.
    async fn update_lifecycle_status(
        &self,
        id: &TaskId,
        to: TaskLifecycleStatus,
        expected: &[TaskLifecycleStatus],
    ) -> Result<CasOutcome>;

    /// Sets or clears the executor, bumping `update_date_time`.
    async fn update_executor(&self, id: &TaskId, executor: Option<SkaldId>) -> Result<()>;

    /// Replaces the attachments payload, bumping `update_date_time`.
    async fn update_attachments(&self, id: &TaskId, attachments: Value) -> Result<()>;

    /// Verifies the store is reachable.
    async fn ping(&self) -> Result<()>;
}

/// Validates that a CAS request is consistent with the state machine.
///
/// Every expected status must be able to reach `to`; this catches caller
/// bugs before they hit the store.
pub(crate) fn validate_cas_request(
    to: TaskLifecycleStatus,
    expected: &[TaskLifecycleStatus],
) -> Result<()> {
    if expected.is_empty() {
        return Err(crate::error::Error::InvalidStateTransition {
            from: "<empty>".to_string(),
            to: to.to_string(),
            reason: "expected status set cannot be empty".to_string(),
        });
    }
    for from in expected {
        if !from.can_transition_to(to) {
            return Err(crate::error::Error::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
                reason: format!("valid transitions from {from}: {:?}", from.valid_transitions()),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use skalds_core::TaskMode;

    fn task(id: &str, class: &str, status: TaskLifecycleStatus) -> Task {
        let now = Utc::now();
        let mut task = Task::new(
            TaskId::new(id).unwrap(),
            class,
            "test",
            TaskMode::Passive,
            0,
            None,
            now,
            now,
        )
        .unwrap();
        task.lifecycle_status = status;
        task
    }

    #[test]
    fn filter_matches_status_set() {
        let filter = TaskFilter {
            statuses: vec![TaskLifecycleStatus::Running, TaskLifecycleStatus::Assigning],
            ..TaskFilter::default()
        };
        assert!(filter.matches(&task("a", "W", TaskLifecycleStatus::Running)));
        assert!(!filter.matches(&task("a", "W", TaskLifecycleStatus::Created)));
    }

    #[test]
    fn filter_matches_class_and_executor() {
        let mut running = task("a", "W", TaskLifecycleStatus::Running);
        running.executor = Some(SkaldId::new("s1").unwrap());

        let filter = TaskFilter {
            class_name: Some("W".to_string()),
            executor: Some(SkaldId::new("s1").unwrap()),
            ..TaskFilter::default()
        };
        assert!(filter.matches(&running));

        let filter = TaskFilter {
            executor: Some(SkaldId::new("s2").unwrap()),
            ..TaskFilter::default()
        };
        assert!(!filter.matches(&running));
    }

    #[test]
    fn cas_request_validation() {
        use TaskLifecycleStatus as S;
        validate_cas_request(S::Assigning, &[S::Created, S::Paused]).unwrap();
        validate_cas_request(S::Cancelled, &[S::Running]).unwrap();
        // Finished is terminal: it cannot be an expected source.
        assert!(validate_cas_request(S::Running, &[S::Finished]).is_err());
        assert!(validate_cas_request(S::Running, &[]).is_err());
    }

    #[test]
    fn cas_outcome_applied() {
        assert!(CasOutcome::Applied.is_applied());
        assert!(!CasOutcome::NotFound.is_applied());
        assert!(
            !CasOutcome::Lost {
                actual: TaskLifecycleStatus::Cancelled
            }
            .is_applied()
        );
    }
}

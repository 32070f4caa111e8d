//! In-memory task repository for tests and local composition.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use skalds_core::{Clock, SkaldId, SystemClock, Task, TaskId, TaskLifecycleStatus};

use crate::error::{Error, Result};

use super::{CasOutcome, TaskFilter, TaskPage, TaskRepository, validate_cas_request};

/// In-memory implementation of [`TaskRepository`].
///
/// CAS runs under a single write lock, which gives the same atomicity the
/// production store provides per document.
pub struct MemoryTaskRepository {
    tasks: RwLock<HashMap<TaskId, Task>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryTaskRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTaskRepository").finish_non_exhaustive()
    }
}

impl Default for MemoryTaskRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskRepository {
    /// Creates an empty repository on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty repository on an explicit clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            clock,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TaskId, Task>> {
        self.tasks.read().expect("repository lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TaskId, Task>> {
        self.tasks.write().expect("repository lock poisoned")
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.write();
        if tasks.contains_key(&task.id) {
            return Err(Error::Core(skalds_core::Error::already_exists(
                "task",
                &task.id,
            )));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.read().get(id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter, page: u32, page_size: u32) -> Result<TaskPage> {
        let mut matching: Vec<Task> = self
            .read()
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.create_date_time
                .cmp(&b.create_date_time)
                .then_with(|| a.id.cmp(&b.id))
        });

        let total = matching.len() as u64;
        let offset = (page.saturating_sub(1) as usize) * page_size as usize;
        let items = matching
            .into_iter()
            .skip(offset)
            .take(page_size as usize)
            .collect();
        Ok(TaskPage { items, total })
    }

    async fn list_monitored_tasks(&self) -> Result<Vec<Task>> {
        Ok(self
            .read()
            .values()
            .filter(|task| task.lifecycle_status.is_monitored())
            .cloned()
            .collect())
    }

    async fn list_dispatchable_tasks(&self) -> Result<Vec<Task>> {
        let mut dispatchable: Vec<Task> = self
            .read()
            .values()
            .filter(|task| task.is_dispatchable())
            .cloned()
            .collect();
        dispatchable.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.create_date_time.cmp(&b.create_date_time))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(dispatchable)
    }

    async fn update_lifecycle_status(
        &self,
        id: &TaskId,
        to: TaskLifecycleStatus,
        expected: &[TaskLifecycleStatus],
    ) -> Result<CasOutcome> {
        validate_cas_request(to, expected)?;
        let now = self.clock.now();
        let mut tasks = self.write();
        let Some(task) = tasks.get_mut(id) else {
            return Ok(CasOutcome::NotFound);
        };
        if !expected.contains(&task.lifecycle_status) {
            return Ok(CasOutcome::Lost {
                actual: task.lifecycle_status,
            });
        }
        task.lifecycle_status = to;
        task.update_date_time = now;
        Ok(CasOutcome::Applied)
    }

    async fn update_executor(&self, id: &TaskId, executor: Option<SkaldId>) -> Result<()> {
        let now = self.clock.now();
        let mut tasks = self.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound { task_id: id.clone() })?;
        task.executor = executor;
        task.update_date_time = now;
        Ok(())
    }

    async fn update_attachments(&self, id: &TaskId, attachments: Value) -> Result<()> {
        skalds_core::model::task::validate_attachments(&attachments)
            .map_err(Error::Core)?;
        let now = self.clock.now();
        let mut tasks = self.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound { task_id: id.clone() })?;
        task.attachments = Some(attachments);
        task.update_date_time = now;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

//! Monitored-task view: one record per Assigning/Running task.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use skalds_core::{SkaldId, TaskId, TaskLifecycleStatus};

/// Volatile observations for one monitored task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Task identifier.
    pub id: TaskId,
    /// Lifecycle status at the last repository read.
    pub lifecycle_status: TaskLifecycleStatus,
    /// Executor the repository names for the task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<SkaldId>,
    /// Latest heartbeat, if the worker has written one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<i32>,
    /// Sliding history of heartbeat samples, oldest first.
    pub heartbeat_history: VecDeque<i32>,
    /// Worker-reported error string (empty string never stored).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Worker-reported exception string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    /// When the monitor last refreshed this record.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub observed_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Creates an empty record for a task entering the monitored set.
    #[must_use]
    pub fn new(id: TaskId, status: TaskLifecycleStatus, observed_at: DateTime<Utc>) -> Self {
        Self {
            id,
            lifecycle_status: status,
            executor: None,
            heartbeat: None,
            heartbeat_history: VecDeque::new(),
            error: None,
            exception: None,
            observed_at,
        }
    }

    /// Appends a heartbeat sample, keeping the window bounded.
    ///
    /// Missing heartbeats are not appended: a task that has never
    /// reported cannot saturate the window with synthetic values.
    pub fn record_heartbeat(&mut self, heartbeat: i32, window: usize) {
        self.heartbeat = Some(heartbeat);
        self.heartbeat_history.push_back(heartbeat);
        while self.heartbeat_history.len() > window {
            self.heartbeat_history.pop_front();
        }
    }

    /// Returns true if the window is saturated and every sample is equal.
    #[must_use]
    pub fn history_saturated_equal(&self, window: usize) -> bool {
        if self.heartbeat_history.len() < window {
            return false;
        }
        let mut iter = self.heartbeat_history.iter();
        let Some(first) = iter.next() else {
            return false;
        };
        iter.all(|sample| sample == first)
    }
}

/// A change notification from the store.
#[derive(Debug, Clone)]
pub enum TaskStoreEvent {
    /// A record was inserted or refreshed.
    Updated(TaskRecord),
    /// A task left the monitored set.
    Removed(TaskId),
}

/// Concurrent monitored-task view with snapshot readers and a change
/// stream.
pub struct TaskStore {
    records: RwLock<HashMap<TaskId, TaskRecord>>,
    changes: broadcast::Sender<TaskStoreEvent>,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("records", &self.len())
            .finish_non_exhaustive()
    }
}

impl TaskStore {
    /// Creates an empty store; `capacity` bounds each subscriber's queue.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            records: RwLock::new(HashMap::new()),
            changes,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TaskId, TaskRecord>> {
        self.records.read().expect("task store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TaskId, TaskRecord>> {
        self.records.write().expect("task store lock poisoned")
    }

    /// Inserts or replaces a record.
    pub fn upsert(&self, record: TaskRecord) {
        self.write().insert(record.id.clone(), record.clone());
        let _ = self.changes.send(TaskStoreEvent::Updated(record));
    }

    /// Merges a partial update into an existing record, inserting a fresh
    /// one first when the id is new.
    pub fn merge(
        &self,
        id: &TaskId,
        insert: impl FnOnce() -> TaskRecord,
        merge: impl FnOnce(&mut TaskRecord),
    ) {
        let updated = {
            let mut records = self.write();
            let record = records.entry(id.clone()).or_insert_with(insert);
            merge(record);
            record.clone()
        };
        let _ = self.changes.send(TaskStoreEvent::Updated(updated));
    }

    /// Removes a record (the task left the monitored set).
    pub fn remove(&self, id: &TaskId) {
        let removed = self.write().remove(id).is_some();
        if removed {
            let _ = self.changes.send(TaskStoreEvent::Removed(id.clone()));
        }
    }

    /// Returns a clone of one record.
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<TaskRecord> {
        self.read().get(id).cloned()
    }

    /// Returns a copy-on-read snapshot of all records.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TaskRecord> {
        self.read().values().cloned().collect()
    }

    /// Returns the ids currently monitored.
    #[must_use]
    pub fn ids(&self) -> Vec<TaskId> {
        self.read().keys().cloned().collect()
    }

    /// Returns the record count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Subscribes to record changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskStoreEvent> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> TaskRecord {
        TaskRecord::new(
            TaskId::new(id).unwrap(),
            TaskLifecycleStatus::Running,
            Utc::now(),
        )
    }

    #[test]
    fn history_saturation_detects_flat_window() {
        let mut rec = record("t1");
        for _ in 0..4 {
            rec.record_heartbeat(42, 5);
        }
        assert!(!rec.history_saturated_equal(5));

        rec.record_heartbeat(42, 5);
        assert!(rec.history_saturated_equal(5));

        // One moving sample resets the verdict.
        rec.record_heartbeat(43, 5);
        assert!(!rec.history_saturated_equal(5));
    }

    #[test]
    fn history_window_slides() {
        let mut rec = record("t1");
        for beat in [50, 50, 51, 50, 50] {
            rec.record_heartbeat(beat, 5);
        }
        assert!(!rec.history_saturated_equal(5));

        // The differing sample ages out after three more flat samples.
        for _ in 0..3 {
            rec.record_heartbeat(50, 5);
        }
        assert!(rec.history_saturated_equal(5));
    }

    #[tokio::test]
    async fn merge_inserts_then_updates() {
        let store = TaskStore::new(16);
        let mut changes = store.subscribe();
        let id = TaskId::new("t1").unwrap();

        store.merge(
            &id,
            || record("t1"),
            |rec| rec.record_heartbeat(7, 5),
        );
        let TaskStoreEvent::Updated(rec) = changes.recv().await.unwrap() else {
            panic!("expected update");
        };
        assert_eq!(rec.heartbeat, Some(7));

        store.merge(
            &id,
            || record("t1"),
            |rec| rec.error = Some("disk full".to_string()),
        );
        let rec = store.get(&id).unwrap();
        assert_eq!(rec.heartbeat, Some(7));
        assert_eq!(rec.error.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn remove_notifies_once() {
        let store = TaskStore::new(16);
        store.upsert(record("t1"));
        let mut changes = store.subscribe();

        let id = TaskId::new("t1").unwrap();
        store.remove(&id);
        store.remove(&id);

        assert!(matches!(
            changes.recv().await.unwrap(),
            TaskStoreEvent::Removed(removed) if removed.as_str() == "t1"
        ));
        assert!(changes.try_recv().is_err());
    }
}

//! Fleet view: one record per registered skald.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use skalds_core::{SkaldId, SkaldKind, SkaldStatus, TaskId};

/// A fleet member as observed by the skald monitor.
///
/// Never persisted: records appear when the executor registers in the
/// cache and disappear on stale eviction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkaldRecord {
    /// Unique skald identifier.
    pub id: SkaldId,
    /// Deployment kind; only `Node` is dispatch-eligible.
    pub kind: SkaldKind,
    /// Derived liveness.
    pub status: SkaldStatus,
    /// Last-active timestamp reported through the registry hash.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_active: DateTime<Utc>,
    /// Last observed heartbeat counter.
    pub heartbeat: i32,
    /// Bounded ring of recent heartbeat samples, oldest first.
    pub heartbeat_history: VecDeque<i32>,
    /// Task class names the executor advertises.
    pub supported_task_types: BTreeSet<String>,
    /// Task ids the executor claims to be running.
    pub current_tasks: BTreeSet<TaskId>,
}

impl SkaldRecord {
    /// Creates a record for a newly-registered skald.
    #[must_use]
    pub fn new(id: SkaldId, kind: SkaldKind, last_active: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            status: SkaldStatus::Offline,
            last_active,
            heartbeat: 0,
            heartbeat_history: VecDeque::new(),
            supported_task_types: BTreeSet::new(),
            current_tasks: BTreeSet::new(),
        }
    }

    /// Appends a heartbeat sample, keeping the ring bounded.
    pub fn record_heartbeat(&mut self, heartbeat: i32, window: usize) {
        self.heartbeat = heartbeat;
        self.heartbeat_history.push_back(heartbeat);
        while self.heartbeat_history.len() > window {
            self.heartbeat_history.pop_front();
        }
    }

    /// Returns the number of tasks the executor claims.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.current_tasks.len()
    }

    /// Returns true if the executor advertises the given task class.
    #[must_use]
    pub fn supports(&self, class_name: &str) -> bool {
        self.supported_task_types.contains(class_name)
    }

    /// Returns true if the dispatcher may assign to this skald.
    #[must_use]
    pub fn is_dispatch_candidate(&self, class_name: &str) -> bool {
        self.kind.is_dispatch_eligible()
            && self.status == SkaldStatus::Online
            && self.supports(class_name)
    }
}

/// A change notification from the store.
#[derive(Debug, Clone)]
pub enum SkaldStoreEvent {
    /// A record was inserted or replaced.
    Updated(SkaldRecord),
    /// A record was evicted.
    Removed(SkaldId),
}

/// Concurrent fleet view with snapshot readers and a change stream.
pub struct SkaldStore {
    records: RwLock<HashMap<SkaldId, SkaldRecord>>,
    changes: broadcast::Sender<SkaldStoreEvent>,
}

impl std::fmt::Debug for SkaldStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkaldStore")
            .field("records", &self.len())
            .finish_non_exhaustive()
    }
}

impl SkaldStore {
    /// Creates an empty store; `capacity` bounds each subscriber's queue.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            records: RwLock::new(HashMap::new()),
            changes,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SkaldId, SkaldRecord>> {
        self.records.read().expect("skald store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SkaldId, SkaldRecord>> {
        self.records.write().expect("skald store lock poisoned")
    }

    /// Inserts or replaces a record.
    pub fn upsert(&self, record: SkaldRecord) {
        self.write().insert(record.id.clone(), record.clone());
        let _ = self.changes.send(SkaldStoreEvent::Updated(record));
    }

    /// Merges a partial update into an existing record.
    ///
    /// Returns false (and publishes nothing) when the id is unknown.
    pub fn update_with(&self, id: &SkaldId, merge: impl FnOnce(&mut SkaldRecord)) -> bool {
        let updated = {
            let mut records = self.write();
            let Some(record) = records.get_mut(id) else {
                return false;
            };
            merge(record);
            record.clone()
        };
        let _ = self.changes.send(SkaldStoreEvent::Updated(updated));
        true
    }

    /// Removes a record.
    pub fn remove(&self, id: &SkaldId) {
        let removed = self.write().remove(id).is_some();
        if removed {
            let _ = self.changes.send(SkaldStoreEvent::Removed(id.clone()));
        }
    }

    /// Returns a clone of one record.
    #[must_use]
    pub fn get(&self, id: &SkaldId) -> Option<SkaldRecord> {
        self.read().get(id).cloned()
    }

    /// Returns a copy-on-read snapshot of all records.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SkaldRecord> {
        self.read().values().cloned().collect()
    }

    /// Returns the ids currently present.
    #[must_use]
    pub fn ids(&self) -> Vec<SkaldId> {
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
    pub fn subscribe(&self) -> broadcast::Receiver<SkaldStoreEvent> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, kind: SkaldKind) -> SkaldRecord {
        SkaldRecord::new(SkaldId::new(id).unwrap(), kind, Utc::now())
    }

    #[test]
    fn heartbeat_ring_is_bounded() {
        let mut rec = record("s1", SkaldKind::Node);
        for beat in 0..8 {
            rec.record_heartbeat(beat, 5);
        }
        assert_eq!(rec.heartbeat, 7);
        assert_eq!(rec.heartbeat_history, VecDeque::from(vec![3, 4, 5, 6, 7]));
    }

    #[test]
    fn dispatch_candidate_requires_all_three() {
        let mut rec = record("s1", SkaldKind::Node);
        rec.supported_task_types.insert("W".to_string());
        assert!(!rec.is_dispatch_candidate("W")); // offline

        rec.status = SkaldStatus::Online;
        assert!(rec.is_dispatch_candidate("W"));
        assert!(!rec.is_dispatch_candidate("X")); // unsupported class

        rec.kind = SkaldKind::Edge;
        assert!(!rec.is_dispatch_candidate("W")); // wrong kind
    }

    #[tokio::test]
    async fn upsert_and_remove_notify_subscribers() {
        let store = SkaldStore::new(16);
        let mut changes = store.subscribe();

        store.upsert(record("s1", SkaldKind::Node));
        assert!(matches!(
            changes.recv().await.unwrap(),
            SkaldStoreEvent::Updated(rec) if rec.id.as_str() == "s1"
        ));

        store.remove(&SkaldId::new("s1").unwrap());
        assert!(matches!(
            changes.recv().await.unwrap(),
            SkaldStoreEvent::Removed(id) if id.as_str() == "s1"
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn update_with_unknown_id_is_noop() {
        let store = SkaldStore::new(16);
        assert!(!store.update_with(&SkaldId::new("ghost").unwrap(), |_| {}));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let store = SkaldStore::new(16);
        store.upsert(record("s1", SkaldKind::Node));
        let snapshot = store.snapshot();
        store.remove(&SkaldId::new("s1").unwrap());
        assert_eq!(snapshot.len(), 1);
        assert!(store.is_empty());
    }
}

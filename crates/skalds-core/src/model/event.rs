//! Control-event topics and payloads carried over the event log.
//!
//! Every message is keyed by a single task id so each topic stays
//! partition-ordered per task. Consumers are expected to be idempotent on
//! `(task_id, updateDateTime)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{SkaldId, TaskId};

/// The partitioned topics the platform publishes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    /// Dispatcher → skalds: a task was assigned to a specific recipient.
    TaskAssign,
    /// Controller → all skalds: release the named task (broadcast;
    /// executors ignore ids they do not own).
    TaskCancel,
    /// Controller → skalds: the task's attachment payload changed.
    TaskUpdateAttachment,
    /// Skald → worker: intra-executor parameter update.
    TaskWorkerUpdate,
}

impl EventTopic {
    /// Returns the wire topic name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TaskAssign => "task.assign",
            Self::TaskCancel => "task.cancel",
            Self::TaskUpdateAttachment => "task.update.attachment",
            Self::TaskWorkerUpdate => "taskworker.update",
        }
    }
}

impl std::fmt::Display for EventTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON payload for task control events.
///
/// One task per event; the message key is the task id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEventPayload {
    /// The affected task ids (always exactly one in current producers).
    pub task_ids: Vec<TaskId>,
    /// Targeted recipient; set on `task.assign`, absent on broadcasts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<SkaldId>,
    /// The controller instance that produced the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
    /// Task creation instant (epoch millis).
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub create_date_time: DateTime<Utc>,
    /// Task last-update instant (epoch millis); the dedup key component.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub update_date_time: DateTime<Utc>,
}

impl TaskEventPayload {
    /// Creates an assignment payload targeted at one skald.
    #[must_use]
    pub fn assign(
        task_id: TaskId,
        recipient: SkaldId,
        initiator: impl Into<String>,
        created: DateTime<Utc>,
        updated: DateTime<Utc>,
    ) -> Self {
        Self {
            task_ids: vec![task_id],
            recipient: Some(recipient),
            initiator: Some(initiator.into()),
            create_date_time: created,
            update_date_time: updated,
        }
    }

    /// Creates a broadcast cancellation payload.
    #[must_use]
    pub fn cancel(task_id: TaskId, created: DateTime<Utc>, updated: DateTime<Utc>) -> Self {
        Self {
            task_ids: vec![task_id],
            recipient: None,
            initiator: None,
            create_date_time: created,
            update_date_time: updated,
        }
    }

    /// Creates an attachment-update payload.
    #[must_use]
    pub fn update_attachment(
        task_id: TaskId,
        created: DateTime<Utc>,
        updated: DateTime<Utc>,
    ) -> Self {
        Self {
            task_ids: vec![task_id],
            recipient: None,
            initiator: None,
            create_date_time: created,
            update_date_time: updated,
        }
    }

    /// Returns the message key (the single task id).
    #[must_use]
    pub fn key(&self) -> &TaskId {
        &self.task_ids[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_wire_names() {
        assert_eq!(EventTopic::TaskAssign.as_str(), "task.assign");
        assert_eq!(EventTopic::TaskCancel.as_str(), "task.cancel");
        assert_eq!(
            EventTopic::TaskUpdateAttachment.as_str(),
            "task.update.attachment"
        );
        assert_eq!(EventTopic::TaskWorkerUpdate.as_str(), "taskworker.update");
    }

    #[test]
    fn assign_payload_wire_shape() {
        let created = DateTime::from_timestamp_millis(1_000).unwrap();
        let updated = DateTime::from_timestamp_millis(2_000).unwrap();
        let payload = TaskEventPayload::assign(
            TaskId::new("t1").unwrap(),
            SkaldId::new("s1").unwrap(),
            "controller-1",
            created,
            updated,
        );
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["taskIds"], serde_json::json!(["t1"]));
        assert_eq!(json["recipient"], "s1");
        assert_eq!(json["createDateTime"], 1_000);
        assert_eq!(json["updateDateTime"], 2_000);
    }

    #[test]
    fn cancel_payload_is_broadcast() {
        let at = Utc::now();
        let payload = TaskEventPayload::cancel(TaskId::new("ghost").unwrap(), at, at);
        assert!(payload.recipient.is_none());
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("recipient").is_none());
        assert_eq!(payload.key().as_str(), "ghost");
    }
}

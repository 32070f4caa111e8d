//! Event-log adapter for control events.
//!
//! The controller publishes to `task.assign`, `task.cancel`, and
//! `task.update.attachment` and never consumes; executors are the
//! consumers. Producer semantics are at-least-once, so consumers
//! deduplicate on `(task_id, updateDateTime)`. The message key is always
//! the task id, which keeps each topic partition-ordered per task.

pub mod kafka;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use skalds_core::{EventTopic, TaskEventPayload, TaskId};

use crate::error::{Error, Result};

pub use kafka::KafkaEventBus;

/// A record of one published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedEvent {
    /// The topic the event went to.
    pub topic: EventTopic,
    /// The message key (the task id).
    pub key: TaskId,
    /// The JSON payload.
    pub payload: TaskEventPayload,
}

/// A consumer handle over a group's assigned partitions.
#[async_trait]
pub trait EventSubscriber: Send {
    /// Waits for the next event. `None` means the stream ended.
    async fn next_event(&mut self) -> Result<Option<PublishedEvent>>;
}

/// Producer/consumer surface of the partitioned event log.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes one event with at-least-once semantics.
    async fn publish(&self, topic: EventTopic, payload: &TaskEventPayload) -> Result<()>;

    /// Joins a consumer group over the given topics.
    async fn subscribe(
        &self,
        topics: &[EventTopic],
        group: &str,
    ) -> Result<Box<dyn EventSubscriber>>;

    /// Verifies the log is reachable.
    async fn ping(&self) -> Result<()>;
}

// ============================================================================
// In-memory bus
// ============================================================================

/// In-memory event bus for tests and local composition.
///
/// Records every publish for assertions and fans events out to
/// subscribers over a broadcast channel, preserving per-key publish
/// order.
pub struct MemoryEventBus {
    published: Mutex<Vec<PublishedEvent>>,
    sender: broadcast::Sender<PublishedEvent>,
}

impl std::fmt::Debug for MemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEventBus").finish_non_exhaustive()
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            published: Mutex::new(Vec::new()),
            sender,
        }
    }

    /// Returns every event published so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedEvent> {
        self.published.lock().expect("event lock poisoned").clone()
    }

    /// Returns the events published to one topic.
    #[must_use]
    pub fn published_on(&self, topic: EventTopic) -> Vec<PublishedEvent> {
        self.published()
            .into_iter()
            .filter(|event| event.topic == topic)
            .collect()
    }

    /// Clears the published-event record.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn clear(&self) {
        self.published.lock().expect("event lock poisoned").clear();
    }
}

struct MemoryEventSubscriber {
    topics: Vec<EventTopic>,
    receiver: broadcast::Receiver<PublishedEvent>,
}

#[async_trait]
impl EventSubscriber for MemoryEventSubscriber {
    async fn next_event(&mut self) -> Result<Option<PublishedEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.topics.contains(&event.topic) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(Error::event(format!(
                        "subscriber lagged, {skipped} events dropped"
                    )));
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, topic: EventTopic, payload: &TaskEventPayload) -> Result<()> {
        let event = PublishedEvent {
            topic,
            key: payload.key().clone(),
            payload: payload.clone(),
        };
        self.published
            .lock()
            .expect("event lock poisoned")
            .push(event.clone());
        // No receivers is fine; the record above is the source of truth.
        let _ = self.sender.send(event);
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[EventTopic],
        _group: &str,
    ) -> Result<Box<dyn EventSubscriber>> {
        Ok(Box::new(MemoryEventSubscriber {
            topics: topics.to_vec(),
            receiver: self.sender.subscribe(),
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Convenience alias used by the composition root.
pub type SharedEventBus = Arc<dyn EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn cancel_payload(task_id: &str) -> TaskEventPayload {
        let now = Utc::now();
        TaskEventPayload::cancel(TaskId::new(task_id).unwrap(), now, now)
    }

    #[tokio::test]
    async fn publish_records_events() {
        let bus = MemoryEventBus::new();
        bus.publish(EventTopic::TaskCancel, &cancel_payload("t1"))
            .await
            .unwrap();
        bus.publish(EventTopic::TaskAssign, &cancel_payload("t2"))
            .await
            .unwrap();

        assert_eq!(bus.published().len(), 2);
        let cancels = bus.published_on(EventTopic::TaskCancel);
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].key.as_str(), "t1");
    }

    #[tokio::test]
    async fn subscriber_receives_in_publish_order() {
        let bus = MemoryEventBus::new();
        let mut subscriber = bus
            .subscribe(&[EventTopic::TaskCancel], "executors")
            .await
            .unwrap();

        for id in ["a", "b", "c"] {
            bus.publish(EventTopic::TaskCancel, &cancel_payload(id))
                .await
                .unwrap();
        }
        // A publish on another topic is filtered out.
        bus.publish(EventTopic::TaskAssign, &cancel_payload("x"))
            .await
            .unwrap();
        bus.publish(EventTopic::TaskCancel, &cancel_payload("d"))
            .await
            .unwrap();

        for expected in ["a", "b", "c", "d"] {
            let event = subscriber.next_event().await.unwrap().unwrap();
            assert_eq!(event.key.as_str(), expected);
        }
    }
}

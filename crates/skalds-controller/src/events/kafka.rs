//! Kafka event bus.
//!
//! Producer settings favor latency over batching (control events are
//! small and rare): `acks=1`, gzip compression, one in-flight request
//! per connection so per-key order survives retries.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;

use skalds_core::{EventTopic, TaskEventPayload, TaskId};

use crate::error::{Error, Result};

use super::{EventBus, EventSubscriber, PublishedEvent};

/// Default event publish deadline.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Kafka implementation of [`EventBus`].
pub struct KafkaEventBus {
    producer: FutureProducer,
    base_config: ClientConfig,
    publish_timeout: Duration,
}

impl std::fmt::Debug for KafkaEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaEventBus")
            .field("publish_timeout", &self.publish_timeout)
            .finish_non_exhaustive()
    }
}

impl KafkaEventBus {
    /// Connects a producer to the given bootstrap servers.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created; startup treats
    /// this as fatal.
    pub fn connect(
        brokers: &str,
        username: Option<&str>,
        password: Option<&str>,
        publish_timeout: Duration,
    ) -> Result<Self> {
        let mut base_config = ClientConfig::new();
        base_config.set("bootstrap.servers", brokers);
        if let (Some(username), Some(password)) = (username, password) {
            base_config
                .set("security.protocol", "SASL_SSL")
                .set("sasl.mechanism", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let producer: FutureProducer = base_config
            .clone()
            .set("acks", "1")
            .set("compression.type", "gzip")
            .set("max.in.flight.requests.per.connection", "1")
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| Error::event_with_source("failed to create kafka producer", e))?;

        Ok(Self {
            producer,
            base_config,
            publish_timeout,
        })
    }
}

#[async_trait]
impl EventBus for KafkaEventBus {
    async fn publish(&self, topic: EventTopic, payload: &TaskEventPayload) -> Result<()> {
        let key = payload.key().clone();
        let body = serde_json::to_vec(payload)
            .map_err(|e| Error::serialization(format!("event payload: {e}")))?;

        let record = FutureRecord::to(topic.as_str())
            .key(key.as_str())
            .payload(&body);

        match self
            .producer
            .send(record, Timeout::After(self.publish_timeout))
            .await
        {
            Ok(_delivery) => {
                tracing::debug!(
                    topic = topic.as_str(),
                    key = key.as_str(),
                    "event published"
                );
                Ok(())
            }
            Err((err, _message)) => Err(Error::event_with_source(
                format!("publish to {topic} failed"),
                err,
            )),
        }
    }

    async fn subscribe(
        &self,
        topics: &[EventTopic],
        group: &str,
    ) -> Result<Box<dyn EventSubscriber>> {
        let consumer: StreamConsumer = self
            .base_config
            .clone()
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()
            .map_err(|e| Error::event_with_source("failed to create kafka consumer", e))?;

        let names: Vec<&str> = topics.iter().map(|topic| topic.as_str()).collect();
        consumer
            .subscribe(&names)
            .map_err(|e| Error::event_with_source("failed to subscribe", e))?;

        Ok(Box::new(KafkaEventSubscriber { consumer }))
    }

    async fn ping(&self) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, Timeout::After(Duration::from_secs(2)))
                .map(|_| ())
        })
        .await
        .map_err(|e| Error::event(format!("metadata task failed: {e}")))?
        .map_err(|e| Error::event_with_source("kafka unreachable", e))
    }
}

struct KafkaEventSubscriber {
    consumer: StreamConsumer,
}

#[async_trait]
impl EventSubscriber for KafkaEventSubscriber {
    async fn next_event(&mut self) -> Result<Option<PublishedEvent>> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| Error::event_with_source("consume failed", e))?;

        let topic = match message.topic() {
            "task.assign" => EventTopic::TaskAssign,
            "task.cancel" => EventTopic::TaskCancel,
            "task.update.attachment" => EventTopic::TaskUpdateAttachment,
            "taskworker.update" => EventTopic::TaskWorkerUpdate,
            other => {
                return Err(Error::event(format!("unexpected topic: {other}")));
            }
        };

        let key = message
            .key()
            .and_then(|key| std::str::from_utf8(key).ok())
            .ok_or_else(|| Error::event("message without a utf-8 key"))?;
        let payload = message
            .payload()
            .ok_or_else(|| Error::event("message without a payload"))?;
        let payload: TaskEventPayload = serde_json::from_slice(payload)
            .map_err(|e| Error::serialization(format!("event payload: {e}")))?;

        Ok(Some(PublishedEvent {
            topic,
            key: TaskId::new(key).map_err(Error::Core)?,
            payload,
        }))
    }
}

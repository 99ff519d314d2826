//! Status-change events on a JetStream stream.

use async_nats::jetstream::{
    self, consumer::pull::Config as ConsumerConfig, stream::Config as StreamConfig,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use strata_core::events::Event;
use strata_core::ports::{EventBus, EventStream};
use strata_core::{Error, Result};
use tracing::debug;

use crate::connection::NatsConnection;

/// Subjects the event stream captures; see `Event::subject`.
const EVENT_SUBJECTS: &[&str] = &["job.>", "agent.>"];

/// Event bus backed by a limits-retention stream, so late subscribers can
/// replay history.
#[derive(Clone)]
pub struct NatsEventBus {
    connection: NatsConnection,
}

impl NatsEventBus {
    pub async fn new(connection: NatsConnection) -> Result<Self> {
        let config = connection.config();
        connection
            .ensure_stream(StreamConfig {
                name: config.event_stream.clone(),
                subjects: EVENT_SUBJECTS.iter().map(|s| s.to_string()).collect(),
                retention: jetstream::stream::RetentionPolicy::Limits,
                max_age: config.max_age(),
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await?;

        Ok(Self { connection })
    }

    /// Subscribe with a durable consumer shared by every member of `group`.
    pub async fn subscribe_with_group(&self, pattern: &str, group: &str) -> Result<EventStream> {
        debug!("Subscribing to pattern {} with group {}", pattern, group);
        self.subscribe_with(ConsumerConfig {
            durable_name: Some(group.to_string()),
            filter_subject: pattern.to_string(),
            max_deliver: self.connection.config().max_deliver,
            ack_wait: Duration::from_secs(30),
            ..Default::default()
        })
        .await
    }

    /// Replay events matching `pattern` from `start_sequence` on.
    pub async fn replay_from_sequence(
        &self,
        pattern: &str,
        start_sequence: u64,
    ) -> Result<EventStream> {
        debug!("Replaying from sequence {} for pattern {}", start_sequence, pattern);
        self.subscribe_with(ConsumerConfig {
            filter_subject: pattern.to_string(),
            deliver_policy: jetstream::consumer::DeliverPolicy::ByStartSequence { start_sequence },
            ..Default::default()
        })
        .await
    }

    pub async fn stream_info(&self) -> Result<StreamInfo> {
        let name = &self.connection.config().event_stream;
        let mut stream = self
            .connection
            .jetstream()
            .get_stream(name)
            .await
            .map_err(|e| Error::EventBus(format!("Failed to get stream: {}", e)))?;

        let info = stream
            .info()
            .await
            .map_err(|e| Error::EventBus(format!("Failed to get stream info: {}", e)))?;

        Ok(StreamInfo {
            name: info.config.name.clone(),
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_seq: info.state.first_sequence,
            last_seq: info.state.last_sequence,
            consumer_count: info.state.consumer_count,
        })
    }

    async fn subscribe_with(&self, consumer: ConsumerConfig) -> Result<EventStream> {
        let consumer = self
            .connection
            .jetstream()
            .create_consumer_on_stream(consumer, &self.connection.config().event_stream)
            .await
            .map_err(|e| Error::EventBus(format!("Failed to create consumer: {}", e)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| Error::EventBus(format!("Failed to get messages: {}", e)))?;

        let connection = self.connection.clone();
        let stream = messages.then(move |message| {
            let connection = connection.clone();
            async move {
                if connection.is_shutdown() {
                    return Err(Error::EventBus("Shutdown in progress".to_string()));
                }
                let message =
                    message.map_err(|e| Error::EventBus(format!("Message error: {}", e)))?;
                connection.metrics().record_receive(message.payload.len() as u64);

                if let Err(e) = message.ack().await {
                    debug!("Failed to ack event: {}", e);
                }
                serde_json::from_slice::<Event>(&message.payload)
                    .map_err(|e| Error::Serialization(e.to_string()))
            }
        });

        Ok(Box::pin(stream))
    }
}

/// Information about a JetStream stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub name: String,
    pub messages: u64,
    pub bytes: u64,
    pub first_seq: u64,
    pub last_seq: u64,
    pub consumer_count: usize,
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        if self.connection.is_shutdown() {
            return Err(Error::EventBus(
                "Cannot publish: shutdown in progress".to_string(),
            ));
        }

        let subject = event.subject();
        let payload =
            serde_json::to_vec(&event).map_err(|e| Error::Serialization(e.to_string()))?;
        let payload_len = payload.len() as u64;
        debug!("Publishing event to {}", subject);

        let metrics = self.connection.metrics();
        match self
            .connection
            .jetstream()
            .publish(subject.clone(), payload.into())
            .await
        {
            Ok(ack) => {
                ack.await
                    .map_err(|e| Error::EventBus(format!("Failed to confirm publish: {}", e)))?;
                metrics.record_publish(payload_len);
                Ok(())
            }
            Err(e) => {
                metrics.record_publish_failure();
                Err(Error::EventBus(format!(
                    "Failed to publish to {}: {}",
                    subject, e
                )))
            }
        }
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        debug!("Subscribing to pattern: {}", pattern);
        self.subscribe_with(ConsumerConfig {
            filter_subject: pattern.to_string(),
            max_deliver: self.connection.config().max_deliver,
            ack_wait: Duration::from_secs(30),
            ..Default::default()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_subjects_are_captured() {
        use strata_core::agent::AgentStatus;
        use strata_core::events::AgentStatusChangedPayload;
        use strata_core::ids::AgentId;

        let event = Event::AgentStatusChanged(AgentStatusChangedPayload {
            agent_id: AgentId::new(),
            name: "builder-1".to_string(),
            from: AgentStatus::Idle,
            to: AgentStatus::Busy,
            job_id: None,
            timestamp: chrono::Utc::now(),
        });
        let subject = event.subject();
        assert!(
            EVENT_SUBJECTS
                .iter()
                .any(|p| subject.starts_with(p.trim_end_matches('>')))
        );
    }
}

//! Agent command queues and the shared result queue.

use async_nats::jetstream::{
    self, consumer::pull::Config as ConsumerConfig, stream::Config as StreamConfig,
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use strata_core::cmd::{Command, StepResult};
use strata_core::ports::{QueueService, ResultStream};
use strata_core::{Error, Result};
use tracing::{debug, info, warn};

use crate::connection::NatsConnection;

/// Commands as seen by an agent consuming its own queue.
pub type CommandStream = Pin<Box<dyn Stream<Item = Result<Command>> + Send>>;

/// Each agent queue is a work-queue stream of its own, so deleting the
/// queue drops whatever the agent never picked up.
#[derive(Clone)]
pub struct NatsQueueService {
    connection: NatsConnection,
}

impl NatsQueueService {
    pub async fn new(connection: NatsConnection) -> Result<Self> {
        let config = connection.config();
        connection
            .ensure_stream(StreamConfig {
                name: config.result_stream.clone(),
                subjects: vec![format!("{}.>", config.result_subject)],
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                max_age: config.max_age(),
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await?;

        Ok(Self { connection })
    }

    /// Subject an agent reports the result of `result.cmd_id` on.
    pub fn result_subject(&self, result: &StepResult) -> String {
        format!("{}.{}", self.connection.config().result_subject, result.cmd_id)
    }

    /// Agent side: report a step result.
    pub async fn report(&self, result: &StepResult) -> Result<()> {
        let payload = result.to_bytes()?;
        let timeout = self.connection.config().request_timeout();
        self.publish_to(&self.result_subject(result), payload, timeout)
            .await
    }

    /// Agent side: consume the commands sent to `queue`.
    pub async fn commands(&self, queue: &str, consumer: &str) -> Result<CommandStream> {
        let stream_name = self.connection.config().command_stream(queue);
        let consumer = self
            .connection
            .jetstream()
            .create_consumer_on_stream(
                ConsumerConfig {
                    durable_name: Some(consumer.to_string()),
                    ..Default::default()
                },
                &stream_name,
            )
            .await
            .map_err(|e| Error::QueueUnavailable(format!("{}: {}", queue, e)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| Error::QueueUnavailable(format!("{}: {}", queue, e)))?;

        let stream = messages.then(|message| async move {
            let message =
                message.map_err(|e| Error::QueueUnavailable(format!("Message error: {}", e)))?;
            if let Err(e) = message.ack().await {
                debug!("Failed to ack command: {}", e);
            }
            Command::from_bytes(&message.payload)
        });
        Ok(Box::pin(stream))
    }

    async fn publish_to(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<()> {
        if self.connection.is_shutdown() {
            return Err(Error::QueueUnavailable(
                "Cannot publish: shutdown in progress".to_string(),
            ));
        }

        let metrics = self.connection.metrics();
        let payload_len = payload.len() as u64;
        let jetstream = self.connection.jetstream();

        let published = tokio::time::timeout(timeout, async {
            jetstream
                .publish(subject.to_string(), payload.into())
                .await
                .map_err(|e| e.to_string())?
                .await
                .map_err(|e| e.to_string())
        })
        .await;

        match published {
            Ok(Ok(_)) => {
                metrics.record_publish(payload_len);
                Ok(())
            }
            Ok(Err(e)) => {
                metrics.record_publish_failure();
                Err(Error::QueueUnavailable(format!(
                    "Failed to publish to {}: {}",
                    subject, e
                )))
            }
            Err(_) => {
                metrics.record_publish_failure();
                Err(Error::QueueUnavailable(format!(
                    "Publish to {} not confirmed within {:?}",
                    subject, timeout
                )))
            }
        }
    }
}

#[async_trait]
impl QueueService for NatsQueueService {
    async fn declare(&self, queue: &str) -> Result<()> {
        let config = self.connection.config();
        self.connection
            .ensure_stream(StreamConfig {
                name: config.command_stream(queue),
                subjects: vec![queue.to_string()],
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                max_age: config.max_age(),
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::QueueUnavailable(e.to_string()))?;

        debug!(queue, "Queue declared");
        Ok(())
    }

    async fn delete(&self, queue: &str) -> Result<()> {
        let name = self.connection.config().command_stream(queue);
        let jetstream = self.connection.jetstream();
        if jetstream.get_stream(&name).await.is_err() {
            debug!(queue, "Queue already gone");
            return Ok(());
        }

        jetstream
            .delete_stream(&name)
            .await
            .map_err(|e| Error::QueueUnavailable(format!("Failed to delete {}: {}", queue, e)))?;
        info!(queue, "Queue deleted");
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>, timeout: Duration) -> Result<()> {
        self.publish_to(queue, payload, timeout).await
    }

    async fn subscribe_results(&self) -> Result<ResultStream> {
        let config = self.connection.config();
        let consumer = self
            .connection
            .jetstream()
            .create_consumer_on_stream(
                ConsumerConfig {
                    durable_name: Some(config.consumer_name.clone()),
                    max_deliver: config.max_deliver,
                    ack_wait: Duration::from_secs(30),
                    ..Default::default()
                },
                &config.result_stream,
            )
            .await
            .map_err(|e| Error::QueueUnavailable(format!("Failed to create consumer: {}", e)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| Error::QueueUnavailable(format!("Failed to get messages: {}", e)))?;

        let connection = self.connection.clone();
        let stream = messages.then(move |message| {
            let connection = connection.clone();
            async move {
                let message = message
                    .map_err(|e| Error::QueueUnavailable(format!("Message error: {}", e)))?;
                connection.metrics().record_receive(message.payload.len() as u64);

                let result = StepResult::from_bytes(&message.payload);
                if let Err(e) = &result {
                    let subject = message.subject.to_string();
                    if let Err(dlq) = connection
                        .send_to_dlq(&subject, &message.payload, &e.to_string())
                        .await
                    {
                        warn!(subject, error = %dlq, "Undecodable result could not be parked");
                    }
                }
                if let Err(e) = message.ack().await {
                    warn!("Failed to ack result: {}", e);
                }
                result
            }
        });

        Ok(Box::pin(stream))
    }
}

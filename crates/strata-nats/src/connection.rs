//! Shared NATS connection.

use async_nats::jetstream::{self, stream::Config as StreamConfig};
use base64::{Engine, engine::general_purpose::STANDARD};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use strata_core::{Error, Result};
use tracing::{error, info, warn};

use crate::config::NatsConfig;
use crate::metrics::NatsMetrics;

const DLQ_MAX_AGE: Duration = Duration::from_secs(86400 * 30);

/// A client connection plus the JetStream context and counters every
/// adapter shares.
#[derive(Clone)]
pub struct NatsConnection {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: NatsConfig,
    metrics: Arc<NatsMetrics>,
    shutdown: Arc<AtomicBool>,
}

impl NatsConnection {
    /// Connect with default settings.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(NatsConfig::new(url)).await
    }

    pub async fn connect_with_config(config: NatsConfig) -> Result<Self> {
        let urls = config.urls.join(",");
        info!("Connecting to NATS at {}", urls);

        let metrics = NatsMetrics::new();
        let callback_metrics = metrics.clone();

        let mut options = async_nats::ConnectOptions::new()
            .connection_timeout(config.connection_timeout())
            .request_timeout(Some(config.request_timeout()))
            .retry_on_initial_connect()
            .event_callback(move |event| {
                let metrics = callback_metrics.clone();
                async move {
                    match event {
                        async_nats::Event::Connected => {
                            metrics.set_connected(true);
                            info!("NATS connected");
                        }
                        async_nats::Event::Disconnected => {
                            metrics.set_connected(false);
                            metrics.record_reconnect();
                            warn!("NATS disconnected");
                        }
                        other => warn!("NATS event: {}", other),
                    }
                }
            });
        if let Some(max) = config.max_reconnect_attempts {
            options = options.max_reconnects(max);
        }

        let client = options
            .connect(&urls)
            .await
            .map_err(|e| Error::EventBus(format!("Failed to connect to NATS: {}", e)))?;
        metrics.set_connected(true);

        let jetstream = jetstream::new(client.clone());
        let connection = Self {
            client,
            jetstream,
            config,
            metrics,
            shutdown: Arc::new(AtomicBool::new(false)),
        };

        if connection.config.enable_dlq {
            connection
                .ensure_stream(StreamConfig {
                    name: connection.config.dlq_stream.clone(),
                    subjects: vec!["dlq.>".to_string()],
                    max_age: DLQ_MAX_AGE,
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                })
                .await?;
            info!("Dead letter queue stream initialized");
        }

        Ok(connection)
    }

    /// Create `config`'s stream unless it already exists.
    pub(crate) async fn ensure_stream(&self, config: StreamConfig) -> Result<jetstream::stream::Stream> {
        let name = config.name.clone();
        self.jetstream
            .get_or_create_stream(config)
            .await
            .map_err(|e| Error::EventBus(format!("Failed to create stream {}: {}", name, e)))
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<NatsMetrics> {
        &self.metrics
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Park a message that could not be processed.
    pub async fn send_to_dlq(&self, subject: &str, payload: &[u8], reason: &str) -> Result<()> {
        if !self.config.enable_dlq {
            return Ok(());
        }

        let dlq_payload = serde_json::json!({
            "original_subject": subject,
            "payload": STANDARD.encode(payload),
            "reason": reason,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let bytes =
            serde_json::to_vec(&dlq_payload).map_err(|e| Error::Serialization(e.to_string()))?;

        self.jetstream
            .publish(format!("dlq.{}", subject), bytes.into())
            .await
            .map_err(|e| Error::EventBus(format!("Failed to publish to DLQ: {}", e)))?
            .await
            .map_err(|e| Error::EventBus(format!("Failed to confirm DLQ publish: {}", e)))?;

        self.metrics.record_dlq();
        warn!(subject, "Message sent to DLQ: {}", reason);
        Ok(())
    }

    /// Stop publishing and drain the connection.
    pub async fn shutdown(&self) {
        info!("Draining NATS connection");
        self.shutdown.store(true, Ordering::SeqCst);

        if let Err(e) = self.client.drain().await {
            error!("Error draining NATS connection: {}", e);
        }
        self.metrics.set_connected(false);
    }
}

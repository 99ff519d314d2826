//! Configuration for the NATS adapters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the NATS connection and the JetStream resources the
/// scheduler uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server URLs (several for a cluster).
    pub urls: Vec<String>,
    /// Stream holding status-change events.
    pub event_stream: String,
    /// Stream holding results reported by agents.
    pub result_stream: String,
    /// Subject prefix agents report results under.
    pub result_subject: String,
    /// Durable consumer name shared by scheduler instances.
    pub consumer_name: String,
    /// Prefix of the per-agent command streams.
    pub command_stream_prefix: String,
    /// Key-value bucket holding locks.
    pub lock_bucket: String,
    /// Age after which an unreleased lock expires.
    pub lock_ttl_secs: u64,
    /// Delay between attempts on a held lock.
    pub lock_poll_ms: u64,
    /// Maximum reconnection attempts; unlimited when unset.
    pub max_reconnect_attempts: Option<usize>,
    pub connection_timeout_secs: u64,
    /// Request timeout for JetStream operations.
    pub request_timeout_secs: u64,
    /// Route undecodable results to a dead letter stream.
    pub enable_dlq: bool,
    pub dlq_stream: String,
    /// Maximum delivery attempts for a result.
    pub max_deliver: i64,
    /// Retention of events, results and undelivered commands.
    pub max_age_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: vec!["nats://localhost:4222".to_string()],
            event_stream: "STRATA_EVENTS".to_string(),
            result_stream: "STRATA_RESULTS".to_string(),
            result_subject: "result".to_string(),
            consumer_name: "strata-scheduler".to_string(),
            command_stream_prefix: "STRATA_CMD".to_string(),
            lock_bucket: "strata_locks".to_string(),
            lock_ttl_secs: 30,
            lock_poll_ms: 50,
            max_reconnect_attempts: None,
            connection_timeout_secs: 10,
            request_timeout_secs: 5,
            enable_dlq: true,
            dlq_stream: "STRATA_DLQ".to_string(),
            max_deliver: 5,
            max_age_secs: 86400 * 7,
        }
    }
}

impl NatsConfig {
    /// Create a new config with a single URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    /// Set multiple server URLs for cluster support.
    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }

    /// Prefix every stream, bucket and consumer name, so several
    /// deployments can share one server.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        let upper = namespace.to_ascii_uppercase();
        self.event_stream = format!("{}_EVENTS", upper);
        self.result_stream = format!("{}_RESULTS", upper);
        self.command_stream_prefix = format!("{}_CMD", upper);
        self.dlq_stream = format!("{}_DLQ", upper);
        self.lock_bucket = format!("{}_locks", namespace);
        self.consumer_name = format!("{}-scheduler", namespace);
        self
    }

    /// Set max reconnection attempts.
    pub fn with_max_reconnects(mut self, max: usize) -> Self {
        self.max_reconnect_attempts = Some(max);
        self
    }

    /// Enable or disable the dead letter stream.
    pub fn with_dlq(mut self, enable: bool) -> Self {
        self.enable_dlq = enable;
        self
    }

    /// Set the lock expiry.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl_secs = ttl.as_secs().max(1);
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// Stream backing the command queue `queue`.
    pub fn command_stream(&self, queue: &str) -> String {
        let suffix: String = queue
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}", self.command_stream_prefix, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = NatsConfig::new("nats://nats:4222")
            .with_namespace("ci")
            .with_max_reconnects(5)
            .with_dlq(false)
            .with_lock_ttl(Duration::from_millis(10));

        assert_eq!(config.urls, vec!["nats://nats:4222"]);
        assert_eq!(config.event_stream, "CI_EVENTS");
        assert_eq!(config.lock_bucket, "ci_locks");
        assert_eq!(config.max_reconnect_attempts, Some(5));
        assert!(!config.enable_dlq);
        assert_eq!(config.lock_ttl(), Duration::from_secs(1));
    }

    #[test]
    fn test_command_stream_names() {
        let config = NatsConfig::default();
        assert_eq!(config.command_stream("cmd.abc-123"), "STRATA_CMD_cmd_abc-123");
        assert_eq!(config.command_stream("cmd.a b*>"), "STRATA_CMD_cmd_a_b__");
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config: NatsConfig =
            serde_json::from_str(r#"{"urls": ["nats://a:4222", "nats://b:4222"]}"#).unwrap();
        assert_eq!(config.urls.len(), 2);
        assert_eq!(config.result_subject, "result");
        assert_eq!(config.lock_ttl(), Duration::from_secs(30));
    }
}

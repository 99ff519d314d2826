//! NATS JetStream adapters for Strata CI.
//!
//! One [`NatsConnection`] backs the three broker-facing ports: status
//! events on a limits stream, per-agent command queues plus the shared
//! result queue on work-queue streams, and locks in a key-value bucket.

mod bus;
pub mod config;
mod connection;
mod lock;
pub mod metrics;
mod queue;

pub use bus::{NatsEventBus, StreamInfo};
pub use config::NatsConfig;
pub use connection::NatsConnection;
pub use lock::NatsLockService;
pub use metrics::{MetricsSnapshot, NatsMetrics};
pub use queue::{CommandStream, NatsQueueService};

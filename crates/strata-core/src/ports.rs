//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduler core and the
//! external collaborators it consumes: a message broker, a coordination
//! service, persistence and the plugin catalogue.

use crate::agent::Agent;
use crate::cmd::StepResult;
use crate::events::Event;
use crate::ids::*;
use crate::job::{Job, JobStatus};
use crate::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Stream of step results reported by agents.
pub type ResultStream = Pin<Box<dyn Stream<Item = Result<StepResult>> + Send>>;

/// Event bus for publishing and subscribing to status-change events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `job.*.status`, `agent.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Broker holding one exclusive command queue per agent plus the shared
/// inbound result queue. Delivery is at-least-once in both directions.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Create a queue. Declaring an existing queue is a no-op.
    async fn declare(&self, queue: &str) -> Result<()>;

    /// Delete a queue and anything still in it.
    async fn delete(&self, queue: &str) -> Result<()>;

    /// Publish a message, waiting at most `timeout` for the broker to
    /// accept it. Fails with `QueueUnavailable`.
    async fn publish(&self, queue: &str, payload: Vec<u8>, timeout: Duration) -> Result<()>;

    /// Subscribe to results reported by agents.
    async fn subscribe_results(&self) -> Result<ResultStream>;
}

/// Cluster-wide mutual exclusion over hierarchical path keys.
///
/// Backends are expected to release a holder's locks when it disconnects,
/// so a crashed scheduler instance cannot block the others.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire `path` for `owner`, waiting at most `timeout`.
    /// Fails with `LockTimeout`.
    async fn acquire(&self, path: &str, owner: &str, timeout: Duration) -> Result<()>;

    /// Release `path` if held by `owner`.
    async fn release(&self, path: &str, owner: &str) -> Result<()>;

    /// Non-blocking check whether `path` is currently held.
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// Repository for jobs and their step records.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert or replace a job by id.
    async fn upsert(&self, job: &Job) -> Result<()>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// List jobs with the given status.
    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// Get the next build number for a flow.
    async fn next_build_number(&self, flow_id: FlowId) -> Result<u64>;
}

/// Repository for agents.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Insert or replace an agent by id.
    async fn upsert(&self, agent: &Agent) -> Result<()>;

    /// Get an agent by ID.
    async fn get(&self, id: AgentId) -> Result<Option<Agent>>;

    /// List all agents.
    async fn list(&self) -> Result<Vec<Agent>>;

    /// List agents carrying every one of `tags`.
    async fn find_by_tags(&self, tags: &[String]) -> Result<Vec<Agent>>;

    /// Remove an agent.
    async fn remove(&self, id: AgentId) -> Result<()>;
}

/// Catalogue of reusable step plugins.
#[async_trait]
pub trait PluginRepository: Send + Sync {
    /// Get a plugin by name, ignoring any `@version` suffix the backend
    /// does not track.
    async fn get(&self, name: &str) -> Result<Option<Plugin>>;
}

/// A reusable script with a declared input schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    pub script: String,
    #[serde(default)]
    pub inputs: Vec<PluginInput>,
}

/// Plugin input parameter definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInput {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
}

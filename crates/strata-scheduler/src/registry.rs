//! Agent registry: registration, tag matching and Idle/Busy bookkeeping.

use crate::lock::DistributedLock;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use strata_core::agent::{Agent, AgentStatus};
use strata_core::events::{AgentStatusChangedPayload, Event};
use strata_core::ports::{AgentRepository, EventBus, QueueService};
use strata_core::{AgentId, Error, JobId, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Registry of execution agents.
///
/// Status transitions are serialized inside one process by an internal
/// mutex; across scheduler instances they must happen under the
/// agent-selection lock (see [`AgentRegistry::acquire`]).
pub struct AgentRegistry {
    repository: Arc<dyn AgentRepository>,
    queues: Arc<dyn QueueService>,
    event_bus: Arc<dyn EventBus>,
    transitions: Mutex<()>,
}

impl AgentRegistry {
    pub fn new(
        repository: Arc<dyn AgentRepository>,
        queues: Arc<dyn QueueService>,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            repository,
            queues,
            event_bus,
            transitions: Mutex::new(()),
        }
    }

    /// Register an agent and declare its command queue.
    pub async fn register(
        &self,
        name: impl Into<String>,
        tags: impl IntoIterator<Item = String>,
        token: impl Into<String>,
    ) -> Result<Agent> {
        let agent = Agent::new(name, tags, token);
        self.queues.declare(&agent.queue_name()).await?;
        self.repository.upsert(&agent).await?;

        info!(agent_id = %agent.id, name = %agent.name, tags = ?agent.tags, "Agent registered");
        Ok(agent)
    }

    /// Remove an agent and its queue.
    pub async fn remove(&self, id: AgentId) -> Result<()> {
        let _guard = self.transitions.lock().await;
        let agent = self.require(id).await?;

        self.repository.remove(id).await?;
        self.queues.delete(&agent.queue_name()).await?;

        info!(agent_id = %id, name = %agent.name, "Agent removed");
        Ok(())
    }

    pub async fn get(&self, id: AgentId) -> Result<Option<Agent>> {
        self.repository.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<Agent>> {
        self.repository.list().await
    }

    /// Find an agent carrying every tag in `required`.
    ///
    /// Idle agents are preferred; among equals the earliest registered wins,
    /// then the lowest name.
    /// With `exclude_busy` only Idle agents are considered. Offline and
    /// timed-out agents are never returned.
    pub async fn find(&self, required: &[String], exclude_busy: bool) -> Result<Option<Agent>> {
        let mut candidates: Vec<Agent> = self
            .repository
            .find_by_tags(required)
            .await?
            .into_iter()
            .filter(|a| match a.status {
                AgentStatus::Idle => true,
                AgentStatus::Busy => !exclude_busy,
                AgentStatus::Offline | AgentStatus::Timeout => false,
            })
            .collect();

        candidates.sort_by(|a, b| {
            (!a.status.is_available(), a.registered_at, &a.name).cmp(&(
                !b.status.is_available(),
                b.registered_at,
                &b.name,
            ))
        });

        Ok(candidates.into_iter().next())
    }

    /// Mark an Idle agent Busy with `job_id`. Returns false if the agent
    /// was not Idle.
    pub async fn occupy(&self, id: AgentId, job_id: JobId) -> Result<bool> {
        Ok(self.try_occupy(id, job_id).await?.is_some())
    }

    /// Return a Busy agent to Idle. Releasing an agent that is not Busy is
    /// a no-op.
    pub async fn release(&self, id: AgentId) -> Result<()> {
        let _guard = self.transitions.lock().await;
        let mut agent = self.require(id).await?;

        if agent.status != AgentStatus::Busy {
            debug!(agent_id = %id, status = ?agent.status, "Release ignored, agent not busy");
            return Ok(());
        }

        let job_id = agent.job_id.take();
        self.set_status(&mut agent, AgentStatus::Idle, job_id).await
    }

    /// Mark an agent Offline or Timeout, e.g. when it stops reporting.
    /// Any job it was running loses the agent on its next check.
    pub async fn mark_offline(&self, id: AgentId, status: AgentStatus) -> Result<()> {
        if status.is_available() || status == AgentStatus::Busy {
            return Err(Error::Internal(format!(
                "{:?} is not an unavailable status",
                status
            )));
        }

        let _guard = self.transitions.lock().await;
        let mut agent = self.require(id).await?;
        let job_id = agent.job_id.take();

        warn!(agent_id = %id, name = %agent.name, ?status, job_id = ?job_id, "Agent unavailable");
        self.set_status(&mut agent, status, job_id).await
    }

    /// Select and occupy an agent for `job_id` under the cluster-wide lock
    /// `key`.
    ///
    /// Fails with `NoAgentAvailable` when no Idle agent matches or the lock
    /// could not be taken in time; both are worth retrying later.
    pub async fn acquire(
        &self,
        lock: &DistributedLock,
        key: &str,
        timeout: Duration,
        required: &[String],
        job_id: JobId,
    ) -> Result<Agent> {
        let outcome = lock
            .with_lock(key, timeout, move || async move {
                match self.find(required, true).await? {
                    Some(agent) => self.try_occupy(agent.id, job_id).await,
                    None => Ok(None),
                }
            })
            .await;

        match outcome {
            Ok(Ok(Some(agent))) => Ok(agent),
            Ok(Ok(None)) | Err(Error::LockTimeout(_)) => {
                Err(Error::NoAgentAvailable(required.to_vec()))
            }
            Ok(Err(e)) | Err(e) => Err(e),
        }
    }

    async fn try_occupy(&self, id: AgentId, job_id: JobId) -> Result<Option<Agent>> {
        let _guard = self.transitions.lock().await;
        let mut agent = self.require(id).await?;

        if agent.status != AgentStatus::Idle {
            debug!(agent_id = %id, status = ?agent.status, "Occupy refused");
            return Ok(None);
        }

        agent.job_id = Some(job_id);
        self.set_status(&mut agent, AgentStatus::Busy, Some(job_id))
            .await?;
        Ok(Some(agent))
    }

    async fn require(&self, id: AgentId) -> Result<Agent> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))
    }

    async fn set_status(
        &self,
        agent: &mut Agent,
        status: AgentStatus,
        job_id: Option<JobId>,
    ) -> Result<()> {
        let from = agent.status;
        agent.status = status;
        agent.updated_at = Utc::now();
        self.repository.upsert(agent).await?;

        debug!(agent_id = %agent.id, ?from, to = ?status, "Agent status changed");

        let event = Event::AgentStatusChanged(AgentStatusChangedPayload {
            agent_id: agent.id,
            name: agent.name.clone(),
            from,
            to: status,
            job_id,
            timestamp: agent.updated_at,
        });
        if let Err(e) = self.event_bus.publish(event).await {
            warn!(agent_id = %agent.id, error = %e, "Failed to publish agent status event");
        }
        Ok(())
    }
}

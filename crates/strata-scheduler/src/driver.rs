//! Per-job execution task.
//!
//! A [`JobDriver`] owns one job from Created to a terminal status: it
//! acquires an agent, walks the tree one step at a time and releases the
//! agent. Results and cancel requests reach it through its inbox; it is the
//! only writer of its job record.

use crate::config::SchedulerConfig;
use crate::dispatcher::CmdDispatcher;
use crate::lock::{DistributedLock, lock_key};
use crate::registry::AgentRegistry;
use crate::retry::Backoff;
use crate::state_machine::{Outcome, StepStateMachine, Transition};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use strata_core::agent::{Agent, AgentStatus};
use strata_core::cmd::{Command, StepResult};
use strata_core::events::{Event, JobStatusChangedPayload, StepStatusChangedPayload};
use strata_core::job::{Job, JobStatus, StepStatus};
use strata_core::node::{NodePath, NodeTree};
use strata_core::ports::{EventBus, JobRepository};
use strata_core::{CmdId, Error, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Longest wait the driver schedules; step timeouts beyond it are clamped
/// so the deadline stays representable.
const MAX_WAIT: Duration = Duration::from_secs(86_400 * 365 * 30);

pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout.min(MAX_WAIT)
}

#[derive(Debug)]
pub(crate) enum DriverMessage {
    Result(StepResult),
    Cancel,
}

/// Collaborators shared by every driver of a scheduler.
pub(crate) struct DriverContext {
    pub config: SchedulerConfig,
    pub registry: Arc<AgentRegistry>,
    pub lock: Arc<DistributedLock>,
    pub dispatcher: Arc<CmdDispatcher>,
    pub jobs: Arc<dyn JobRepository>,
    pub event_bus: Arc<dyn EventBus>,
    pub state_machine: StepStateMachine,
}

enum Wake {
    Message(Option<DriverMessage>),
    Deadline,
}

pub(crate) struct JobDriver {
    job: Job,
    tree: Arc<NodeTree>,
    ctx: Arc<DriverContext>,
    inbox: mpsc::UnboundedReceiver<DriverMessage>,
    agent: Option<Agent>,
    cancel_requested: bool,
}

impl JobDriver {
    pub fn new(
        job: Job,
        tree: Arc<NodeTree>,
        ctx: Arc<DriverContext>,
        inbox: mpsc::UnboundedReceiver<DriverMessage>,
    ) -> Self {
        Self {
            job,
            tree,
            ctx,
            inbox,
            agent: None,
            cancel_requested: false,
        }
    }

    /// Drive the job to a terminal status and return its final record.
    pub async fn run(mut self) -> Job {
        let t = self.ctx.state_machine.enqueue(&mut self.job);
        self.commit(t).await;

        let mut outcome = match self.acquire_agent().await {
            Some(agent) => {
                self.agent = Some(agent);
                let t = self.ctx.state_machine.start(&mut self.job);
                self.commit(t).await
            }
            None => Outcome::Finished(self.job.status),
        };

        while let Outcome::Next(path) = outcome {
            if self.cancel_requested || self.poll_cancel() {
                outcome = self.cancel().await;
                break;
            }
            outcome = self.execute(&path).await;
        }

        self.finish().await;
        self.job
    }

    async fn acquire_agent(&mut self) -> Option<Agent> {
        let config = &self.ctx.config;
        let key = lock_key(config.lock_scope, &self.job.tags);
        let mut backoff = Backoff::new(config.backoff_base(), config.backoff_max());

        loop {
            let attempt = backoff.attempts() + 1;
            let acquired = self
                .ctx
                .registry
                .acquire(
                    &self.ctx.lock,
                    &key,
                    self.ctx.config.lock_timeout(),
                    &self.job.tags,
                    self.job.id,
                )
                .await;

            match acquired {
                Ok(agent) => {
                    info!(job_id = %self.job.id, agent_id = %agent.id, agent = %agent.name, "Agent acquired");
                    self.job.agent_id = Some(agent.id);
                    return Some(agent);
                }
                Err(e) if e.is_transient() => {
                    let limit = self.ctx.config.acquire_attempts;
                    if limit > 0 && attempt >= limit {
                        warn!(job_id = %self.job.id, attempts = attempt, error = %e, "Giving up on agent acquisition");
                        let t = self.ctx.state_machine.abort(
                            &mut self.job,
                            JobStatus::Failed,
                            e.to_string(),
                        );
                        self.commit(t).await;
                        return None;
                    }
                    debug!(job_id = %self.job.id, attempt, error = %e, "No agent yet");
                }
                Err(e) => {
                    error!(job_id = %self.job.id, error = %e, "Agent acquisition failed");
                    let t = self
                        .ctx
                        .state_machine
                        .abort(&mut self.job, JobStatus::Failed, e.to_string());
                    self.commit(t).await;
                    return None;
                }
            }

            let delay = backoff.next_delay();
            let wake = tokio::select! {
                message = self.inbox.recv() => Wake::Message(message),
                _ = tokio::time::sleep(delay) => Wake::Deadline,
            };

            match wake {
                Wake::Message(Some(DriverMessage::Cancel)) | Wake::Message(None) => {
                    info!(job_id = %self.job.id, "Job cancelled while queued");
                    let t = self.ctx.state_machine.cancel(&mut self.job);
                    self.commit(t).await;
                    return None;
                }
                Wake::Message(Some(DriverMessage::Result(result))) => {
                    debug!(job_id = %self.job.id, cmd_id = %result.cmd_id, "Dropping result for queued job");
                }
                Wake::Deadline => {}
            }
        }
    }

    async fn execute(&mut self, path: &NodePath) -> Outcome {
        let tree = self.tree.clone();
        let Some(node) = tree.get(path) else {
            let t = self.ctx.state_machine.fail_step(
                &mut self.job,
                &tree,
                path,
                format!("node {} is not part of the pipeline", path),
            );
            return self.commit(t).await;
        };

        if !node.is_executable() {
            let t = self
                .ctx
                .state_machine
                .mark_passthrough(&mut self.job, &tree, path);
            return self.commit(t).await;
        }

        let agent = match self.ensure_agent().await {
            Ok(agent) => agent,
            Err(e) => {
                warn!(job_id = %self.job.id, path = %path, error = %e, "Agent lost");
                let t = self
                    .ctx
                    .state_machine
                    .fail_step(&mut self.job, &tree, path, e.to_string());
                return self.commit(t).await;
            }
        };

        let command = match self
            .ctx
            .dispatcher
            .build_command(&self.job, &tree, node)
            .await
        {
            Ok(command) => command,
            Err(e) => {
                warn!(job_id = %self.job.id, path = %path, error = %e, "Cannot build command");
                let t = self
                    .ctx
                    .state_machine
                    .fail_step(&mut self.job, &tree, path, e.to_string());
                return self.commit(t).await;
            }
        };

        let attempts = match self.publish(&command, &agent).await {
            Ok(attempts) => attempts,
            Err(e) => {
                let t = self
                    .ctx
                    .state_machine
                    .fail_step(&mut self.job, &tree, path, e.to_string());
                return self.commit(t).await;
            }
        };

        let t = self.ctx.state_machine.mark_sent(&mut self.job, path, attempts);
        self.commit(t).await;

        let timeout_secs = match &command {
            Command::Shell(shell) => shell.timeout_secs,
            Command::Kill(_) => self.ctx.config.default_step_timeout_secs,
        };
        let cmd_id = CmdId::of(self.job.id, path);
        self.await_result(path, &cmd_id, timeout_secs).await
    }

    /// Publish with retries on transient broker failures. Returns the
    /// number of attempts made.
    async fn publish(&self, command: &Command, agent: &Agent) -> Result<u32> {
        let config = &self.ctx.config;
        let mut backoff = Backoff::new(config.backoff_base(), config.backoff_max());

        loop {
            let attempt = backoff.attempts() + 1;
            match self.ctx.dispatcher.dispatch(command, agent).await {
                Ok(()) => return Ok(attempt),
                Err(e) if e.is_transient() && attempt <= config.dispatch_retries => {
                    warn!(job_id = %self.job.id, attempt, error = %e, "Dispatch failed, retrying");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Err(e) => {
                    error!(job_id = %self.job.id, attempts = attempt, error = %e, "Dispatch failed");
                    return Err(e);
                }
            }
        }
    }

    async fn await_result(&mut self, path: &NodePath, cmd_id: &CmdId, timeout_secs: u64) -> Outcome {
        let timeout = Duration::from_secs(timeout_secs);
        let mut deadline = deadline_after(timeout);

        loop {
            let wake = tokio::select! {
                message = self.inbox.recv() => Wake::Message(message),
                _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
            };

            match wake {
                Wake::Message(Some(DriverMessage::Result(result))) => {
                    if &result.cmd_id != cmd_id {
                        debug!(job_id = %self.job.id, cmd_id = %result.cmd_id, "Dropping result for step not in flight");
                        continue;
                    }
                    let t = self
                        .ctx
                        .state_machine
                        .apply_result(&mut self.job, &self.tree, &result);
                    match self.commit(t).await {
                        Outcome::Started => deadline = deadline_after(timeout),
                        Outcome::Ignored => {}
                        outcome => return outcome,
                    }
                }
                Wake::Message(Some(DriverMessage::Cancel)) | Wake::Message(None) => {
                    return self.cancel().await;
                }
                Wake::Deadline => return self.time_out(path, cmd_id, timeout_secs).await,
            }
        }
    }

    async fn time_out(&mut self, path: &NodePath, cmd_id: &CmdId, timeout_secs: u64) -> Outcome {
        warn!(job_id = %self.job.id, path = %path, timeout_secs, "Step timed out, killing");
        self.send_kill(cmd_id).await;

        let t = match self.wait_for_result(cmd_id).await {
            Some(mut result) => {
                result.status = StepStatus::Timeout;
                if result.error.is_none() {
                    result.error = Some(Error::StepTimeout { seconds: timeout_secs }.to_string());
                }
                self.ctx
                    .state_machine
                    .apply_result(&mut self.job, &self.tree, &result)
            }
            None => self
                .ctx
                .state_machine
                .mark_timeout(&mut self.job, &self.tree, path, timeout_secs),
        };
        self.commit(t).await
    }

    async fn cancel(&mut self) -> Outcome {
        info!(job_id = %self.job.id, "Cancelling job");
        let t = self.ctx.state_machine.cancel(&mut self.job);
        self.commit(t).await;

        let in_flight = self
            .job
            .in_flight()
            .map(|step| (step.path.clone(), step.id.clone()));

        if let Some((path, cmd_id)) = in_flight {
            self.send_kill(&cmd_id).await;
            let t = match self.wait_for_result(&cmd_id).await {
                Some(result) => self
                    .ctx
                    .state_machine
                    .apply_result(&mut self.job, &self.tree, &result),
                None => {
                    warn!(job_id = %self.job.id, path = %path, "Kill not acknowledged within grace period");
                    self.ctx
                        .state_machine
                        .force_kill(&mut self.job, &self.tree, &path)
                }
            };
            self.commit(t).await;
        }

        Outcome::Finished(self.job.status)
    }

    /// Wait up to the kill grace period for a final result of `cmd_id`.
    /// Running acknowledgments seen meanwhile are recorded.
    async fn wait_for_result(&mut self, cmd_id: &CmdId) -> Option<StepResult> {
        let deadline = deadline_after(self.ctx.config.kill_grace());

        loop {
            let wake = tokio::select! {
                message = self.inbox.recv() => Wake::Message(message),
                _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
            };

            match wake {
                Wake::Message(Some(DriverMessage::Result(result))) if &result.cmd_id == cmd_id => {
                    if result.status == StepStatus::Running {
                        let t = self.ctx.state_machine.mark_running(&mut self.job, &result);
                        self.commit(t).await;
                        continue;
                    }
                    return Some(result);
                }
                Wake::Message(Some(DriverMessage::Result(_))) => {}
                Wake::Message(Some(DriverMessage::Cancel)) => self.cancel_requested = true,
                Wake::Message(None) | Wake::Deadline => return None,
            }
        }
    }

    /// Drain the inbox without waiting; true when cancellation was asked.
    fn poll_cancel(&mut self) -> bool {
        loop {
            match self.inbox.try_recv() {
                Ok(DriverMessage::Cancel) => return true,
                Ok(DriverMessage::Result(result)) => {
                    debug!(job_id = %self.job.id, cmd_id = %result.cmd_id, "Dropping result with no step in flight");
                }
                Err(mpsc::error::TryRecvError::Empty) => return false,
                Err(mpsc::error::TryRecvError::Disconnected) => return true,
            }
        }
    }

    async fn send_kill(&self, cmd_id: &CmdId) {
        let Some(agent) = &self.agent else {
            return;
        };
        let kill = self
            .ctx
            .dispatcher
            .build_kill_command(self.job.id, Some(cmd_id.clone()));
        if let Err(e) = self.ctx.dispatcher.dispatch(&kill, agent).await {
            warn!(job_id = %self.job.id, cmd_id = %cmd_id, error = %e, "Failed to send kill");
        }
    }

    /// The job's agent, re-read from the registry. Fails when the agent
    /// went away or no longer belongs to this job.
    async fn ensure_agent(&mut self) -> Result<Agent> {
        let id = self
            .agent
            .as_ref()
            .map(|a| a.id)
            .ok_or_else(|| Error::Internal("job has no agent".to_string()))?;

        match self.ctx.registry.get(id).await? {
            Some(agent) if agent.status == AgentStatus::Busy && agent.job_id == Some(self.job.id) => {
                self.agent = Some(agent.clone());
                Ok(agent)
            }
            Some(agent) => Err(Error::AgentNotFound(format!(
                "{} ({:?}) is no longer assigned to job {}",
                agent.name, agent.status, self.job.id
            ))),
            None => Err(Error::AgentNotFound(id.to_string())),
        }
    }

    async fn finish(&mut self) {
        if let Some(agent) = self.agent.take() {
            match self.ctx.registry.get(agent.id).await {
                Ok(Some(current)) if current.job_id == Some(self.job.id) => {
                    if let Err(e) = self.ctx.registry.release(agent.id).await {
                        error!(job_id = %self.job.id, agent_id = %agent.id, error = %e, "Failed to release agent");
                    }
                }
                Ok(_) => {
                    debug!(job_id = %self.job.id, agent_id = %agent.id, "Agent no longer held by job");
                }
                Err(e) => {
                    error!(job_id = %self.job.id, agent_id = %agent.id, error = %e, "Failed to look up agent");
                }
            }
        }

        self.persist().await;
        info!(
            job_id = %self.job.id,
            build_number = self.job.build_number,
            status = ?self.job.status,
            "Job finished"
        );
    }

    /// Persist the job and emit events for a transition. Returns its outcome.
    async fn commit(&mut self, t: Transition) -> Outcome {
        if t.is_ignored() {
            return t.outcome;
        }
        self.persist().await;

        for change in &t.steps {
            debug!(
                job_id = %self.job.id,
                path = %change.path,
                from = ?change.from,
                to = ?change.to,
                "Step status changed"
            );
            self.emit(Event::StepStatusChanged(StepStatusChangedPayload {
                job_id: self.job.id,
                cmd_id: change.cmd_id.clone(),
                path: change.path.clone(),
                from: change.from,
                to: change.to,
                error: change.error.clone(),
                timestamp: Utc::now(),
            }))
            .await;
        }

        if let Some(change) = t.job {
            info!(job_id = %self.job.id, from = ?change.from, to = ?change.to, "Job status changed");
            self.emit(Event::JobStatusChanged(JobStatusChangedPayload {
                job_id: self.job.id,
                flow_id: self.job.flow_id,
                from: change.from,
                to: change.to,
                timestamp: Utc::now(),
            }))
            .await;
        }

        t.outcome
    }

    async fn persist(&self) {
        if let Err(e) = self.ctx.jobs.upsert(&self.job).await {
            error!(job_id = %self.job.id, error = %e, "Failed to persist job");
        }
    }

    async fn emit(&self, event: Event) {
        if let Err(e) = self.ctx.event_bus.publish(event).await {
            warn!(job_id = %self.job.id, error = %e, "Failed to publish event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_after_clamps_huge_timeouts() {
        let now = Instant::now();
        let deadline = deadline_after(Duration::from_secs(u64::MAX));
        assert!(deadline > now + Duration::from_secs(86_400 * 365));
        assert!(deadline <= Instant::now() + MAX_WAIT);

        let soon = deadline_after(Duration::ZERO);
        assert!(soon <= Instant::now());
    }
}

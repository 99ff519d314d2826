//! Main scheduler orchestration.

use crate::config::SchedulerConfig;
use crate::dispatcher::{CmdDispatcher, ENV_BUILD_NUMBER, ENV_FLOW_ID, ENV_JOB_ID};
use crate::driver::{DriverContext, DriverMessage, JobDriver};
use crate::lock::DistributedLock;
use crate::registry::AgentRegistry;
use crate::state_machine::StepStateMachine;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use strata_core::events::{Event, JobCreatedPayload};
use strata_core::job::{Job, JobStatus};
use strata_core::node::{NodeTree, content_hash};
use strata_core::ports::{EventBus, JobRepository, ResultStream};
use strata_core::cmd::StepResult;
use strata_core::variables::VariableMap;
use strata_core::{Error, FlowId, JobId, Result};
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, error, info, warn};

/// The main scheduler service.
pub struct Scheduler {
    ctx: Arc<DriverContext>,
    trees: RwLock<HashMap<String, Arc<NodeTree>>>,
    active_jobs: Arc<RwLock<HashMap<JobId, DriverHandle>>>,
}

/// Channel into a running driver plus a watch on its final record.
/// Unbounded, so the shared result loop never blocks on one driver.
struct DriverHandle {
    inbox: mpsc::UnboundedSender<DriverMessage>,
    done: watch::Receiver<Option<Job>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<AgentRegistry>,
        lock: Arc<DistributedLock>,
        dispatcher: Arc<CmdDispatcher>,
        jobs: Arc<dyn JobRepository>,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            ctx: Arc::new(DriverContext {
                config,
                registry,
                lock,
                dispatcher,
                jobs,
                event_bus,
                state_machine: StepStateMachine::new(),
            }),
            trees: RwLock::new(HashMap::new()),
            active_jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.ctx.registry
    }

    /// Parsed tree for `yaml`, shared between jobs running the same
    /// document.
    pub async fn tree(&self, yaml: &str) -> Result<Arc<NodeTree>> {
        let hash = content_hash(yaml);
        if let Some(tree) = self.trees.read().await.get(&hash) {
            return Ok(tree.clone());
        }

        let tree = Arc::new(NodeTree::parse(yaml)?);
        let mut trees = self.trees.write().await;
        Ok(trees.entry(hash).or_insert(tree).clone())
    }

    /// Create a job for `yaml` and start driving it.
    ///
    /// Parse errors are returned here; everything after creation is
    /// reported through the job's status.
    pub async fn create_job(
        &self,
        flow_id: FlowId,
        yaml: &str,
        variables: VariableMap,
    ) -> Result<Job> {
        let tree = self.tree(yaml).await?;
        let build_number = self.ctx.jobs.next_build_number(flow_id).await?;

        let mut job = Job::new(flow_id, build_number, &tree, content_hash(yaml), variables);
        job.context.insert(ENV_JOB_ID, job.id.to_string());
        job.context.insert(ENV_FLOW_ID, flow_id.to_string());
        job.context.insert(ENV_BUILD_NUMBER, build_number.to_string());

        self.ctx.jobs.upsert(&job).await?;

        let event = Event::JobCreated(JobCreatedPayload {
            job_id: job.id,
            flow_id,
            build_number,
            step_count: job.steps.len(),
            created_at: job.created_at,
        });
        if let Err(e) = self.ctx.event_bus.publish(event).await {
            warn!(job_id = %job.id, error = %e, "Failed to publish job created event");
        }

        info!(
            job_id = %job.id,
            flow_id = %flow_id,
            build_number,
            steps = job.steps.len(),
            tags = ?job.tags,
            "Job created"
        );

        self.spawn(job.clone(), tree).await;
        Ok(job)
    }

    async fn spawn(&self, job: Job, tree: Arc<NodeTree>) {
        let job_id = job.id;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(None);

        self.active_jobs.write().await.insert(
            job_id,
            DriverHandle {
                inbox: inbox_tx,
                done: done_rx,
            },
        );

        let driver = JobDriver::new(job, tree, self.ctx.clone(), inbox_rx);
        let ctx = self.ctx.clone();
        let active_jobs = self.active_jobs.clone();

        tokio::spawn(async move {
            let finished = match tokio::spawn(driver.run()).await {
                Ok(job) => Some(job),
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Job driver crashed");
                    recover_crashed(&ctx, job_id, e.to_string()).await
                }
            };
            let _ = done_tx.send(finished);
            active_jobs.write().await.remove(&job_id);
        });
    }

    /// Route an agent's result to the driver owning the step.
    pub async fn handle_result(&self, result: StepResult) -> Result<()> {
        let job_id = result.job_id()?;

        let inbox = self
            .active_jobs
            .read()
            .await
            .get(&job_id)
            .map(|h| h.inbox.clone());

        match inbox {
            Some(inbox) => {
                if inbox.send(DriverMessage::Result(result)).is_err() {
                    debug!(job_id = %job_id, "Driver finished before result arrived");
                }
            }
            None => {
                debug!(job_id = %job_id, cmd_id = %result.cmd_id, "Result for inactive job dropped");
            }
        }
        Ok(())
    }

    /// Consume agent results until the stream ends.
    pub async fn run_results(&self, mut results: ResultStream) {
        while let Some(item) = results.next().await {
            match item {
                Ok(result) => {
                    if let Err(e) = self.handle_result(result).await {
                        warn!(error = %e, "Rejected step result");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to receive step result"),
            }
        }
        info!("Result stream closed");
    }

    /// Ask a running job to stop.
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        let inbox = self
            .active_jobs
            .read()
            .await
            .get(&job_id)
            .map(|h| h.inbox.clone());

        if let Some(inbox) = inbox
            && inbox.send(DriverMessage::Cancel).is_ok()
        {
            info!(job_id = %job_id, "Cancel requested");
            return Ok(());
        }

        match self.ctx.jobs.get(job_id).await? {
            Some(job) if job.status.is_terminal() => Err(Error::JobFinished(job_id.to_string())),
            Some(_) | None => Err(Error::JobNotFound(job_id.to_string())),
        }
    }

    pub async fn job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.ctx.jobs.get(job_id).await
    }

    /// Wait for a job to reach a terminal status.
    pub async fn wait(&self, job_id: JobId) -> Result<Job> {
        let done = self
            .active_jobs
            .read()
            .await
            .get(&job_id)
            .map(|h| h.done.clone());

        if let Some(mut done) = done
            && let Ok(finished) = done.wait_for(Option::is_some).await
            && let Some(job) = finished.clone()
        {
            return Ok(job);
        }

        match self.ctx.jobs.get(job_id).await? {
            Some(job) if job.status.is_terminal() => Ok(job),
            _ => Err(Error::JobNotFound(job_id.to_string())),
        }
    }

    /// Number of jobs currently being driven.
    pub async fn active_jobs(&self) -> usize {
        self.active_jobs.read().await.len()
    }

    /// Cancel every running job and wait for them to finish.
    pub async fn shutdown(&self) {
        let ids: Vec<JobId> = self.active_jobs.read().await.keys().copied().collect();
        info!(jobs = ids.len(), "Shutting down scheduler");

        for id in &ids {
            if let Err(e) = self.cancel(*id).await {
                debug!(job_id = %id, error = %e, "Job ended before shutdown");
            }
        }
        for id in ids {
            let _ = self.wait(id).await;
        }
    }
}

/// Best effort after a driver panic: fail the job and free its agent.
async fn recover_crashed(ctx: &DriverContext, job_id: JobId, reason: String) -> Option<Job> {
    let mut job = match ctx.jobs.get(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return None,
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Cannot load crashed job");
            return None;
        }
    };

    ctx.state_machine.abort(&mut job, JobStatus::Failed, reason);
    if let Err(e) = ctx.jobs.upsert(&job).await {
        error!(job_id = %job_id, error = %e, "Failed to persist crashed job");
    }

    if let Some(agent_id) = job.agent_id
        && let Ok(Some(agent)) = ctx.registry.get(agent_id).await
        && agent.job_id == Some(job_id)
        && let Err(e) = ctx.registry.release(agent_id).await
    {
        error!(job_id = %job_id, agent_id = %agent_id, error = %e, "Failed to release agent");
    }

    Some(job)
}

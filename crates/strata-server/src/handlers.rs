//! Command handlers.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use strata_core::FlowId;
use strata_core::job::{Job, JobStatus};
use strata_core::node::{NodeTree, content_hash};
use strata_core::ports::{EventBus, LockService, QueueService};
use strata_core::variables::VariableMap;
use strata_nats::{NatsConnection, NatsEventBus, NatsLockService, NatsQueueService};
use strata_scheduler::memory::{
    InMemoryAgentRepository, InMemoryEventBus, InMemoryJobRepository, InMemoryLockService,
    InMemoryPluginRepository, InMemoryQueueService,
};
use strata_scheduler::{AgentRegistry, CmdDispatcher, DistributedLock, Scheduler};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::intake;
use crate::local::LocalAgent;

/// Parse a pipeline and print its tree.
pub fn validate(path: &Path) -> Result<()> {
    let yaml = read_pipeline(path)?;
    let tree = NodeTree::parse(&yaml)?;

    println!("Pipeline \"{}\" is valid", tree.root().name);
    println!("  Hash: {}", content_hash(&yaml));
    if !tree.required_tags().is_empty() {
        println!("  Agent tags: {}", tree.required_tags().join(", "));
    }
    println!("  Nodes:");
    for node in tree.nodes() {
        let mut flags = Vec::new();
        if !node.is_executable() {
            flags.push("group".to_string());
        }
        if let Some(plugin) = &node.plugin {
            flags.push(format!("plugin {}", plugin));
        }
        if node.allow_failure {
            flags.push("allow_failure".to_string());
        }
        if node.is_final {
            flags.push("final".to_string());
        }
        if let Some(timeout) = node.timeout {
            flags.push(format!("timeout {}s", timeout));
        }

        let indent = "  ".repeat(node.path.depth());
        if flags.is_empty() {
            println!("  {}{}", indent, node.name);
        } else {
            println!("  {}{} ({})", indent, node.name, flags.join(", "));
        }
    }
    Ok(())
}

/// Run a pipeline to completion on this machine with in-memory ports and a
/// host-shell agent carrying the pipeline's tags.
pub async fn run(config: ServerConfig, path: &Path, variables: VariableMap) -> Result<Job> {
    let yaml = read_pipeline(path)?;

    let queues = Arc::new(InMemoryQueueService::new());
    let events: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
    let plugins = Arc::new(InMemoryPluginRepository::new());
    for plugin in config.plugins.clone() {
        plugins.insert(plugin).await;
    }

    let scheduler = Arc::new(build_scheduler(
        &config,
        queues.clone(),
        Arc::new(InMemoryLockService::new()),
        events,
        plugins,
    ));

    let tree = scheduler.tree(&yaml).await?;
    let agent = scheduler
        .registry()
        .register("local", tree.required_tags().iter().cloned(), "local")
        .await?;
    let agent_task = LocalAgent::new(queues.clone(), agent.queue_name()).spawn();

    let results = queues.subscribe_results().await?;
    let consumer = scheduler.clone();
    let results_task = tokio::spawn(async move { consumer.run_results(results).await });

    let job = scheduler
        .create_job(FlowId::new(), &yaml, variables)
        .await?;
    info!(job_id = %job.id, "Running {}", path.display());

    let finished = tokio::select! {
        finished = scheduler.wait(job.id) => finished?,
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = %job.id, "Interrupted, cancelling job");
            scheduler.cancel(job.id).await?;
            scheduler.wait(job.id).await?
        }
    };

    agent_task.abort();
    results_task.abort();
    Ok(finished)
}

/// Print the outcome of a job, one line per step.
pub fn print_summary(job: &Job) {
    println!("Job {} #{}: {:?}", job.id, job.build_number, job.status);
    if let Some(error) = &job.error {
        println!("  error: {}", error);
    }
    for step in &job.steps {
        let code = step.code.map(|c| format!(" (exit {})", c)).unwrap_or_default();
        println!("  {:<10} {}{}", format!("{:?}", step.status), step.path, code);
        if let Some(error) = &step.error {
            println!("             {}", error);
        }
    }
}

/// Serve the scheduler against NATS until interrupted.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let connection = NatsConnection::connect_with_config(config.nats.clone()).await?;
    let events: Arc<dyn EventBus> = Arc::new(NatsEventBus::new(connection.clone()).await?);
    let queues = Arc::new(NatsQueueService::new(connection.clone()).await?);
    let locks: Arc<dyn LockService> = Arc::new(NatsLockService::new(connection.clone()).await?);

    let plugins = Arc::new(InMemoryPluginRepository::new());
    for plugin in config.plugins.clone() {
        plugins.insert(plugin).await;
    }

    let scheduler = Arc::new(build_scheduler(&config, queues.clone(), locks, events, plugins));

    for agent in &config.agents {
        scheduler
            .registry()
            .register(&agent.name, agent.tags.iter().cloned(), &agent.token)
            .await
            .with_context(|| format!("Failed to register agent {}", agent.name))?;
    }

    let results = queues.subscribe_results().await?;
    let consumer = scheduler.clone();
    let results_task = tokio::spawn(async move { consumer.run_results(results).await });

    let submit_task = tokio::spawn(intake::serve_submissions(
        connection.client().clone(),
        config.intake.submit_subject.clone(),
        scheduler.clone(),
    ));
    let cancel_task = tokio::spawn(intake::serve_cancellations(
        connection.client().clone(),
        config.intake.cancel_subject.clone(),
        scheduler.clone(),
    ));
    info!(
        submit = %config.intake.submit_subject,
        cancel = %config.intake.cancel_subject,
        "Scheduler ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    submit_task.abort();
    cancel_task.abort();
    scheduler.shutdown().await;
    results_task.abort();
    connection.shutdown().await;

    let metrics = connection.metrics().snapshot();
    match serde_json::to_string(&metrics) {
        Ok(metrics) => info!(metrics = %metrics, "NATS adapter totals"),
        Err(e) => error!(error = %e, "Failed to encode metrics"),
    }
    Ok(())
}

fn build_scheduler(
    config: &ServerConfig,
    queues: Arc<dyn QueueService>,
    locks: Arc<dyn LockService>,
    events: Arc<dyn EventBus>,
    plugins: Arc<InMemoryPluginRepository>,
) -> Scheduler {
    let registry = Arc::new(AgentRegistry::new(
        Arc::new(InMemoryAgentRepository::new()),
        queues.clone(),
        events.clone(),
    ));
    let dispatcher = Arc::new(CmdDispatcher::new(
        plugins,
        queues,
        config.scheduler.clone(),
    ));

    Scheduler::new(
        config.scheduler.clone(),
        registry,
        Arc::new(DistributedLock::new(locks)),
        dispatcher,
        Arc::new(InMemoryJobRepository::new()),
        events,
    )
}

fn read_pipeline(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Exit status for a finished job.
pub fn exit_status(job: &Job) -> Result<()> {
    match job.status {
        JobStatus::Success => Ok(()),
        status => anyhow::bail!("job {} finished {:?}", job.id, status),
    }
}

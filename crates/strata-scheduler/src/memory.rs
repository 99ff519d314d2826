//! In-process implementations of the ports.
//!
//! Used by the single-process `strata run` mode and by tests. Behavior
//! mirrors the broker-backed adapters: per-agent queues must be declared
//! before use, locks are exclusive and non-reentrant, and results arrive
//! on a single shared stream.

use async_trait::async_trait;
use futures::stream;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use strata_core::agent::Agent;
use strata_core::cmd::{Command, StepResult};
use strata_core::events::Event;
use strata_core::job::{Job, JobStatus};
use strata_core::ports::*;
use strata_core::{AgentId, Error, FlowId, JobId, Result};
use tokio::sync::{Mutex, Notify, RwLock, broadcast, mpsc};
use tokio::time::Instant;

/// Whether a NATS-style subject matches a pattern. `*` matches exactly one
/// token, a trailing `>` matches one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    let mut pattern_tokens = pattern.split('.').peekable();

    while let Some(p) = pattern_tokens.next() {
        if p == ">" {
            return pattern_tokens.peek().is_none() && subject_tokens.next().is_some();
        }
        match subject_tokens.next() {
            Some(s) if p == "*" || p == s => {}
            _ => return false,
        }
    }
    subject_tokens.next().is_none()
}

/// Broadcast event bus that also records everything published.
pub struct InMemoryEventBus {
    sender: broadcast::Sender<Event>,
    history: RwLock<Vec<Event>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            sender,
            history: RwLock::new(Vec::new()),
        }
    }

    /// Every event published so far, in order.
    pub async fn published(&self) -> Vec<Event> {
        self.history.read().await.clone()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        self.history.write().await.push(event.clone());
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        let receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let events = stream::unfold(receiver, move |mut receiver| {
            let pattern = pattern.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) if subject_matches(&pattern, &event.subject()) => {
                            return Some((Ok(event), receiver));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            let err = Error::EventBus(format!("subscriber lagged by {} events", n));
                            return Some((Err(err), receiver));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Box::pin(events))
    }
}

/// Per-agent command queues plus a shared result channel.
pub struct InMemoryQueueService {
    queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    results_tx: mpsc::UnboundedSender<StepResult>,
    results_rx: Mutex<Option<mpsc::UnboundedReceiver<StepResult>>>,
    available: AtomicBool,
    failures: AtomicU32,
}

impl InMemoryQueueService {
    pub fn new() -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            queues: Mutex::new(HashMap::new()),
            results_tx,
            results_rx: Mutex::new(Some(results_rx)),
            available: AtomicBool::new(true),
            failures: AtomicU32::new(0),
        }
    }

    /// Take the broker up or down.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Reject the next `count` publishes.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Report a result as an agent would.
    pub fn report(&self, result: StepResult) -> Result<()> {
        self.results_tx
            .send(result)
            .map_err(|_| Error::QueueUnavailable("result channel closed".to_string()))
    }

    /// Pop the oldest command on `queue`, waiting up to `timeout` for one.
    pub async fn next_command(&self, queue: &str, timeout: Duration) -> Option<Command> {
        let deadline = Instant::now() + timeout;
        loop {
            let payload = self
                .queues
                .lock()
                .await
                .get_mut(queue)
                .and_then(|q| q.pop_front());

            if let Some(payload) = payload {
                return Command::from_bytes(&payload).ok();
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Number of undelivered messages on `queue`.
    pub async fn depth(&self, queue: &str) -> usize {
        self.queues.lock().await.get(queue).map_or(0, |q| q.len())
    }

    pub async fn is_declared(&self, queue: &str) -> bool {
        self.queues.lock().await.contains_key(queue)
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryQueueService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueService for InMemoryQueueService {
    async fn declare(&self, queue: &str) -> Result<()> {
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn delete(&self, queue: &str) -> Result<()> {
        self.queues.lock().await.remove(queue);
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>, _timeout: Duration) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) || self.take_failure() {
            return Err(Error::QueueUnavailable(format!("broker rejected publish to {}", queue)));
        }

        let mut queues = self.queues.lock().await;
        let Some(messages) = queues.get_mut(queue) else {
            return Err(Error::QueueUnavailable(format!("queue {} is not declared", queue)));
        };
        messages.push_back(payload);
        Ok(())
    }

    async fn subscribe_results(&self) -> Result<ResultStream> {
        let Some(receiver) = self.results_rx.lock().await.take() else {
            return Err(Error::QueueUnavailable(
                "results are already being consumed".to_string(),
            ));
        };

        let results = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|result| (Ok(result), receiver))
        });
        Ok(Box::pin(results))
    }
}

/// Exclusive, non-reentrant path locks.
pub struct InMemoryLockService {
    held: Mutex<HashMap<String, String>>,
    released: Notify,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            released: Notify::new(),
        }
    }
}

impl Default for InMemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire(&self, path: &str, owner: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut held = self.held.lock().await;
                if !held.contains_key(path) {
                    held.insert(path.to_string(), owner.to_string());
                    return Ok(());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::LockTimeout(path.to_string()));
            }
        }
    }

    async fn release(&self, path: &str, owner: &str) -> Result<()> {
        let mut held = self.held.lock().await;
        if held.get(path).is_some_and(|holder| holder == owner) {
            held.remove(path);
            self.released.notify_waiters();
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.held.lock().await.contains_key(path))
    }
}

#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, Job>>,
    build_numbers: Mutex<HashMap<FlowId, u64>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn upsert(&self, job: &Job) -> Result<()> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn next_build_number(&self, flow_id: FlowId) -> Result<u64> {
        let mut numbers = self.build_numbers.lock().await;
        let next = numbers.entry(flow_id).or_insert(0);
        *next += 1;
        Ok(*next)
    }
}

/// Agents in registration order.
#[derive(Default)]
pub struct InMemoryAgentRepository {
    agents: RwLock<Vec<Agent>>,
}

impl InMemoryAgentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentRepository for InMemoryAgentRepository {
    async fn upsert(&self, agent: &Agent) -> Result<()> {
        let mut agents = self.agents.write().await;
        match agents.iter_mut().find(|a| a.id == agent.id) {
            Some(existing) => *existing = agent.clone(),
            None => agents.push(agent.clone()),
        }
        Ok(())
    }

    async fn get(&self, id: AgentId) -> Result<Option<Agent>> {
        Ok(self.agents.read().await.iter().find(|a| a.id == id).cloned())
    }

    async fn list(&self) -> Result<Vec<Agent>> {
        Ok(self.agents.read().await.clone())
    }

    async fn find_by_tags(&self, tags: &[String]) -> Result<Vec<Agent>> {
        Ok(self
            .agents
            .read()
            .await
            .iter()
            .filter(|a| a.matches(tags))
            .cloned()
            .collect())
    }

    async fn remove(&self, id: AgentId) -> Result<()> {
        self.agents.write().await.retain(|a| a.id != id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryPluginRepository {
    plugins: RwLock<HashMap<String, Plugin>>,
}

impl InMemoryPluginRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under its name and, if versioned, `name@version`.
    pub async fn insert(&self, plugin: Plugin) {
        let mut plugins = self.plugins.write().await;
        if let Some(version) = &plugin.version {
            plugins.insert(format!("{}@{}", plugin.name, version), plugin.clone());
        }
        plugins.insert(plugin.name.clone(), plugin);
    }
}

#[async_trait]
impl PluginRepository for InMemoryPluginRepository {
    async fn get(&self, name: &str) -> Result<Option<Plugin>> {
        let plugins = self.plugins.read().await;
        if let Some(plugin) = plugins.get(name) {
            return Ok(Some(plugin.clone()));
        }
        let unversioned = name.split_once('@').map_or(name, |(n, _)| n);
        Ok(plugins.get(unversioned).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::Arc;
    use strata_core::events::AgentStatusChangedPayload;
    use strata_core::agent::AgentStatus;

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("job.*.status", "job.123.status"));
        assert!(!subject_matches("job.*.status", "job.123.step.abc.status"));
        assert!(subject_matches("job.>", "job.123.step.abc.status"));
        assert!(!subject_matches("job.>", "job"));
        assert!(subject_matches("agent.1.status", "agent.1.status"));
        assert!(!subject_matches("agent.1", "agent.1.status"));
    }

    #[tokio::test]
    async fn test_event_bus_filters_by_pattern() {
        let bus = InMemoryEventBus::new();
        let mut agents = bus.subscribe("agent.>").await.unwrap();

        let event = Event::AgentStatusChanged(AgentStatusChangedPayload {
            agent_id: AgentId::new(),
            name: "a1".to_string(),
            from: AgentStatus::Idle,
            to: AgentStatus::Busy,
            job_id: None,
            timestamp: chrono::Utc::now(),
        });
        bus.publish(event.clone()).await.unwrap();

        let received = agents.next().await.unwrap().unwrap();
        assert_eq!(received, event);
        assert_eq!(bus.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_requires_declared_queue() {
        let queues = InMemoryQueueService::new();
        let timeout = Duration::from_millis(10);

        let err = queues.publish("cmd.x", b"{}".to_vec(), timeout).await.unwrap_err();
        assert!(matches!(err, Error::QueueUnavailable(_)));

        queues.declare("cmd.x").await.unwrap();
        queues.publish("cmd.x", b"{}".to_vec(), timeout).await.unwrap();
        assert_eq!(queues.depth("cmd.x").await, 1);

        queues.fail_next(1);
        assert!(queues.publish("cmd.x", b"{}".to_vec(), timeout).await.is_err());
        assert!(queues.publish("cmd.x", b"{}".to_vec(), timeout).await.is_ok());

        queues.delete("cmd.x").await.unwrap();
        assert!(!queues.is_declared("cmd.x").await);
    }

    #[tokio::test]
    async fn test_results_stream_is_single_consumer() {
        let queues = InMemoryQueueService::new();
        assert!(queues.subscribe_results().await.is_ok());
        assert!(queues.subscribe_results().await.is_err());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_and_non_reentrant() {
        let locks = Arc::new(InMemoryLockService::new());
        let short = Duration::from_millis(20);

        locks.acquire("/strata/agents", "s1", short).await.unwrap();
        assert!(locks.exists("/strata/agents").await.unwrap());

        let err = locks.acquire("/strata/agents", "s1", short).await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));

        // Release by a non-holder is ignored.
        locks.release("/strata/agents", "s2").await.unwrap();
        assert!(locks.exists("/strata/agents").await.unwrap());

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire("/strata/agents", "s2", Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        locks.release("/strata/agents", "s1").await.unwrap();

        waiter.await.unwrap().unwrap();
        assert!(locks.exists("/strata/agents").await.unwrap());
    }

    #[tokio::test]
    async fn test_build_numbers_are_per_flow() {
        let repo = InMemoryJobRepository::new();
        let (a, b) = (FlowId::new(), FlowId::new());

        assert_eq!(repo.next_build_number(a).await.unwrap(), 1);
        assert_eq!(repo.next_build_number(a).await.unwrap(), 2);
        assert_eq!(repo.next_build_number(b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_plugin_lookup_ignores_untracked_version() {
        let repo = InMemoryPluginRepository::new();
        repo.insert(Plugin {
            name: "strata/checkout".to_string(),
            version: None,
            script: "git clone $REPO".to_string(),
            inputs: vec![],
        })
        .await;

        assert!(repo.get("strata/checkout").await.unwrap().is_some());
        assert!(repo.get("strata/checkout@v2").await.unwrap().is_some());
        assert!(repo.get("strata/deploy").await.unwrap().is_none());
    }
}

//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Granularity of the cluster-wide lock taken around agent selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// One lock for every selection. Simple, serializes all scheduling.
    #[default]
    Global,
    /// One lock per required tag set.
    Tags,
}

/// Timeouts, retry bounds and execution defaults for the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub lock_scope: LockScope,
    /// Maximum wait for the agent-selection lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Maximum wait for the broker to accept a command.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Extra publish attempts before a step is failed.
    #[serde(default = "default_dispatch_retries")]
    pub dispatch_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Agent acquisition attempts before the job fails. Zero retries forever.
    #[serde(default)]
    pub acquire_attempts: u32,
    /// How long a kill is given to be acknowledged before the step is
    /// finalized without the agent.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Step timeout used when a node declares none.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,
    /// Base directory on the agent; each job gets a subdirectory.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// Prefixes of output variables agents export back to the job.
    #[serde(default = "default_env_filters")]
    pub env_filters: Vec<String>,
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_publish_timeout_ms() -> u64 {
    5_000
}

fn default_dispatch_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_kill_grace_ms() -> u64 {
    30_000
}

fn default_step_timeout_secs() -> u64 {
    1_800
}

fn default_working_dir() -> String {
    "/var/strata/workspace".to_string()
}

fn default_env_filters() -> Vec<String> {
    vec!["STRATA_".to_string(), "FLOW_".to_string()]
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_scope: LockScope::default(),
            lock_timeout_ms: default_lock_timeout_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            dispatch_retries: default_dispatch_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            acquire_attempts: 0,
            kill_grace_ms: default_kill_grace_ms(),
            default_step_timeout_secs: default_step_timeout_secs(),
            working_dir: default_working_dir(),
            env_filters: default_env_filters(),
        }
    }
}

impl SchedulerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Set the lock scope.
    pub fn with_lock_scope(mut self, scope: LockScope) -> Self {
        self.lock_scope = scope;
        self
    }

    /// Set the backoff window used for agent acquisition and publish retries.
    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_max_ms = max_ms;
        self
    }

    /// Set the kill acknowledgment grace period.
    pub fn with_kill_grace_ms(mut self, grace_ms: u64) -> Self {
        self.kill_grace_ms = grace_ms;
        self
    }

    /// Set the number of agent acquisition attempts.
    pub fn with_acquire_attempts(mut self, attempts: u32) -> Self {
        self.acquire_attempts = attempts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: SchedulerConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.lock_scope, LockScope::Global);
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert_eq!(config.dispatch_retries, 3);
        assert_eq!(config.acquire_attempts, 0);
        assert_eq!(config.env_filters, vec!["STRATA_", "FLOW_"]);
    }

    #[test]
    fn test_builder() {
        let config = SchedulerConfig::default()
            .with_lock_scope(LockScope::Tags)
            .with_backoff(10, 100)
            .with_kill_grace_ms(50)
            .with_acquire_attempts(2);

        assert_eq!(config.lock_scope, LockScope::Tags);
        assert_eq!(config.backoff_base(), Duration::from_millis(10));
        assert_eq!(config.backoff_max(), Duration::from_millis(100));
        assert_eq!(config.kill_grace(), Duration::from_millis(50));
        assert_eq!(config.acquire_attempts, 2);
    }
}

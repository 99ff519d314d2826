//! Service configuration.
//!
//! Layered from an optional YAML file and `STRATA__`-prefixed environment
//! variables, with `__` separating nested keys:
//! `STRATA__SCHEDULER__LOCK_SCOPE=tags`, `STRATA__NATS__URLS=nats://a,nats://b`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use strata_core::ports::Plugin;
use strata_nats::NatsConfig;
use strata_scheduler::SchedulerConfig;

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "strata";

const ENV_PREFIX: &str = "STRATA";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub scheduler: SchedulerConfig,
    pub nats: NatsConfig,
    pub log: LogConfig,
    pub intake: IntakeConfig,
    /// Agents registered at startup.
    pub agents: Vec<AgentConfig>,
    /// Plugin catalogue served to the dispatcher.
    pub plugins: Vec<Plugin>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Subjects `serve` answers job requests on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    pub submit_subject: String,
    pub cancel_subject: String,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            submit_subject: "strata.jobs.submit".to_string(),
            cancel_subject: "strata.jobs.cancel".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub token: String,
}

impl ServerConfig {
    /// Load from `path`, or from `strata.{yml,yaml,toml,json}` in the
    /// working directory if present, then apply the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_sources(path, environment())
    }

    fn from_sources(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(env)
            .build()
            .context("Failed to read configuration")?;

        let config: Self = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.nats.urls.is_empty() {
            anyhow::bail!("nats.urls must name at least one server");
        }
        for agent in &self.agents {
            if agent.token.trim().is_empty() {
                anyhow::bail!("agent '{}' has an empty token", agent.name);
            }
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("nats.urls")
        .with_list_parse_key("scheduler.env_filters")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use strata_scheduler::LockScope;

    fn write_config(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("strata-{}.yml", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        environment().source(Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ))
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = ServerConfig::from_sources(None, env(&[])).unwrap();
        assert_eq!(config.scheduler.lock_scope, LockScope::Global);
        assert_eq!(config.nats.urls, vec!["nats://localhost:4222"]);
        assert_eq!(config.intake.submit_subject, "strata.jobs.submit");
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_file_with_agents_and_plugins() {
        let path = write_config(
            r#"
scheduler:
  lock_scope: tags
  kill_grace_ms: 1000
agents:
  - name: builder-1
    tags: [linux, docker]
    token: secret-1
plugins:
  - name: notify
    version: "1.0"
    script: curl -d "$MESSAGE" $URL
    inputs:
      - name: URL
        required: true
"#,
        );

        let config = ServerConfig::from_sources(Some(&path), env(&[])).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.scheduler.lock_scope, LockScope::Tags);
        assert_eq!(config.scheduler.kill_grace_ms, 1000);
        assert_eq!(config.scheduler.lock_timeout_ms, 5000);
        assert_eq!(
            config.agents,
            vec![AgentConfig {
                name: "builder-1".to_string(),
                tags: vec!["linux".to_string(), "docker".to_string()],
                token: "secret-1".to_string(),
            }]
        );
        assert_eq!(config.plugins[0].inputs[0].name, "URL");
        assert!(config.plugins[0].inputs[0].required);
    }

    #[test]
    fn test_environment_overrides_file() {
        let path = write_config("scheduler:\n  lock_timeout_ms: 100\n");
        let config = ServerConfig::from_sources(
            Some(&path),
            env(&[
                ("STRATA__SCHEDULER__LOCK_TIMEOUT_MS", "250"),
                ("STRATA__NATS__URLS", "nats://a:4222,nats://b:4222"),
                ("STRATA__LOG__JSON", "true"),
            ]),
        )
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.scheduler.lock_timeout_ms, 250);
        assert_eq!(config.nats.urls, vec!["nats://a:4222", "nats://b:4222"]);
        assert!(config.log.json);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let missing = std::env::temp_dir().join("strata-does-not-exist.yml");
        assert!(ServerConfig::from_sources(Some(&missing), env(&[])).is_err());
    }

    #[test]
    fn test_empty_agent_token_rejected() {
        let path = write_config("agents:\n  - name: a\n    token: \"\"\n");
        let err = ServerConfig::from_sources(Some(&path), env(&[])).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(err.to_string().contains("empty token"));
    }
}

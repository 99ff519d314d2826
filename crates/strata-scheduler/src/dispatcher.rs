//! Builds command payloads for nodes and hands them to agent queues.

use crate::config::SchedulerConfig;
use std::sync::Arc;
use strata_core::agent::Agent;
use strata_core::cmd::{Command, ShellCommand};
use strata_core::job::Job;
use strata_core::node::{Node, NodeTree};
use strata_core::ports::{PluginRepository, QueueService};
use strata_core::variables::{self, VariableMap};
use strata_core::{CmdId, Error, JobId, Result};
use tracing::debug;

pub const ENV_JOB_ID: &str = "STRATA_JOB_ID";
pub const ENV_FLOW_ID: &str = "STRATA_FLOW_ID";
pub const ENV_BUILD_NUMBER: &str = "STRATA_BUILD_NUMBER";
pub const ENV_NODE_PATH: &str = "STRATA_NODE_PATH";
pub const ENV_NODE_NAME: &str = "STRATA_NODE_NAME";

pub struct CmdDispatcher {
    plugins: Arc<dyn PluginRepository>,
    queues: Arc<dyn QueueService>,
    config: SchedulerConfig,
}

impl CmdDispatcher {
    pub fn new(
        plugins: Arc<dyn PluginRepository>,
        queues: Arc<dyn QueueService>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            plugins,
            queues,
            config,
        }
    }

    /// Build the shell command for an executable `node` of `job`.
    ///
    /// The environment is the node's resolved variables plus job built-ins.
    /// A plugin reference replaces the node script with the plugin's, after
    /// its inputs are checked against the environment.
    pub async fn build_command(&self, job: &Job, tree: &NodeTree, node: &Node) -> Result<Command> {
        let mut environment = variables::resolve(tree, node, &job.context);
        environment.insert(ENV_JOB_ID, job.id.to_string());
        environment.insert(ENV_FLOW_ID, job.flow_id.to_string());
        environment.insert(ENV_BUILD_NUMBER, job.build_number.to_string());
        environment.insert(ENV_NODE_PATH, node.path.as_str());
        environment.insert(ENV_NODE_NAME, node.name.as_str());

        let mut script = node.script.clone();
        if let Some(reference) = &node.plugin {
            script = Some(self.apply_plugin(reference, &mut environment).await?);
        }

        let scripts: Vec<String> = [&node.before, &script, &node.after]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .collect();

        Ok(Command::Shell(ShellCommand {
            id: CmdId::of(job.id, &node.path),
            job_id: job.id,
            path: node.path.clone(),
            scripts,
            environment,
            working_dir: format!("{}/{}", self.config.working_dir.trim_end_matches('/'), job.id),
            timeout_secs: node.timeout.unwrap_or(self.config.default_step_timeout_secs),
            env_filters: self.config.env_filters.clone(),
            plugin: node.plugin.clone(),
        }))
    }

    async fn apply_plugin(&self, reference: &str, environment: &mut VariableMap) -> Result<String> {
        let plugin = self
            .plugins
            .get(reference)
            .await?
            .ok_or_else(|| Error::PluginNotFound(reference.to_string()))?;

        for input in &plugin.inputs {
            let provided = environment
                .get(&input.name)
                .is_some_and(|value| !value.trim().is_empty());
            if provided {
                continue;
            }
            match &input.default {
                Some(default) => environment.insert(input.name.as_str(), default.as_str()),
                None if input.required => {
                    return Err(Error::MissingInput {
                        variable: input.name.clone(),
                        plugin: reference.to_string(),
                    });
                }
                None => {}
            }
        }

        Ok(plugin.script)
    }

    /// Publish `command` to `agent`'s queue.
    pub async fn dispatch(&self, command: &Command, agent: &Agent) -> Result<()> {
        let queue = agent.queue_name();
        let payload = command.to_bytes()?;

        self.queues
            .publish(&queue, payload, self.config.publish_timeout())
            .await
            .map_err(|e| match e {
                Error::QueueUnavailable(_) => e,
                other => Error::QueueUnavailable(other.to_string()),
            })?;

        debug!(queue = %queue, cmd_id = ?command.cmd_id(), "Command dispatched");
        Ok(())
    }

    pub fn build_kill_command(&self, job_id: JobId, cmd_id: Option<CmdId>) -> Command {
        Command::kill(job_id, cmd_id)
    }
}

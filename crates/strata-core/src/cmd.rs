//! Command payloads sent to agents and the results they report back.

use crate::ids::{CmdId, JobId};
use crate::job::StepStatus;
use crate::node::NodePath;
use crate::variables::VariableMap;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message on an agent's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Shell(ShellCommand),
    /// Abort whatever the agent is currently running and report Killed.
    Kill(KillCommand),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellCommand {
    pub id: CmdId,
    pub job_id: JobId,
    pub path: NodePath,
    /// Executed in order: before, script, after.
    pub scripts: Vec<String>,
    pub environment: VariableMap,
    pub working_dir: String,
    pub timeout_secs: u64,
    /// Only output variables starting with one of these prefixes are
    /// exported back to the job context.
    pub env_filters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillCommand {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd_id: Option<CmdId>,
}

impl Command {
    pub fn kill(job_id: JobId, cmd_id: Option<CmdId>) -> Self {
        Command::Kill(KillCommand { job_id, cmd_id })
    }

    pub fn job_id(&self) -> JobId {
        match self {
            Command::Shell(c) => c.job_id,
            Command::Kill(c) => c.job_id,
        }
    }

    /// Step id the command addresses, if any.
    pub fn cmd_id(&self) -> Option<&CmdId> {
        match self {
            Command::Shell(c) => Some(&c.id),
            Command::Kill(c) => c.cmd_id.as_ref(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Execution result reported by an agent for one step.
///
/// A `Running` result acknowledges that execution started; every other
/// status is final for the step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub cmd_id: CmdId,
    pub status: StepStatus,
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub output: VariableMap,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn new(cmd_id: CmdId, status: StepStatus) -> Self {
        Self {
            cmd_id,
            status,
            code: None,
            process_id: None,
            output: VariableMap::new(),
            error: None,
            start_at: None,
            finish_at: None,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_output(mut self, output: VariableMap) -> Self {
        self.output = output;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn job_id(&self) -> Result<JobId> {
        self.cmd_id.decode().map(|(job_id, _)| job_id)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

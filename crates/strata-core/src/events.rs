//! Status-change events emitted by the scheduler core.

use crate::agent::AgentStatus;
use crate::ids::*;
use crate::job::{JobStatus, StepStatus};
use crate::node::NodePath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All events in the Strata CI core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    JobCreated(JobCreatedPayload),
    JobStatusChanged(JobStatusChangedPayload),
    StepStatusChanged(StepStatusChangedPayload),
    AgentStatusChanged(AgentStatusChangedPayload),
}

impl Event {
    /// Returns the NATS subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::JobCreated(p) => format!("job.created.{}", p.flow_id),
            Event::JobStatusChanged(p) => format!("job.{}.status", p.job_id),
            Event::StepStatusChanged(p) => format!("job.{}.step.{}.status", p.job_id, p.cmd_id),
            Event::AgentStatusChanged(p) => format!("agent.{}.status", p.agent_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCreatedPayload {
    pub job_id: JobId,
    pub flow_id: FlowId,
    pub build_number: u64,
    pub step_count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusChangedPayload {
    pub job_id: JobId,
    pub flow_id: FlowId,
    pub from: JobStatus,
    pub to: JobStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatusChangedPayload {
    pub job_id: JobId,
    pub cmd_id: CmdId,
    pub path: NodePath,
    pub from: StepStatus,
    pub to: StepStatus,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusChangedPayload {
    pub agent_id: AgentId,
    pub name: String,
    pub from: AgentStatus,
    pub to: AgentStatus,
    pub job_id: Option<JobId>,
    pub timestamp: DateTime<Utc>,
}

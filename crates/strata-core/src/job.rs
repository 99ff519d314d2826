//! Job and step execution records.

use crate::ids::{AgentId, CmdId, FlowId, JobId};
use crate::node::{NodePath, NodeTree};
use crate::variables::VariableMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One execution instance of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub flow_id: FlowId,
    pub build_number: u64,
    pub status: JobStatus,
    /// Variables accumulated at runtime; step outputs are merged in as
    /// each step completes.
    pub context: VariableMap,
    /// One record per tree node, in traversal order.
    pub steps: Vec<ExecutedCmd>,
    /// Agent tags required to run the job.
    pub tags: Vec<String>,
    pub agent_id: Option<AgentId>,
    /// Why the job failed when no step carries the reason, e.g. no agent
    /// could be acquired.
    #[serde(default)]
    pub error: Option<String>,
    /// Content hash of the pipeline YAML the job runs.
    pub yaml_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }
}

impl Job {
    /// Create a job with one pending step per node of `tree`.
    pub fn new(
        flow_id: FlowId,
        build_number: u64,
        tree: &NodeTree,
        yaml_hash: impl Into<String>,
        context: VariableMap,
    ) -> Self {
        let id = JobId::new();
        let now = Utc::now();
        let steps = tree
            .nodes()
            .map(|node| ExecutedCmd::new(id, &node.path, node.allow_failure))
            .collect();

        Self {
            id,
            flow_id,
            build_number,
            status: JobStatus::Created,
            context,
            steps,
            tags: tree.required_tags().to_vec(),
            agent_id: None,
            error: None,
            yaml_hash: yaml_hash.into(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn step(&self, path: &NodePath) -> Option<&ExecutedCmd> {
        self.steps.iter().find(|s| &s.path == path)
    }

    pub fn step_mut(&mut self, path: &NodePath) -> Option<&mut ExecutedCmd> {
        self.steps.iter_mut().find(|s| &s.path == path)
    }

    /// The step currently dispatched or executing, if any.
    pub fn in_flight(&self) -> Option<&ExecutedCmd> {
        self.steps
            .iter()
            .find(|s| matches!(s.status, StepStatus::Sent | StepStatus::Running))
    }

    /// Move the job to `status`. Terminal states are sticky.
    pub fn set_status(&mut self, status: JobStatus) -> bool {
        if self.status.is_terminal() || self.status == status {
            return false;
        }
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.finished_at = Some(now);
        }
        true
    }
}

/// Runtime record of one node's execution within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedCmd {
    pub id: CmdId,
    pub path: NodePath,
    pub status: StepStatus,
    pub allow_failure: bool,
    pub process_id: Option<u32>,
    pub code: Option<i32>,
    pub output: VariableMap,
    pub error: Option<String>,
    /// Number of times the command has been handed to the queue.
    pub attempts: u32,
    pub start_at: Option<DateTime<Utc>>,
    pub finish_at: Option<DateTime<Utc>>,
}

impl ExecutedCmd {
    pub fn new(job_id: JobId, path: &NodePath, allow_failure: bool) -> Self {
        Self {
            id: CmdId::of(job_id, path),
            path: path.clone(),
            status: StepStatus::Pending,
            allow_failure,
            process_id: None,
            code: None,
            output: VariableMap::new(),
            error: None,
            attempts: 0,
            start_at: None,
            finish_at: None,
        }
    }

    /// Apply a status transition if it is allowed; returns whether the
    /// status changed.
    pub fn transition(&mut self, next: StepStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        let now = Utc::now();
        if next == StepStatus::Running && self.start_at.is_none() {
            self.start_at = Some(now);
        }
        if next.is_terminal() && self.finish_at.is_none() {
            self.finish_at = Some(now);
        }
        true
    }

    /// Whether this step counts against the job's final status.
    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Sent,
    Running,
    Success,
    Failed,
    Killed,
    Skipped,
    Timeout,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            StepStatus::Pending | StepStatus::Sent | StepStatus::Running
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StepStatus::Failed | StepStatus::Killed | StepStatus::Timeout
        )
    }

    /// Transitions only move forward: Pending -> Sent -> Running -> terminal.
    /// Skipped and Cancelled are only reachable before execution starts.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;

        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (Pending, Pending) => false,
            (Pending, _) => true,
            (Sent, Pending | Sent | Skipped) => false,
            (Sent, _) => true,
            (Running, Pending | Sent | Running | Skipped | Cancelled) => false,
            (Running, _) => true,
            _ => false,
        }
    }
}

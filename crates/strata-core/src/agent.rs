//! Agent types.

use crate::ids::{AgentId, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A registered execution worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub tags: BTreeSet<String>,
    pub status: AgentStatus,
    /// Set only while the agent is Busy.
    pub job_id: Option<JobId>,
    /// Queue-routing credential.
    pub token: String,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
    Timeout,
}

impl AgentStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, AgentStatus::Idle)
    }
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        tags: impl IntoIterator<Item = String>,
        token: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            name: name.into(),
            tags: tags.into_iter().collect(),
            status: AgentStatus::Idle,
            job_id: None,
            token: token.into(),
            registered_at: now,
            updated_at: now,
        }
    }

    /// Subject of the agent's dedicated command queue.
    pub fn queue_name(&self) -> String {
        queue_name(&self.token)
    }

    /// Whether the agent carries every tag in `required`.
    pub fn matches(&self, required: &[String]) -> bool {
        required.iter().all(|t| self.tags.contains(t))
    }
}

pub fn queue_name(token: &str) -> String {
    format!("cmd.{}", token)
}

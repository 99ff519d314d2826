//! Strongly-typed identifiers for domain entities.

use crate::node::NodePath;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let uuid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(uuid_str)?))
            }
        }
    };
}

define_id!(JobId, "job");
define_id!(FlowId, "flw");
define_id!(AgentId, "agt");

/// Deterministic identifier of one step execution within a job.
///
/// Derived from the job id and the node path, so both the server and an
/// agent can reconstruct it and redelivered messages dedupe on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CmdId(String);

impl CmdId {
    pub fn of(job_id: JobId, path: &NodePath) -> Self {
        let raw = format!("{}/{}", job_id, path);
        Self(URL_SAFE_NO_PAD.encode(raw.as_bytes()))
    }

    /// Recover the job id and node path this id was derived from.
    pub fn decode(&self) -> crate::Result<(JobId, NodePath)> {
        let invalid = || crate::Error::InvalidCmdId(self.0.clone());

        let bytes = URL_SAFE_NO_PAD.decode(&self.0).map_err(|_| invalid())?;
        let raw = String::from_utf8(bytes).map_err(|_| invalid())?;
        let (job, path) = raw.split_once('/').ok_or_else(invalid)?;

        let job_id = job.parse::<JobId>().map_err(|_| invalid())?;
        let path = NodePath::parse(path).map_err(|_| invalid())?;
        Ok((job_id, path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CmdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CmdId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

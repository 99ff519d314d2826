//! Error types for Strata CI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Pipeline errors
    #[error("Invalid pipeline definition: {0}")]
    Parse(String),

    #[error("Missing input '{variable}' required by plugin '{plugin}'")]
    MissingInput { variable: String, plugin: String },

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    // Job errors
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already finished: {0}")]
    JobFinished(String),

    #[error("Invalid command id: {0}")]
    InvalidCmdId(String),

    #[error("Step timeout after {seconds} seconds")]
    StepTimeout { seconds: u64 },

    // Agent errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("No available agents matching tags: {0:?}")]
    NoAgentAvailable(Vec<String>),

    // Infrastructure errors
    #[error("Lock timeout on {0}")]
    LockTimeout(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure is expected to clear up on its own and the
    /// operation should be retried rather than failing the job.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NoAgentAvailable(_) | Error::LockTimeout(_) | Error::QueueUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(Error::NoAgentAvailable(vec!["linux".into()]).is_transient());
        assert!(Error::LockTimeout("/strata/agents".into()).is_transient());
        assert!(Error::QueueUnavailable("broker down".into()).is_transient());
        assert!(!Error::Parse("bad".into()).is_transient());
        assert!(
            !Error::MissingInput {
                variable: "GIT_URL".into(),
                plugin: "checkout".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_missing_input_message() {
        let err = Error::MissingInput {
            variable: "GIT_URL".into(),
            plugin: "checkout".into(),
        };
        assert_eq!(
            err.to_string(),
            "Missing input 'GIT_URL' required by plugin 'checkout'"
        );
    }
}

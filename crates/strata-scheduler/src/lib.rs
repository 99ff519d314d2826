//! Job scheduling and orchestration for Strata CI.
//!
//! The [`Scheduler`] turns pipeline YAML into jobs and runs each one on a
//! dedicated task: acquire a matching agent under a cluster-wide lock,
//! dispatch steps one at a time in tree order, fold agent results into step
//! and job status, release the agent.

pub mod config;
pub mod dispatcher;
mod driver;
pub mod lock;
pub mod memory;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod state_machine;

pub use config::{LockScope, SchedulerConfig};
pub use dispatcher::CmdDispatcher;
pub use lock::DistributedLock;
pub use registry::AgentRegistry;
pub use scheduler::Scheduler;
pub use state_machine::{Outcome, StepStateMachine};

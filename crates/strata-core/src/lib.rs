//! Strata CI Core
//!
//! Core domain types, traits, and error handling for Strata CI.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the scheduler and its adapters.

pub mod agent;
pub mod cmd;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod node;
pub mod ports;
pub mod variables;

pub use error::{Error, Result};
pub use ids::*;

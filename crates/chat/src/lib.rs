//! Execution orchestration: turns inbound chat messages into agent runs on
//! pooled sandboxes and posts the results back.

pub mod artifacts;
pub mod error;
pub mod orchestrator;
pub mod user_error;

pub use {
    error::ExecutionError,
    orchestrator::{Orchestrator, OrchestratorSettings, Outcome, Stage},
    user_error::{UserErrorKind, classify},
};

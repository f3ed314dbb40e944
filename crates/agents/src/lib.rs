//! Agent runtime seam: the trait the orchestrator drives, a CLI-in-sandbox
//! implementation, and parsing of the agent's line-delimited JSON output.

pub mod error;
pub mod parse;
pub mod prompt;
pub mod records;
pub mod runtime;

pub use {
    error::AgentError,
    parse::{AgentOutput, OutputParser},
    records::AgentRecord,
    runtime::{AgentRequest, AgentRuntime, RecordStream, SandboxAgentRuntime},
};

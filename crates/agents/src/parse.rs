use {corral_common::Artifact, tracing::debug};

use crate::{error::AgentError, records::AgentRecord};

/// What one agent run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutput {
    pub session_id: Option<String>,
    pub result: String,
    /// Set when the agent reported an error but still produced a result.
    pub error: Option<String>,
    pub artifacts: Vec<Artifact>,
}

/// Folds a stream of [`AgentRecord`]s into an [`AgentOutput`].
#[derive(Debug, Default)]
pub struct OutputParser {
    session_id: Option<String>,
    result: Option<String>,
    error: Option<String>,
    artifacts: Vec<Artifact>,
}

impl OutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) {
        match AgentRecord::parse_line(line) {
            Some(record) => self.push(record),
            None if !line.trim().is_empty() => debug!(len = line.len(), "skipping non-record output line"),
            None => {},
        }
    }

    pub fn push(&mut self, record: AgentRecord) {
        if let Some(id) = record.session_id() {
            self.session_id = Some(id.to_string());
        }
        for artifact in record.artifacts() {
            self.add_artifact(artifact.clone());
        }
        match record {
            AgentRecord::Result {
                result,
                is_error,
                error,
                ..
            } => {
                if is_error {
                    self.error = error.or(result).or_else(|| Some("agent reported an error".into()));
                } else {
                    if let Some(text) = result {
                        self.result = Some(text);
                    }
                    if error.is_some() {
                        self.error = error;
                    }
                }
            },
            AgentRecord::Error { message } => {
                self.error.get_or_insert(message);
            },
            _ => {},
        }
    }

    /// Artifacts are keyed by path. A later record may add the inline
    /// payload an earlier one lacked; a payload is never replaced by a bare
    /// reference.
    fn add_artifact(&mut self, artifact: Artifact) {
        match self.artifacts.iter_mut().find(|a| a.path == artifact.path) {
            Some(existing) => {
                if existing.data.is_none() && artifact.data.is_some() {
                    existing.data = artifact.data;
                }
                if existing.filename.is_empty() {
                    existing.filename = artifact.filename;
                }
            },
            None => self.artifacts.push(artifact),
        }
    }

    pub fn finish(self) -> Result<AgentOutput, AgentError> {
        match (self.result, self.error) {
            (Some(result), error) => Ok(AgentOutput {
                session_id: self.session_id,
                result,
                error,
                artifacts: self.artifacts,
            }),
            (None, Some(message)) => Err(AgentError::Failed {
                message,
                session_id: self.session_id,
            }),
            (None, None) => Err(AgentError::NoResult),
        }
    }
}

/// Parse a complete stdout capture.
pub fn parse_output(stdout: &str) -> Result<AgentOutput, AgentError> {
    let mut parser = OutputParser::new();
    for line in stdout.lines() {
        parser.push_line(line);
    }
    parser.finish()
}

use {corral_sandbox::SandboxError, thiserror::Error};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("agent binary `{0}` is not installed in the sandbox")]
    NotInstalled(String),

    #[error("agent install exited with {exit_code}: {stderr}")]
    InstallFailed { exit_code: i32, stderr: String },

    /// The agent reported an error and produced no result.
    #[error("agent failed: {message}")]
    Failed {
        message: String,
        session_id: Option<String>,
    },

    #[error("agent produced neither a result nor an error")]
    NoResult,
}

const STALE_SESSION_MARKERS: &[&str] = &[
    "no conversation found",
    "session not found",
    "unknown session",
    "invalid session",
];

impl AgentError {
    /// The agent rejected the session it was asked to continue.
    pub fn is_stale_session(&self) -> bool {
        match self {
            Self::Failed { message, .. } => {
                let lower = message.to_lowercase();
                STALE_SESSION_MARKERS.iter().any(|m| lower.contains(m))
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(message: &str) -> AgentError {
        AgentError::Failed {
            message: message.into(),
            session_id: None,
        }
    }

    #[test]
    fn stale_session_detection() {
        assert!(failed("No conversation found with session ID: abc").is_stale_session());
        assert!(failed("error: Session not found").is_stale_session());
        assert!(!failed("rate limit exceeded").is_stale_session());
        assert!(!AgentError::NoResult.is_stale_session());
    }
}

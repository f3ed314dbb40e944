//! Map internal failures to messages safe to show in the chat thread.
//!
//! Raw error text can contain sandbox paths, provider responses or tokens;
//! it goes to the log and only the category reaches the user.

use {
    corral_agents::AgentError,
    corral_sandbox::{PoolError, SandboxError, provision::ProvisionError},
};

use crate::error::ExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserErrorKind {
    Auth,
    RateLimited,
    TimedOut,
    Busy,
    Generic,
}

impl UserErrorKind {
    pub fn message(self) -> &'static str {
        match self {
            Self::Auth => {
                "I couldn't authenticate with one of the services I depend on. An operator needs to check the configured credentials."
            },
            Self::RateLimited => "I'm being rate limited right now. Please try again in a minute.",
            Self::TimedOut => {
                "That took too long and was stopped. Try breaking the request into smaller steps."
            },
            Self::Busy => {
                "All of my workspaces are busy or still starting up. Please try again shortly."
            },
            Self::Generic => "Something went wrong while working on that. Please try again.",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimited => "rate_limited",
            Self::TimedOut => "timed_out",
            Self::Busy => "busy",
            Self::Generic => "generic",
        }
    }
}

const AUTH_STATUS: &[&str] = &["401", "403"];

const AUTH_MARKERS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "invalid api key",
    "invalid x-api-key",
    "authentication",
    "not logged in",
];

const RATE_LIMIT_STATUS: &[&str] = &["429"];

const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "rate_limit", "overloaded", "too many requests"];

const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout", "deadline exceeded"];

/// Whether `code` appears in `text` as a number of its own, not as part of
/// a longer one.
fn has_status(text: &str, code: &str) -> bool {
    text.match_indices(code).any(|(at, _)| {
        let before = text[..at].chars().next_back();
        let after = text[at + code.len()..].chars().next();
        !before.is_some_and(|c| c.is_ascii_digit()) && !after.is_some_and(|c| c.is_ascii_digit())
    })
}

/// Classify free-form error text reported by the agent.
pub fn classify_text(text: &str) -> UserErrorKind {
    let lower = text.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));
    let has_any_status = |codes: &[&str]| codes.iter().any(|c| has_status(&lower, c));
    if has(AUTH_MARKERS) || has_any_status(AUTH_STATUS) {
        UserErrorKind::Auth
    } else if has(RATE_LIMIT_MARKERS) || has_any_status(RATE_LIMIT_STATUS) {
        UserErrorKind::RateLimited
    } else if has(TIMEOUT_MARKERS) {
        UserErrorKind::TimedOut
    } else {
        UserErrorKind::Generic
    }
}

fn classify_sandbox(err: &SandboxError) -> UserErrorKind {
    match err {
        SandboxError::Unauthorized(_) => UserErrorKind::Auth,
        SandboxError::RateLimited(_) => UserErrorKind::RateLimited,
        SandboxError::Timeout { .. } => UserErrorKind::TimedOut,
        SandboxError::NotFound(_) | SandboxError::Provider(_) | SandboxError::Transport(_) => {
            UserErrorKind::Generic
        },
    }
}

pub fn classify(err: &ExecutionError) -> UserErrorKind {
    match err {
        ExecutionError::Pool(PoolError::WarmingUp | PoolError::ShuttingDown)
        | ExecutionError::QueueTimeout(_) => UserErrorKind::Busy,
        ExecutionError::Pool(PoolError::RebuildFailed { source, .. }) => match source {
            ProvisionError::Sandbox(e) => classify_sandbox(e),
            _ => UserErrorKind::Generic,
        },
        ExecutionError::Agent(AgentError::Sandbox(e)) => classify_sandbox(e),
        ExecutionError::Agent(AgentError::Failed { message, .. }) => classify_text(message),
        ExecutionError::Agent(
            AgentError::NotInstalled(_) | AgentError::InstallFailed { .. } | AgentError::NoResult,
        ) => UserErrorKind::Generic,
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, std::time::Duration};

    #[rstest]
    #[case("Invalid API key · Please run /login", UserErrorKind::Auth)]
    #[case("API Error: 401 {\"type\":\"authentication_error\"}", UserErrorKind::Auth)]
    #[case("API Error: 429 rate_limit_error", UserErrorKind::RateLimited)]
    #[case("Overloaded", UserErrorKind::RateLimited)]
    #[case("request timed out", UserErrorKind::TimedOut)]
    #[case("HTTP 403 from upstream", UserErrorKind::Auth)]
    #[case("status=429", UserErrorKind::RateLimited)]
    #[case("could not bind port 4013", UserErrorKind::Generic)]
    #[case("syntax error on line 1403", UserErrorKind::Generic)]
    #[case("tool crashed: exit 2", UserErrorKind::Generic)]
    #[case("", UserErrorKind::Generic)]
    fn classifies_agent_text(#[case] text: &str, #[case] expected: UserErrorKind) {
        assert_eq!(classify_text(text), expected);
    }

    #[rstest]
    #[case(ExecutionError::Pool(PoolError::WarmingUp), UserErrorKind::Busy)]
    #[case(ExecutionError::QueueTimeout(Duration::from_secs(600)), UserErrorKind::Busy)]
    #[case(
        ExecutionError::Agent(AgentError::Sandbox(SandboxError::Timeout {
            operation: "exec",
            timeout: Duration::from_secs(900),
        })),
        UserErrorKind::TimedOut
    )]
    #[case(
        ExecutionError::Agent(AgentError::Sandbox(SandboxError::Unauthorized("bad token".into()))),
        UserErrorKind::Auth
    )]
    #[case(
        ExecutionError::Pool(PoolError::RebuildFailed {
            runner: "corral-runner-0".into(),
            source: ProvisionError::Sandbox(SandboxError::RateLimited("slow down".into())),
        }),
        UserErrorKind::RateLimited
    )]
    #[case(ExecutionError::Agent(AgentError::NoResult), UserErrorKind::Generic)]
    fn classifies_execution_errors(#[case] err: ExecutionError, #[case] expected: UserErrorKind) {
        assert_eq!(classify(&err), expected);
    }

    #[test]
    fn messages_do_not_leak_details() {
        let err = ExecutionError::Agent(AgentError::Failed {
            message: "401 for key sk-live-abc at /home/agent/.config".into(),
            session_id: None,
        });
        let message = classify(&err).message();
        assert!(!message.contains("sk-live"));
        assert!(!message.contains("/home"));
    }
}

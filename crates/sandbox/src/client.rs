//! Narrow RPC surface of the remote sandbox provider.

use std::{collections::HashMap, future::Future, time::Duration};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("provider rate limited: {0}")]
    RateLimited(String),

    #[error("{operation} timed out after {}s", .timeout.as_secs())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl SandboxError {
    /// `NotFound` means "absent", not "broken".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Provider view of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Options for a single command execution.
#[derive(Clone)]
pub struct ExecOptions {
    pub env: HashMap<String, String>,
    pub dir: Option<String>,
    pub stdin: Option<String>,
    pub timeout: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            env: HashMap::new(),
            dir: None,
            stdin: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for ExecOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Env values carry secrets; show names only.
        let mut env: Vec<_> = self.env.keys().collect();
        env.sort();
        f.debug_struct("ExecOptions")
            .field("env", &env)
            .field("dir", &self.dir)
            .field("stdin", &self.stdin.as_ref().map(String::len))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

/// Result of a command executed inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

/// One egress rule. Rules are evaluated in order by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRule {
    pub action: RuleAction,
    pub domain: String,
}

impl NetworkRule {
    pub fn allow(domain: impl Into<String>) -> Self {
        Self {
            action: RuleAction::Allow,
            domain: domain.into(),
        }
    }

    pub fn deny(domain: impl Into<String>) -> Self {
        Self {
            action: RuleAction::Deny,
            domain: domain.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub id: String,
    #[serde(default)]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Remote isolation provider. Every call may be slow or fail; callers wrap
/// them in [`with_timeout`].
#[async_trait]
pub trait SandboxClient: Send + Sync {
    async fn create(&self, name: &str) -> Result<SandboxInfo>;

    /// `Ok(None)` when the sandbox does not exist.
    async fn get(&self, name: &str) -> Result<Option<SandboxInfo>>;

    async fn delete(&self, name: &str) -> Result<()>;

    async fn exec(&self, name: &str, argv: &[String], opts: &ExecOptions) -> Result<ExecOutput>;

    async fn set_network_policy(&self, name: &str, rules: &[NetworkRule]) -> Result<()>;

    async fn create_checkpoint(&self, name: &str, comment: Option<&str>) -> Result<String>;

    async fn list_checkpoints(&self, name: &str) -> Result<Vec<CheckpointInfo>>;

    async fn restore_checkpoint(&self, name: &str, checkpoint_id: &str) -> Result<()>;

    async fn list(&self, prefix: &str) -> Result<Vec<SandboxInfo>>;
}

/// Run a provider call under a deadline, turning a hang into
/// [`SandboxError::Timeout`].
pub async fn with_timeout<T>(
    operation: &'static str,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SandboxError::Timeout { operation, timeout }),
    }
}

/// `sh -c <script>` argv.
pub fn shell(script: impl Into<String>) -> Vec<String> {
    vec!["sh".into(), "-c".into(), script.into()]
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn with_timeout_converts_hang() {
        let result: Result<()> = with_timeout("exec", Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { operation: "exec", .. }));
        assert_eq!(err.to_string(), "exec timed out after 5s");
    }

    #[tokio::test]
    async fn with_timeout_passes_through_errors() {
        let result: Result<()> = with_timeout("get", Duration::from_secs(5), async {
            Err(SandboxError::NotFound("runner-0".into()))
        })
        .await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[test]
    fn network_rule_serde() {
        let rule = NetworkRule::allow("pypi.org");
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json, serde_json::json!({"action": "allow", "domain": "pypi.org"}));
    }

    #[test]
    fn exec_options_debug_hides_env_values() {
        let mut opts = ExecOptions::default();
        opts.env.insert("API_KEY".into(), "sk-live-123".into());
        let debug = format!("{opts:?}");
        assert!(debug.contains("API_KEY"));
        assert!(!debug.contains("sk-live-123"));
    }

    #[test]
    fn shell_argv() {
        assert_eq!(shell("echo hi"), vec!["sh", "-c", "echo hi"]);
    }
}

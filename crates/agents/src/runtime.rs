use std::{collections::HashMap, pin::Pin, time::Duration};

use {
    async_trait::async_trait,
    corral_config::schema::{AgentConfig, PoolConfig},
    corral_sandbox::{ExecOptions, RunnerLease, client::shell},
    secrecy::{ExposeSecret, Secret},
    tokio_stream::Stream,
    tracing::{debug, info, warn},
};

use crate::{error::AgentError, records::AgentRecord};

/// Stream of records from one agent run.
pub type RecordStream<'a> = Pin<Box<dyn Stream<Item = Result<AgentRecord, AgentError>> + Send + 'a>>;

/// Everything the agent needs for one turn.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub prompt: String,
    pub working_directory: String,
    /// Permission mode, e.g. `acceptEdits`.
    pub mode: String,
    pub mcp_servers: Option<serde_json::Value>,
    pub continue_session_id: Option<String>,
    pub system_prompt: Option<String>,
    /// Tools the agent may use without asking.
    pub permissions: Vec<String>,
    pub env: HashMap<String, Secret<String>>,
}

/// Black-box executor that runs an agent inside a leased sandbox.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Make sure the agent can run in `sandbox`, installing it if needed.
    async fn ensure_installed(&self, sandbox: &RunnerLease) -> Result<(), AgentError>;

    fn execute<'a>(&'a self, sandbox: &'a RunnerLease, request: AgentRequest) -> RecordStream<'a>;
}

/// Runs an agent CLI inside the sandbox with the prompt on stdin and
/// `--output-format stream-json`.
#[derive(Debug, Clone)]
pub struct SandboxAgentRuntime {
    command: String,
    install_command: Option<String>,
    exec_timeout: Duration,
    install_timeout: Duration,
}

impl SandboxAgentRuntime {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            install_command: None,
            exec_timeout: Duration::from_secs(15 * 60),
            install_timeout: Duration::from_secs(10 * 60),
        }
    }

    pub fn from_config(agent: &AgentConfig, pool: &PoolConfig) -> Self {
        Self {
            command: agent.command.clone(),
            install_command: agent.install_command.clone(),
            exec_timeout: pool.exec_timeout(),
            install_timeout: pool.exec_timeout(),
        }
    }

    pub fn with_install_command(mut self, install: impl Into<String>) -> Self {
        self.install_command = Some(install.into());
        self
    }

    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    pub fn argv(&self, req: &AgentRequest) -> Vec<String> {
        let mut argv = vec![
            self.command.clone(),
            "--print".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
        ];
        if !req.mode.is_empty() {
            argv.extend(["--permission-mode".into(), req.mode.clone()]);
        }
        if let Some(id) = &req.continue_session_id {
            argv.extend(["--resume".into(), id.clone()]);
        }
        if let Some(prompt) = &req.system_prompt {
            argv.extend(["--append-system-prompt".into(), prompt.clone()]);
        }
        if !req.permissions.is_empty() {
            argv.extend(["--allowedTools".into(), req.permissions.join(",")]);
        }
        if let Some(servers) = &req.mcp_servers {
            let config = serde_json::json!({ "mcpServers": servers });
            argv.extend(["--mcp-config".into(), config.to_string()]);
        }
        argv
    }

    async fn is_installed(&self, sandbox: &RunnerLease) -> Result<bool, AgentError> {
        let out = sandbox
            .exec(
                &shell(format!("command -v {}", self.command)),
                &ExecOptions::default(),
            )
            .await?;
        Ok(out.success())
    }
}

#[async_trait]
impl AgentRuntime for SandboxAgentRuntime {
    async fn ensure_installed(&self, sandbox: &RunnerLease) -> Result<(), AgentError> {
        if self.is_installed(sandbox).await? {
            debug!(runner = sandbox.name(), command = %self.command, "agent present");
            return Ok(());
        }
        let Some(install) = &self.install_command else {
            return Err(AgentError::NotInstalled(self.command.clone()));
        };

        info!(runner = sandbox.name(), command = %self.command, "installing agent");
        let out = sandbox
            .exec(
                &shell(install.as_str()),
                &ExecOptions::with_timeout(self.install_timeout),
            )
            .await?;
        if !out.success() {
            return Err(AgentError::InstallFailed {
                exit_code: out.exit_code,
                stderr: out.stderr,
            });
        }
        if self.is_installed(sandbox).await? {
            Ok(())
        } else {
            Err(AgentError::NotInstalled(self.command.clone()))
        }
    }

    fn execute<'a>(&'a self, sandbox: &'a RunnerLease, request: AgentRequest) -> RecordStream<'a> {
        Box::pin(async_stream::stream! {
            let argv = self.argv(&request);
            let opts = ExecOptions {
                env: request
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), v.expose_secret().clone()))
                    .collect(),
                dir: (!request.working_directory.is_empty())
                    .then(|| request.working_directory.clone()),
                stdin: Some(request.prompt.clone()),
                timeout: self.exec_timeout,
            };
            debug!(
                runner = sandbox.name(),
                resume = request.continue_session_id.is_some(),
                env_vars = opts.env.len(),
                "starting agent"
            );

            let out = match sandbox.exec(&argv, &opts).await {
                Ok(out) => out,
                Err(e) => {
                    yield Err(AgentError::Sandbox(e));
                    return;
                }
            };

            for line in out.stdout.lines() {
                if let Some(record) = AgentRecord::parse_line(line) {
                    yield Ok(record);
                }
            }

            if !out.success() {
                warn!(runner = sandbox.name(), exit_code = out.exit_code, "agent exited with failure");
                let stderr = out.stderr.trim();
                let message = if stderr.is_empty() {
                    format!("agent exited with status {}", out.exit_code)
                } else {
                    stderr.to_string()
                };
                yield Ok(AgentRecord::Error { message });
            }
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        corral_sandbox::{
            ExecOutput, PoolSettings, RunnerPool, SandboxClient, memory::MemorySandboxClient,
        },
        std::sync::Arc,
        tokio_stream::StreamExt,
    };

    async fn leased(client: &Arc<MemorySandboxClient>) -> (RunnerPool, RunnerLease) {
        let pool = RunnerPool::new(
            Arc::clone(client) as Arc<dyn SandboxClient>,
            PoolSettings {
                size: 1,
                reap_orphans: false,
                ..Default::default()
            },
        );
        pool.initialize().await;
        for _ in 0..100 {
            if let Ok(lease) = pool.acquire().await {
                return (pool, lease);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pool never became ready");
    }

    fn stdout(s: &str) -> ExecOutput {
        ExecOutput {
            stdout: s.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    #[test]
    fn argv_includes_optional_flags() {
        let rt = SandboxAgentRuntime::new("agent");
        let req = AgentRequest {
            mode: "acceptEdits".into(),
            continue_session_id: Some("s-1".into()),
            permissions: vec!["Bash".into(), "Read".into()],
            mcp_servers: Some(serde_json::json!({"files": {"command": "mcp-files"}})),
            ..Default::default()
        };
        let argv = rt.argv(&req);
        assert_eq!(&argv[..4], ["agent", "--print", "--output-format", "stream-json"]);
        let joined = argv.join(" ");
        assert!(joined.contains("--permission-mode acceptEdits"));
        assert!(joined.contains("--resume s-1"));
        assert!(joined.contains("--allowedTools Bash,Read"));
        assert!(joined.contains(r#""mcpServers""#));
    }

    #[test]
    fn argv_omits_resume_for_fresh_threads() {
        let rt = SandboxAgentRuntime::new("agent");
        let argv = rt.argv(&AgentRequest::default());
        assert!(!argv.contains(&"--resume".to_string()));
        assert!(!argv.contains(&"--permission-mode".to_string()));
    }

    #[tokio::test]
    async fn ensure_installed_runs_install_command_once() {
        let client = Arc::new(MemorySandboxClient::new());
        let (_pool, lease) = leased(&client).await;
        let rt = SandboxAgentRuntime::new("agent")
            .with_install_command("touch /usr/local/bin/agent");

        rt.ensure_installed(&lease).await.unwrap();
        rt.ensure_installed(&lease).await.unwrap();

        let installs = client
            .exec_log()
            .iter()
            .filter(|(_, argv, _)| argv.last().is_some_and(|a| a.starts_with("touch")))
            .count();
        assert_eq!(installs, 1);
        lease.release().await;
    }

    #[tokio::test]
    async fn missing_agent_without_installer_errors() {
        let client = Arc::new(MemorySandboxClient::new());
        let (_pool, lease) = leased(&client).await;
        let err = SandboxAgentRuntime::new("agent")
            .ensure_installed(&lease)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotInstalled(ref c) if c == "agent"));
        lease.release().await;
    }

    #[tokio::test]
    async fn execute_streams_records_and_passes_env() {
        let client = Arc::new(MemorySandboxClient::new());
        client.respond("agent", |_, opts| {
            assert_eq!(opts.stdin.as_deref(), Some("hello"));
            stdout(concat!(
                r#"{"type":"system","session_id":"s-9"}"#,
                "\n",
                "not json\n",
                r#"{"type":"result","result":"hi there"}"#,
                "\n",
            ))
        });
        let (_pool, lease) = leased(&client).await;
        let rt = SandboxAgentRuntime::new("agent");

        let mut env = HashMap::new();
        env.insert("API_KEY".to_string(), Secret::new("sk-1".to_string()));
        let request = AgentRequest {
            prompt: "hello".into(),
            working_directory: "/workspace".into(),
            env,
            ..Default::default()
        };
        let records: Vec<_> = rt.execute(&lease, request).collect().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].as_ref().unwrap().session_id(), Some("s-9"));

        let (_, _, opts) = client
            .exec_log()
            .into_iter()
            .find(|(_, argv, _)| argv[0] == "agent")
            .unwrap();
        assert_eq!(opts.env["API_KEY"], "sk-1");
        assert_eq!(opts.dir.as_deref(), Some("/workspace"));
        lease.release().await;
    }

    #[tokio::test]
    async fn failed_exit_becomes_error_record() {
        let client = Arc::new(MemorySandboxClient::new());
        client.respond("agent", |_, _| ExecOutput {
            stdout: String::new(),
            stderr: "boom\n".into(),
            exit_code: 2,
        });
        let (_pool, lease) = leased(&client).await;
        let records: Vec<_> = SandboxAgentRuntime::new("agent")
            .execute(&lease, AgentRequest::default())
            .collect()
            .await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].as_ref().unwrap(), &AgentRecord::Error {
            message: "boom".into()
        });
        lease.release().await;
    }
}

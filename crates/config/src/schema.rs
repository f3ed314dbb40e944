/// Config schema types (pool, provider, debounce, sessions, agent).
use std::{collections::HashMap, path::PathBuf, time::Duration};

use {secrecy::Secret, serde::Deserialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CorralConfig {
    pub pool: PoolConfig,
    pub provider: ProviderConfig,
    pub debounce: DebounceConfig,
    pub sessions: SessionsConfig,
    pub agent: AgentConfig,
}

/// Runner pool sizing, provisioning and timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of sandboxes kept warm.
    pub size: usize,
    /// Runner names are `<prefix>-<index>`.
    pub name_prefix: String,
    /// Shell commands run once when a sandbox is provisioned from scratch.
    pub setup_commands: Vec<String>,
    /// Egress allow-list applied to every sandbox.
    pub allowed_domains: Vec<String>,
    /// Timeout for every provider call other than exec.
    pub call_timeout_secs: u64,
    /// Timeout for a single agent execution.
    pub exec_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How long a caller may sit in the wait queue.
    pub queue_timeout_secs: u64,
    /// Delete provider sandboxes under `name_prefix` that are not pool slots.
    pub reap_orphans: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 3,
            name_prefix: "corral-runner".into(),
            setup_commands: Vec::new(),
            allowed_domains: vec![
                "api.anthropic.com".into(),
                "registry.npmjs.org".into(),
                "pypi.org".into(),
                "files.pythonhosted.org".into(),
                "github.com".into(),
            ],
            call_timeout_secs: 30,
            exec_timeout_secs: 15 * 60,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            queue_timeout_secs: 10 * 60,
            reap_orphans: true,
        }
    }
}

impl PoolConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }
}

/// Remote sandbox provider endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Bearer token; usually `${CORRAL_PROVIDER_TOKEN}`.
    pub api_token: Option<Secret<String>>,
    /// Image requested when creating sandboxes. Provider default when unset.
    pub image: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".into(),
            api_token: None,
            image: None,
        }
    }
}

/// Inbound message coalescing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    /// Quiet period after the last fragment before the batch is flushed.
    pub window_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self { window_ms: 2_000 }
    }
}

impl DebounceConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Durable thread → session mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Store file. Defaults to `<data_dir>/sessions.json`.
    pub path: Option<PathBuf>,
    pub flush_delay_ms: u64,
    /// Prior turns folded into the prompt when a thread starts fresh.
    pub history_turns: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            path: None,
            flush_delay_ms: 500,
            history_turns: 20,
        }
    }
}

impl SessionsConfig {
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}

/// Agent runtime invoked inside the sandbox.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI binary inside the sandbox.
    pub command: String,
    /// Installs the agent when `command` is missing from the sandbox.
    pub install_command: Option<String>,
    pub working_directory: String,
    /// Permission mode passed to the agent (e.g. `acceptEdits`).
    pub mode: String,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    /// MCP server definitions forwarded verbatim as JSON.
    pub mcp_servers: Option<serde_json::Value>,
    /// Secrets and identity exported into the agent's environment.
    pub env: HashMap<String, Secret<String>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "agent".into(),
            install_command: None,
            working_directory: "/workspace".into(),
            mode: "acceptEdits".into(),
            system_prompt: None,
            allowed_tools: Vec::new(),
            mcp_servers: None,
            env: HashMap::new(),
        }
    }
}

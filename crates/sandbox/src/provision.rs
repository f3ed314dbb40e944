//! Bringing a single sandbox to a known-clean, checkpointed state.

use std::{sync::Arc, time::Duration};

use {
    thiserror::Error,
    tracing::{debug, info, warn},
};

use crate::client::{
    ExecOptions, NetworkRule, SandboxClient, SandboxError, shell, with_timeout,
};

/// Comment attached to the checkpoint every runner is restored to.
pub const CLEAN_CHECKPOINT_TAG: &str = "corral:clean";

const PROBE_TOKEN: &str = "corral-probe-ok";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("setup command `{command}` exited with {exit_code}: {stderr}")]
    SetupFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("liveness probe returned unexpected output (exit {exit_code}): {stdout:?}")]
    ProbeMismatch { exit_code: i32, stdout: String },
}

#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub setup_commands: Vec<String>,
    pub allowed_domains: Vec<String>,
    pub call_timeout: Duration,
    /// Deadline for each setup command; installs can be slow.
    pub setup_timeout: Duration,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            setup_commands: Vec::new(),
            allowed_domains: Vec::new(),
            call_timeout: Duration::from_secs(30),
            setup_timeout: Duration::from_secs(600),
        }
    }
}

impl From<&corral_config::schema::PoolConfig> for ProvisionSettings {
    fn from(cfg: &corral_config::schema::PoolConfig) -> Self {
        Self {
            setup_commands: cfg.setup_commands.clone(),
            allowed_domains: cfg.allowed_domains.clone(),
            call_timeout: cfg.call_timeout(),
            setup_timeout: cfg.exec_timeout(),
        }
    }
}

/// Egress policy: allow each configured domain, deny everything else.
pub fn egress_rules(allowed_domains: &[String]) -> Vec<NetworkRule> {
    allowed_domains
        .iter()
        .map(NetworkRule::allow)
        .chain(std::iter::once(NetworkRule::deny("*")))
        .collect()
}

pub struct Provisioner {
    client: Arc<dyn SandboxClient>,
    settings: ProvisionSettings,
}

impl Provisioner {
    pub fn new(client: Arc<dyn SandboxClient>, settings: ProvisionSettings) -> Self {
        Self { client, settings }
    }

    pub fn client(&self) -> &Arc<dyn SandboxClient> {
        &self.client
    }

    pub fn call_timeout(&self) -> Duration {
        self.settings.call_timeout
    }

    /// Adopt a sandbox left over from a previous process if it still carries
    /// a clean checkpoint. Returns the checkpoint id when the sandbox was
    /// restored and passed the probe, `None` when it has to be provisioned.
    pub async fn reuse_existing(&self, name: &str) -> Result<Option<String>, ProvisionError> {
        let timeout = self.settings.call_timeout;
        if with_timeout("get", timeout, self.client.get(name))
            .await?
            .is_none()
        {
            return Ok(None);
        }

        let checkpoints =
            with_timeout("list_checkpoints", timeout, self.client.list_checkpoints(name)).await?;
        let Some(clean) = checkpoints
            .into_iter()
            .filter(|c| c.comment.as_deref() == Some(CLEAN_CHECKPOINT_TAG))
            .max_by_key(|c| c.created_at)
        else {
            debug!(runner = name, "existing sandbox has no clean checkpoint");
            return Ok(None);
        };

        with_timeout(
            "restore_checkpoint",
            timeout,
            self.client.restore_checkpoint(name, &clean.id),
        )
        .await?;
        self.probe(name).await?;
        info!(runner = name, checkpoint = %clean.id, "reused existing sandbox");
        Ok(Some(clean.id))
    }

    /// Create the sandbox from scratch and capture its clean checkpoint.
    /// Any sandbox already holding the name is deleted first.
    pub async fn provision_fresh(&self, name: &str) -> Result<String, ProvisionError> {
        let timeout = self.settings.call_timeout;

        match with_timeout("delete", timeout, self.client.delete(name)).await {
            Ok(()) => debug!(runner = name, "deleted previous sandbox"),
            Err(e) if e.is_not_found() => {},
            Err(e) => return Err(e.into()),
        }

        with_timeout("create", timeout, self.client.create(name)).await?;

        for command in &self.settings.setup_commands {
            let opts = ExecOptions::with_timeout(self.settings.setup_timeout);
            let out = with_timeout(
                "setup",
                self.settings.setup_timeout,
                self.client.exec(name, &shell(command.as_str()), &opts),
            )
            .await?;
            if !out.success() {
                return Err(ProvisionError::SetupFailed {
                    command: command.clone(),
                    exit_code: out.exit_code,
                    stderr: out.stderr,
                });
            }
        }

        let rules = egress_rules(&self.settings.allowed_domains);
        with_timeout(
            "set_network_policy",
            timeout,
            self.client.set_network_policy(name, &rules),
        )
        .await?;

        let checkpoint = with_timeout(
            "create_checkpoint",
            timeout,
            self.client
                .create_checkpoint(name, Some(CLEAN_CHECKPOINT_TAG)),
        )
        .await?;
        info!(runner = name, %checkpoint, "sandbox provisioned");
        Ok(checkpoint)
    }

    /// Replace the sandbox behind `name` with a freshly provisioned one.
    pub async fn rebuild(&self, name: &str) -> Result<String, ProvisionError> {
        warn!(runner = name, "rebuilding sandbox");
        self.provision_fresh(name).await
    }

    /// Roll the sandbox back to its clean checkpoint.
    pub async fn restore(&self, name: &str, checkpoint_id: &str) -> Result<(), ProvisionError> {
        with_timeout(
            "restore_checkpoint",
            self.settings.call_timeout,
            self.client.restore_checkpoint(name, checkpoint_id),
        )
        .await?;
        Ok(())
    }

    /// Trivial command whose output must echo back exactly.
    pub async fn probe(&self, name: &str) -> Result<(), ProvisionError> {
        let argv = vec!["echo".to_string(), PROBE_TOKEN.to_string()];
        let opts = ExecOptions::with_timeout(self.settings.call_timeout);
        let out = with_timeout(
            "probe",
            self.settings.call_timeout,
            self.client.exec(name, &argv, &opts),
        )
        .await?;
        if out.success() && out.stdout.trim() == PROBE_TOKEN {
            Ok(())
        } else {
            Err(ProvisionError::ProbeMismatch {
                exit_code: out.exit_code,
                stdout: out.stdout,
            })
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::memory::MemorySandboxClient};

    fn provisioner(client: &Arc<MemorySandboxClient>, setup: &[&str]) -> Provisioner {
        Provisioner::new(
            Arc::clone(client) as Arc<dyn SandboxClient>,
            ProvisionSettings {
                setup_commands: setup.iter().map(|s| s.to_string()).collect(),
                allowed_domains: vec!["pypi.org".into()],
                ..Default::default()
            },
        )
    }

    #[test]
    fn egress_rules_end_with_deny_all() {
        let rules = egress_rules(&["a.com".into(), "b.com".into()]);
        assert_eq!(rules, vec![
            NetworkRule::allow("a.com"),
            NetworkRule::allow("b.com"),
            NetworkRule::deny("*"),
        ]);
    }

    #[tokio::test]
    async fn fresh_provision_runs_setup_policy_and_checkpoint() {
        let client = Arc::new(MemorySandboxClient::new());
        let p = provisioner(&client, &["touch /opt/tool"]);

        let checkpoint = p.provision_fresh("r-0").await.unwrap();

        assert!(client.exists("r-0"));
        assert_eq!(client.files("r-0"), vec!["/opt/tool".to_string()]);
        assert_eq!(client.network_policy("r-0").len(), 2);
        let cps = client.list_checkpoints("r-0").await.unwrap();
        assert_eq!(cps.len(), 1);
        assert_eq!(cps[0].id, checkpoint);
        assert_eq!(cps[0].comment.as_deref(), Some(CLEAN_CHECKPOINT_TAG));
    }

    #[tokio::test]
    async fn failing_setup_command_is_an_error() {
        let client = Arc::new(MemorySandboxClient::new());
        let p = provisioner(&client, &["false"]);
        let err = p.provision_fresh("r-0").await.unwrap_err();
        assert!(matches!(err, ProvisionError::SetupFailed { exit_code: 1, .. }));
    }

    #[tokio::test]
    async fn reuse_requires_clean_checkpoint() {
        let client = Arc::new(MemorySandboxClient::new());
        let p = provisioner(&client, &[]);

        assert!(p.reuse_existing("r-0").await.unwrap().is_none());

        client.create("r-0").await.unwrap();
        client.create_checkpoint("r-0", Some("manual")).await.unwrap();
        assert!(p.reuse_existing("r-0").await.unwrap().is_none());

        let clean = p.provision_fresh("r-0").await.unwrap();
        let opts = ExecOptions::default();
        client
            .exec("r-0", &shell("touch /tmp/leftover"), &opts)
            .await
            .unwrap();

        assert_eq!(p.reuse_existing("r-0").await.unwrap(), Some(clean));
        assert!(client.files("r-0").is_empty());
    }

    #[tokio::test]
    async fn probe_detects_broken_sandbox() {
        let client = Arc::new(MemorySandboxClient::new());
        let p = provisioner(&client, &[]);
        p.provision_fresh("r-0").await.unwrap();
        p.probe("r-0").await.unwrap();

        client.fail_probes("r-0", 1);
        assert!(p.probe("r-0").await.is_err());
        p.probe("r-0").await.unwrap();
    }

    #[tokio::test]
    async fn probe_on_missing_sandbox_is_not_found() {
        let client = Arc::new(MemorySandboxClient::new());
        let p = provisioner(&client, &[]);
        let err = p.probe("ghost").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Sandbox(ref e) if e.is_not_found()));
    }
}

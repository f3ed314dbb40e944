use {
    anyhow::Result,
    clap::Subcommand,
    corral_config::CorralConfig,
    corral_sandbox::{HttpSandboxClient, SandboxClient},
};

#[derive(Subcommand)]
pub enum SandboxAction {
    /// List provider sandboxes under the configured runner prefix.
    List,
}

pub async fn handle_sandbox(action: SandboxAction, config: &CorralConfig) -> Result<()> {
    match action {
        SandboxAction::List => list(config).await,
    }
}

async fn list(config: &CorralConfig) -> Result<()> {
    let client = HttpSandboxClient::from_config(&config.provider, &config.pool);
    let sandboxes = client.list(&config.pool.name_prefix).await?;
    if sandboxes.is_empty() {
        println!(
            "No sandboxes found with prefix '{}'.",
            config.pool.name_prefix
        );
        return Ok(());
    }
    println!("{:<32} {:<14} UPDATED", "NAME", "STATUS");
    for sandbox in &sandboxes {
        let updated = sandbox
            .updated_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<32} {:<14} {}",
            sandbox.name,
            sandbox.status.as_deref().unwrap_or("-"),
            updated
        );
    }
    Ok(())
}

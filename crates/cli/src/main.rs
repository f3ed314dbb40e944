mod sandbox_commands;
mod serve;
mod session_commands;

use std::path::PathBuf;

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    corral_config::CorralConfig,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "corral", about = "Corral: chat-driven agents in pooled sandboxes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file. Defaults to ./corral.toml, then ~/.config/corral/.
    #[arg(long, global = true, env = "CORRAL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Warm the runner pool and answer JSON-line messages from stdin.
    Serve,
    /// Run a single message through the agent.
    Run {
        #[arg(short, long)]
        message: String,
        /// Thread to continue. A new thread is started when omitted.
        #[arg(long)]
        thread: Option<String>,
    },
    /// Session management.
    Sessions {
        #[command(subcommand)]
        action: session_commands::SessionAction,
    },
    /// Sandbox provider inspection.
    Sandbox {
        #[command(subcommand)]
        action: sandbox_commands::SandboxAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration. Secrets are redacted.
    Show,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // stdout carries channel output; logs go to stderr.
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<CorralConfig> {
    match &cli.config {
        Some(path) => corral_config::load_config(path),
        None => Ok(corral_config::discover_and_load()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "corral starting");
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Serve => serve::serve(&config).await,
        Commands::Run { message, thread } => serve::run(&config, message, thread).await,
        Commands::Sessions { action } => session_commands::handle_sessions(action, &config).await,
        Commands::Sandbox { action } => sandbox_commands::handle_sandbox(action, &config).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => {
            println!("{config:#?}");
            Ok(())
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_and_cleanup() {
        let cli = Cli::try_parse_from(["corral", "run", "-m", "hello", "--thread", "T1"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Run { ref message, thread: Some(ref t) } if message == "hello" && t == "T1"
        ));

        let cli = Cli::try_parse_from(["corral", "sessions", "cleanup", "--max-age-days", "7"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Sessions {
                action: session_commands::SessionAction::Cleanup { max_age_days: 7 }
            }
        ));
    }
}

use std::{sync::Arc, time::Duration};

use {
    anyhow::{Result, bail},
    corral_agents::SandboxAgentRuntime,
    corral_channels::{
        ChannelOutbound, ConversationHistory,
        console::{ConsoleChannel, ConsoleInbound},
    },
    corral_chat::{Orchestrator, OrchestratorSettings, Outcome},
    corral_common::ThreadKey,
    corral_config::CorralConfig,
    corral_sandbox::{HttpSandboxClient, PoolSettings, RunnerPool, SandboxClient},
    corral_sessions::SessionStore,
    tokio::{io::BufReader, task::JoinSet},
    tracing::{info, warn},
};

const READY_POLL: Duration = Duration::from_millis(500);

struct Services {
    pool: RunnerPool,
    sessions: SessionStore,
    console: Arc<ConsoleChannel<tokio::io::Stdout>>,
    orchestrator: Arc<Orchestrator>,
}

impl Services {
    async fn start(config: &CorralConfig) -> Self {
        let client: Arc<dyn SandboxClient> =
            Arc::new(HttpSandboxClient::from_config(&config.provider, &config.pool));
        let pool = RunnerPool::new(client, PoolSettings::from(&config.pool));
        pool.initialize().await;

        let sessions = SessionStore::open(
            corral_config::sessions_path(config),
            config.sessions.flush_delay(),
        )
        .await;
        let console = Arc::new(ConsoleChannel::stdout());
        let orchestrator = Arc::new(Orchestrator::new(
            pool.clone(),
            sessions.clone(),
            Arc::new(SandboxAgentRuntime::from_config(&config.agent, &config.pool)),
            Arc::clone(&console) as Arc<dyn ChannelOutbound>,
            Arc::clone(&console) as Arc<dyn ConversationHistory>,
            config.debounce.window(),
            OrchestratorSettings::from(config),
        ));
        Self {
            pool,
            sessions,
            console,
            orchestrator,
        }
    }

    async fn stop(self) {
        for runner in self.pool.runners().await {
            info!(
                runner = %runner.name,
                state = runner.state.as_str(),
                checkpoint = runner.checkpoint_id.as_deref().unwrap_or("-"),
                "runner state at shutdown"
            );
        }
        if let Err(e) = self.sessions.flush().await {
            warn!(error = %e, "final session flush failed");
        }
        self.pool.shutdown().await;
    }
}

/// Read inbound JSON lines from stdin until EOF or a termination signal.
pub async fn serve(config: &CorralConfig) -> Result<()> {
    let services = Services::start(config).await;
    let mut inbound = ConsoleInbound::new(BufReader::new(tokio::io::stdin()));
    let mut tasks = JoinSet::new();

    let signal = shutdown_signal();
    tokio::pin!(signal);

    info!(runners = services.pool.runner_names().len(), "serving on stdin");
    let interrupted = loop {
        tokio::select! {
            msg = inbound.next_message() => match msg? {
                Some(msg) => {
                    let orchestrator = Arc::clone(&services.orchestrator);
                    let console = Arc::clone(&services.console);
                    tasks.spawn(async move {
                        let outcome = orchestrator.handle(msg.clone()).await;
                        // Recorded after the turn so it is not replayed as history.
                        console.record_inbound(&msg).await;
                        outcome
                    });
                },
                None => break false,
            },
            () = &mut signal => break true,
        }
    };

    if interrupted {
        info!(pending = tasks.len(), "shutdown requested");
        tasks.abort_all();
    } else {
        info!(pending = tasks.len(), "input closed; finishing pending turns");
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined
            && !e.is_cancelled()
        {
            warn!(error = %e, "turn task failed");
        }
    }
    services.stop().await;
    Ok(())
}

/// One-shot turn. The reply is written to stdout as JSON lines.
pub async fn run(config: &CorralConfig, message: String, thread: Option<String>) -> Result<()> {
    let services = Services::start(config).await;
    let outcome = async {
        wait_until_ready(&services.pool, config.pool.queue_timeout()).await?;
        let thread_id = thread.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let thread = ThreadKey::new("local", thread_id);
        info!(thread = %thread, "running");
        Ok::<_, anyhow::Error>(services.orchestrator.process(&thread, "cli", message).await)
    }
    .await;
    services.stop().await;

    match outcome? {
        Outcome::Failed { kind, .. } => bail!("turn failed ({})", kind.as_str()),
        _ => Ok(()),
    }
}

async fn wait_until_ready(pool: &RunnerPool, timeout: Duration) -> Result<()> {
    let wait = async {
        loop {
            let stats = pool.stats().await;
            if stats.ready > 0 {
                return;
            }
            info!(total = stats.total, "waiting for a sandbox runner");
            tokio::time::sleep(READY_POLL).await;
        }
    };
    if tokio::time::timeout(timeout, wait).await.is_err() {
        bail!("no sandbox runner became ready within {}s", timeout.as_secs());
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

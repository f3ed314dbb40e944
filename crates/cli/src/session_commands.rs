use {
    anyhow::Result, clap::Subcommand, corral_common::ThreadKey, corral_config::CorralConfig,
    corral_sessions::SessionStore,
};

#[derive(Subcommand)]
pub enum SessionAction {
    /// List stored thread sessions, most recently used first.
    List,
    /// Delete sessions not used within the given number of days.
    Cleanup {
        #[arg(long, default_value_t = 30)]
        max_age_days: u32,
    },
    /// Forget the session for one thread.
    Remove {
        conversation_id: String,
        thread_id: String,
    },
}

pub async fn handle_sessions(action: SessionAction, config: &CorralConfig) -> Result<()> {
    let path = corral_config::sessions_path(config);
    let store = SessionStore::open(path.clone(), config.sessions.flush_delay()).await;
    match action {
        SessionAction::List => {
            let sessions = store.list().await;
            if sessions.is_empty() {
                println!("No sessions in {}.", path.display());
                return Ok(());
            }
            println!(
                "{:<40} {:<38} {:<20} UPDATED",
                "THREAD", "AGENT SESSION", "RUNNER"
            );
            for (key, session) in &sessions {
                println!(
                    "{:<40} {:<38} {:<20} {}",
                    key.storage_key(),
                    session.agent_session_id,
                    session.sandbox_name.as_deref().unwrap_or("-"),
                    session.updated_at.to_rfc3339()
                );
            }
        },
        SessionAction::Cleanup { max_age_days } => {
            let removed = store.cleanup(max_age_days).await;
            store.flush().await?;
            println!("Removed {removed} session(s) older than {max_age_days} day(s).");
        },
        SessionAction::Remove {
            conversation_id,
            thread_id,
        } => {
            let key = ThreadKey::new(conversation_id, thread_id);
            match store.remove(&key).await {
                Some(_) => {
                    store.flush().await?;
                    println!("Removed session for {key}.");
                },
                None => println!("No session for {key}."),
            }
        },
    }
    Ok(())
}

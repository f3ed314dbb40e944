//! Drive one chat turn end to end: coalesce, take a runner, run the agent,
//! persist continuity, give the runner back, reply.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    corral_agents::{
        AgentOutput, AgentRequest, AgentRuntime, OutputParser,
        prompt::{build_prompt, identity_env},
    },
    corral_auto_reply::{DebounceError, Debouncer, FollowUp, InFlight},
    corral_channels::{ChannelOutbound, ConversationHistory, InboundMessage},
    corral_common::ThreadKey,
    corral_config::schema::CorralConfig,
    corral_sandbox::{RunnerLease, RunnerPool},
    corral_sessions::{Session, SessionStore},
    secrecy::Secret,
    tokio_stream::StreamExt,
    tracing::{debug, info, warn},
};

use crate::{
    artifacts,
    error::ExecutionError,
    user_error::{UserErrorKind, classify},
};

const EMPTY_REPLY: &str = "Done. The agent finished without a text reply.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Coalescing,
    Acquiring,
    ProvisioningCheck,
    Executing,
    Parsing,
    Persisting,
    Releasing,
    Done,
    Errored,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coalescing => "coalescing",
            Self::Acquiring => "acquiring",
            Self::ProvisioningCheck => "provisioning_check",
            Self::Executing => "executing",
            Self::Parsing => "parsing",
            Self::Persisting => "persisting",
            Self::Releasing => "releasing",
            Self::Done => "done",
            Self::Errored => "errored",
        }
    }
}

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Folded into a window another caller is handling.
    Merged,
    /// Parked behind a turn already running for the thread.
    Queued,
    /// The coalescing window was dropped after a failure.
    Cancelled,
    /// This caller ran `turns` turns (the first plus queued follow-ups).
    Completed { turns: usize },
    /// A turn failed; the user was told `kind`.
    Failed { kind: UserErrorKind, turns: usize },
}

/// Agent parameters applied to every run.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    pub history_turns: usize,
    pub queue_timeout: Duration,
    pub exec_timeout: Duration,
    pub working_directory: String,
    pub mode: String,
    pub mcp_servers: Option<serde_json::Value>,
    pub system_prompt: Option<String>,
    pub permissions: Vec<String>,
    pub env: HashMap<String, Secret<String>>,
}

impl From<&CorralConfig> for OrchestratorSettings {
    fn from(cfg: &CorralConfig) -> Self {
        Self {
            history_turns: cfg.sessions.history_turns,
            queue_timeout: cfg.pool.queue_timeout(),
            exec_timeout: cfg.pool.exec_timeout(),
            working_directory: cfg.agent.working_directory.clone(),
            mode: cfg.agent.mode.clone(),
            mcp_servers: cfg.agent.mcp_servers.clone(),
            system_prompt: cfg.agent.system_prompt.clone(),
            permissions: cfg.agent.allowed_tools.clone(),
            env: cfg.agent.env.clone(),
        }
    }
}

/// Tracks the stage of a single turn so failures are logged where they
/// happened.
struct Turn<'a> {
    thread: &'a ThreadKey,
    participant: &'a str,
    stage: Stage,
}

impl<'a> Turn<'a> {
    fn new(thread: &'a ThreadKey, participant: &'a str) -> Self {
        Self {
            thread,
            participant,
            stage: Stage::Coalescing,
        }
    }

    fn advance(&mut self, stage: Stage) {
        debug!(thread = %self.thread, from = self.stage.as_str(), to = stage.as_str(), "turn stage");
        self.stage = stage;
    }
}

/// Result of the work done while the lease is held.
struct Executed {
    output: AgentOutput,
    notes: Vec<String>,
}

pub struct Orchestrator {
    pool: RunnerPool,
    sessions: SessionStore,
    runtime: Arc<dyn AgentRuntime>,
    outbound: Arc<dyn ChannelOutbound>,
    history: Arc<dyn ConversationHistory>,
    debouncer: Debouncer,
    inflight: InFlight,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        pool: RunnerPool,
        sessions: SessionStore,
        runtime: Arc<dyn AgentRuntime>,
        outbound: Arc<dyn ChannelOutbound>,
        history: Arc<dyn ConversationHistory>,
        debounce_window: Duration,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            pool,
            sessions,
            runtime,
            outbound,
            history,
            debouncer: Debouncer::new(debounce_window),
            inflight: InFlight::new(),
            settings,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn pool(&self) -> &RunnerPool {
        &self.pool
    }

    /// Entry point for inbound chat messages.
    pub async fn handle(&self, msg: InboundMessage) -> Outcome {
        let coalesced = match self.debouncer.enqueue(msg.coalesce_key(), msg.text.clone()).await {
            Ok(c) => c,
            Err(DebounceError::Cancelled) => return Outcome::Cancelled,
        };
        if !coalesced.leader {
            return Outcome::Merged;
        }
        self.process(&msg.thread(), &msg.participant, coalesced.text)
            .await
    }

    /// Run `text` as a turn on `thread`, bypassing coalescing. Follow-ups
    /// that arrive while it runs are executed before returning, each under
    /// the participant who sent it.
    pub async fn process(&self, thread: &ThreadKey, participant: &str, text: String) -> Outcome {
        let Some(text) = self.inflight.try_begin(thread, participant, text).await else {
            return Outcome::Queued;
        };

        let mut next = FollowUp {
            participant: participant.to_string(),
            text,
        };
        let mut turns = 0;
        loop {
            turns += 1;
            if let Err(kind) = self
                .run_turn(thread, &next.participant, &next.text)
                .await
            {
                let dropped_windows = self.debouncer.cancel_thread(thread).await;
                let dropped_followups = self.inflight.abandon(thread).await;
                info!(
                    thread = %thread,
                    kind = kind.as_str(),
                    dropped_windows,
                    dropped_followups,
                    "turn failed; pending input discarded"
                );
                return Outcome::Failed { kind, turns };
            }
            match self.inflight.finish_or_next(thread).await {
                Some(follow_up) => next = follow_up,
                None => return Outcome::Completed { turns },
            }
        }
    }

    /// One turn. On failure the user has already been sent the sanitized
    /// message.
    async fn run_turn(
        &self,
        thread: &ThreadKey,
        participant: &str,
        text: &str,
    ) -> Result<(), UserErrorKind> {
        let mut turn = Turn::new(thread, participant);
        match self.try_turn(&mut turn, text).await {
            Ok(executed) => {
                self.reply(thread, executed).await;
                turn.advance(Stage::Done);
                Ok(())
            },
            Err(e) => {
                let kind = classify(&e);
                warn!(
                    thread = %thread,
                    stage = turn.stage.as_str(),
                    kind = kind.as_str(),
                    error = %e,
                    "turn errored"
                );
                turn.advance(Stage::Errored);
                if let Err(send_err) = self.outbound.send_text(thread, kind.message()).await {
                    warn!(thread = %thread, error = %send_err, "failed to send error reply");
                }
                Err(kind)
            },
        }
    }

    async fn try_turn(&self, turn: &mut Turn<'_>, text: &str) -> Result<Executed, ExecutionError> {
        let existing = self.sessions.get(turn.thread).await;

        turn.advance(Stage::Acquiring);
        let preferred = existing.as_ref().and_then(|s| s.sandbox_name.as_deref());
        let lease = tokio::time::timeout(
            self.settings.queue_timeout,
            self.pool.acquire_preferring(preferred),
        )
        .await
        .map_err(|_| ExecutionError::QueueTimeout(self.settings.queue_timeout))??;
        info!(thread = %turn.thread, runner = lease.name(), "runner acquired");

        let result = self.on_lease(turn, &lease, existing, text).await;
        let reached = turn.stage;

        turn.advance(Stage::Releasing);
        lease.release().await;
        if result.is_err() {
            // Report the stage that failed, not the release.
            turn.stage = reached;
        }
        result
    }

    async fn on_lease(
        &self,
        turn: &mut Turn<'_>,
        lease: &RunnerLease,
        existing: Option<Session>,
        text: &str,
    ) -> Result<Executed, ExecutionError> {
        turn.advance(Stage::ProvisioningCheck);
        self.runtime.ensure_installed(lease).await?;

        let resume = existing
            .as_ref()
            .map(|s| s.agent_session_id.clone())
            .filter(|id| !id.is_empty());
        let since = existing
            .as_ref()
            .and_then(|s| s.last_context_marker.clone());

        let (mut output, mut cursor) = match resume {
            Some(id) => {
                match self
                    .run_agent(turn, lease, text.to_string(), Some(id))
                    .await
                {
                    Err(ExecutionError::Agent(e)) if e.is_stale_session() => {
                        warn!(thread = %turn.thread, error = %e, "agent session is gone; starting fresh");
                        self.run_fresh(turn, lease, text, since.as_deref()).await?
                    },
                    other => (other?, None),
                }
            },
            None => self.run_fresh(turn, lease, text, since.as_deref()).await?,
        };
        if cursor.is_none() {
            cursor = since;
        }

        let notes = artifacts::download_missing(
            lease,
            &mut output.artifacts,
            self.settings.exec_timeout,
        )
        .await;

        turn.advance(Stage::Persisting);
        self.persist(turn, lease.name(), &output, cursor).await;

        Ok(Executed { output, notes })
    }

    /// Start a new agent session, folding in thread history the agent has
    /// not seen.
    async fn run_fresh(
        &self,
        turn: &mut Turn<'_>,
        lease: &RunnerLease,
        text: &str,
        since: Option<&str>,
    ) -> Result<(AgentOutput, Option<String>), ExecutionError> {
        let (history, cursor) = if self.settings.history_turns == 0 {
            (Vec::new(), None)
        } else {
            match self
                .history
                .fetch(turn.thread, since, self.settings.history_turns)
                .await
            {
                Ok(page) => (page.turns, page.cursor),
                Err(e) => {
                    warn!(thread = %turn.thread, error = %e, "history fetch failed; continuing without it");
                    (Vec::new(), None)
                },
            }
        };
        let prompt = build_prompt(text, &history, self.settings.history_turns);
        let output = self.run_agent(turn, lease, prompt, None).await?;
        Ok((output, cursor))
    }

    async fn run_agent(
        &self,
        turn: &mut Turn<'_>,
        lease: &RunnerLease,
        prompt: String,
        continue_session_id: Option<String>,
    ) -> Result<AgentOutput, ExecutionError> {
        let mut env = self.settings.env.clone();
        for (key, value) in identity_env(
            &turn.thread.conversation_id,
            &turn.thread.thread_id,
            turn.participant,
        ) {
            env.insert(key.to_string(), Secret::new(value));
        }
        let request = AgentRequest {
            prompt,
            working_directory: self.settings.working_directory.clone(),
            mode: self.settings.mode.clone(),
            mcp_servers: self.settings.mcp_servers.clone(),
            continue_session_id,
            system_prompt: self.settings.system_prompt.clone(),
            permissions: self.settings.permissions.clone(),
            env,
        };

        turn.advance(Stage::Executing);
        let mut parser = OutputParser::new();
        let mut records = self.runtime.execute(lease, request);
        while let Some(record) = records.next().await {
            parser.push(record?);
        }
        drop(records);

        turn.advance(Stage::Parsing);
        let output = parser.finish()?;
        if let Some(error) = &output.error {
            warn!(thread = %turn.thread, %error, "agent reported an error alongside its result");
        }
        Ok(output)
    }

    async fn persist(
        &self,
        turn: &Turn<'_>,
        runner: &str,
        output: &AgentOutput,
        cursor: Option<String>,
    ) {
        let Some(session_id) = &output.session_id else {
            warn!(thread = %turn.thread, "agent returned no session id; thread will start fresh next time");
            return;
        };
        let mut session = Session::new(session_id.as_str(), turn.participant);
        session.sandbox_name = Some(runner.to_string());
        session.last_context_marker = cursor;
        self.sessions.set(turn.thread, session).await;
    }

    async fn reply(&self, thread: &ThreadKey, executed: Executed) {
        let Executed { output, mut notes } = executed;
        notes.extend(artifacts::deliver(self.outbound.as_ref(), thread, &output.artifacts).await);

        let text = if output.result.trim().is_empty() {
            EMPTY_REPLY.to_string()
        } else {
            output.result
        };
        let text = artifacts::append_notes(text, &notes);
        if let Err(e) = self.outbound.send_text(thread, &text).await {
            warn!(thread = %thread, error = %e, "failed to send reply");
        }
    }
}

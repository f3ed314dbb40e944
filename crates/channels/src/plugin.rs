use {
    anyhow::Result,
    async_trait::async_trait,
    corral_common::{Artifact, CoalesceKey, HistoryTurn, ThreadKey},
    serde::{Deserialize, Serialize},
};

/// A message received from the chat platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub conversation_id: String,
    pub thread_id: String,
    pub participant: String,
    pub text: String,
    /// Platform cursor for this message, when the platform has one.
    #[serde(default)]
    pub marker: Option<String>,
}

impl InboundMessage {
    pub fn thread(&self) -> ThreadKey {
        ThreadKey::new(&self.conversation_id, &self.thread_id)
    }

    pub fn coalesce_key(&self) -> CoalesceKey {
        CoalesceKey::new(self.thread(), &self.participant)
    }
}

/// Send replies back to a thread.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    async fn send_text(&self, thread: &ThreadKey, text: &str) -> Result<()>;
    async fn send_artifact(&self, thread: &ThreadKey, artifact: &Artifact) -> Result<()>;
}

/// Prior turns of a thread, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryPage {
    pub turns: Vec<HistoryTurn>,
    /// Marker of the newest turn returned; store it to avoid resending.
    pub cursor: Option<String>,
}

/// Read access to a thread's earlier messages.
#[async_trait]
pub trait ConversationHistory: Send + Sync {
    /// Up to `limit` most recent turns strictly after `since_marker`.
    async fn fetch(
        &self,
        thread: &ThreadKey,
        since_marker: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage>;
}

/// History source for platforms that do not expose one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHistory;

#[async_trait]
impl ConversationHistory for NoHistory {
    async fn fetch(&self, _: &ThreadKey, _: Option<&str>, _: usize) -> Result<HistoryPage> {
        Ok(HistoryPage::default())
    }
}

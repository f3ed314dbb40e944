use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one conversation thread on the chat surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadKey {
    pub conversation_id: String,
    pub thread_id: String,
}

impl ThreadKey {
    pub fn new(conversation_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            thread_id: thread_id.into(),
        }
    }

    /// Key used in the persisted session document: `<conversationId>:<threadId>`.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.conversation_id, self.thread_id)
    }

    /// Inverse of [`ThreadKey::storage_key`]. The conversation id may not
    /// contain `:`; everything after the first separator is the thread id.
    pub fn parse_storage_key(key: &str) -> Option<Self> {
        let (conversation_id, thread_id) = key.split_once(':')?;
        if conversation_id.is_empty() || thread_id.is_empty() {
            return None;
        }
        Some(Self::new(conversation_id, thread_id))
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.conversation_id, self.thread_id)
    }
}

/// Debounce key: one participant typing in one thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoalesceKey {
    pub thread: ThreadKey,
    pub participant: String,
}

impl CoalesceKey {
    pub fn new(thread: ThreadKey, participant: impl Into<String>) -> Self {
        Self {
            thread,
            participant: participant.into(),
        }
    }
}

impl fmt::Display for CoalesceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.thread, self.participant)
    }
}

/// A file produced by an agent run.
///
/// `data` holds the inline payload when the agent emitted one; otherwise the
/// file has to be downloaded from the sandbox at `path` before release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub data: Option<Vec<u8>>,
}

impl Artifact {
    pub fn has_payload(&self) -> bool {
        self.data.is_some()
    }

    /// `filename`, or the last path segment when the agent left it empty.
    pub fn display_name(&self) -> &str {
        if !self.filename.is_empty() {
            return &self.filename;
        }
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// One earlier message in a thread, as returned by the chat platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub author: String,
    pub text: String,
    /// Platform cursor for this message (e.g. a message timestamp).
    pub marker: String,
}

mod base64_opt {
    use {
        base64::{Engine, engine::general_purpose::STANDARD},
        serde::{Deserialize, Deserializer, Serializer},
    };

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            Some(text) => STANDARD
                .decode(text.trim())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_roundtrip() {
        let key = ThreadKey::new("C123", "1700000000.000100");
        assert_eq!(key.storage_key(), "C123:1700000000.000100");
        assert_eq!(ThreadKey::parse_storage_key(&key.storage_key()), Some(key));
    }

    #[test]
    fn storage_key_rejects_malformed() {
        assert!(ThreadKey::parse_storage_key("no-separator").is_none());
        assert!(ThreadKey::parse_storage_key(":thread").is_none());
        assert!(ThreadKey::parse_storage_key("conv:").is_none());
    }

    #[test]
    fn thread_id_may_contain_separator() {
        let key = ThreadKey::parse_storage_key("conv:a:b").unwrap();
        assert_eq!(key.conversation_id, "conv");
        assert_eq!(key.thread_id, "a:b");
    }

    #[test]
    fn artifact_inline_payload_is_base64() {
        let json = r#"{"path":"/work/out.txt","filename":"out.txt","data":"aGVsbG8="}"#;
        let artifact: Artifact = serde_json::from_str(json).unwrap();
        assert_eq!(artifact.data.as_deref(), Some(&b"hello"[..]));
        assert!(artifact.has_payload());

        let back = serde_json::to_value(&artifact).unwrap();
        assert_eq!(back["data"], "aGVsbG8=");
    }

    #[test]
    fn display_name_falls_back_to_path() {
        let artifact: Artifact = serde_json::from_str(r#"{"path":"/work/out/report.md"}"#).unwrap();
        assert_eq!(artifact.display_name(), "report.md");
    }

    #[test]
    fn artifact_without_payload() {
        let json = r#"{"path":"/work/chart.png","filename":"chart.png"}"#;
        let artifact: Artifact = serde_json::from_str(json).unwrap();
        assert!(!artifact.has_payload());
        let back = serde_json::to_value(&artifact).unwrap();
        assert!(back.get("data").is_none());
    }
}

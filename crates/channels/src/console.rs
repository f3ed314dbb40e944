//! JSON-lines channel over stdin/stdout for local use.
//!
//! Input, one object per line:
//! `{"conversation_id":"C1","thread_id":"T1","participant":"U1","text":"hi"}`
//!
//! Output, one object per line, tagged with `"type": "text" | "artifact"`.

use std::collections::HashMap;

use {
    anyhow::Result,
    async_trait::async_trait,
    base64::{Engine as _, engine::general_purpose::STANDARD},
    corral_common::{Artifact, HistoryTurn, ThreadKey},
    serde::Serialize,
    tokio::{
        io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines},
        sync::Mutex,
    },
    tracing::warn,
};

use crate::plugin::{ChannelOutbound, ConversationHistory, HistoryPage, InboundMessage};

const BOT_AUTHOR: &str = "corral";

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundLine<'a> {
    Text {
        conversation_id: &'a str,
        thread_id: &'a str,
        text: &'a str,
    },
    Artifact {
        conversation_id: &'a str,
        thread_id: &'a str,
        filename: &'a str,
        path: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
}

#[derive(Default)]
struct Transcript {
    turns: HashMap<ThreadKey, Vec<HistoryTurn>>,
    seq: u64,
}

impl Transcript {
    fn record(&mut self, thread: &ThreadKey, author: &str, text: &str, marker: Option<String>) {
        self.seq += 1;
        let marker = marker.unwrap_or_else(|| format!("{:012}", self.seq));
        self.turns
            .entry(thread.clone())
            .or_default()
            .push(HistoryTurn {
                author: author.to_string(),
                text: text.to_string(),
                marker,
            });
    }
}

/// Console channel writing to `W` and remembering the transcript so it can
/// serve thread history.
pub struct ConsoleChannel<W> {
    out: Mutex<W>,
    transcript: Mutex<Transcript>,
}

impl ConsoleChannel<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send> ConsoleChannel<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            transcript: Mutex::new(Transcript::default()),
        }
    }

    /// Remember an inbound message for later history fetches.
    pub async fn record_inbound(&self, msg: &InboundMessage) {
        self.transcript.lock().await.record(
            &msg.thread(),
            &msg.participant,
            &msg.text,
            msg.marker.clone(),
        );
    }

    async fn write_line(&self, line: &OutboundLine<'_>) -> Result<()> {
        let mut json = serde_json::to_vec(line)?;
        json.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&json).await?;
        out.flush().await?;
        Ok(())
    }

    pub async fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ChannelOutbound for ConsoleChannel<W> {
    async fn send_text(&self, thread: &ThreadKey, text: &str) -> Result<()> {
        self.write_line(&OutboundLine::Text {
            conversation_id: &thread.conversation_id,
            thread_id: &thread.thread_id,
            text,
        })
        .await?;
        self.transcript
            .lock()
            .await
            .record(thread, BOT_AUTHOR, text, None);
        Ok(())
    }

    async fn send_artifact(&self, thread: &ThreadKey, artifact: &Artifact) -> Result<()> {
        self.write_line(&OutboundLine::Artifact {
            conversation_id: &thread.conversation_id,
            thread_id: &thread.thread_id,
            filename: artifact.display_name(),
            path: &artifact.path,
            data: artifact.data.as_ref().map(|d| STANDARD.encode(d)),
        })
        .await
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ConversationHistory for ConsoleChannel<W> {
    async fn fetch(
        &self,
        thread: &ThreadKey,
        since_marker: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage> {
        let transcript = self.transcript.lock().await;
        let Some(turns) = transcript.turns.get(thread) else {
            return Ok(HistoryPage::default());
        };
        let after = since_marker
            .and_then(|m| turns.iter().position(|t| t.marker == m))
            .map_or(0, |i| i + 1);
        let newer = &turns[after..];
        let start = newer.len().saturating_sub(limit);
        let page: Vec<_> = newer[start..].to_vec();
        Ok(HistoryPage {
            cursor: page.last().map(|t| t.marker.clone()),
            turns: page,
        })
    }
}

/// Reads [`InboundMessage`]s from JSON lines, skipping malformed input.
pub struct ConsoleInbound<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin> ConsoleInbound<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    /// Next message, or `None` at end of input.
    pub async fn next_message(&mut self) -> Result<Option<InboundMessage>> {
        while let Some(line) = self.lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<InboundMessage>(line) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => warn!(error = %e, "ignoring malformed inbound line"),
            }
        }
        Ok(None)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn msg(thread: &str, text: &str) -> InboundMessage {
        InboundMessage {
            conversation_id: "C1".into(),
            thread_id: thread.into(),
            participant: "U1".into(),
            text: text.into(),
            marker: None,
        }
    }

    #[tokio::test]
    async fn reads_messages_and_skips_garbage() {
        let input = concat!(
            r#"{"conversation_id":"C1","thread_id":"T1","participant":"U1","text":"hi"}"#,
            "\n\nnot json\n",
            r#"{"conversation_id":"C1","thread_id":"T2","participant":"U2","text":"yo","marker":"m1"}"#,
            "\n",
        );
        let mut inbound = ConsoleInbound::new(input.as_bytes());
        let first = inbound.next_message().await.unwrap().unwrap();
        assert_eq!(first.text, "hi");
        let second = inbound.next_message().await.unwrap().unwrap();
        assert_eq!(second.marker.as_deref(), Some("m1"));
        assert!(inbound.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_json_lines() {
        let channel = ConsoleChannel::new(Vec::new());
        let thread = ThreadKey::new("C1", "T1");
        channel.send_text(&thread, "hello").await.unwrap();
        channel
            .send_artifact(&thread, &Artifact {
                path: "/w/a.txt".into(),
                filename: "a.txt".into(),
                data: Some(b"hi".to_vec()),
            })
            .await
            .unwrap();

        let out = String::from_utf8(channel.into_inner().await).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0]["type"], "text");
        assert_eq!(lines[0]["text"], "hello");
        assert_eq!(lines[1]["type"], "artifact");
        assert_eq!(lines[1]["data"], "aGk=");
    }

    #[tokio::test]
    async fn history_respects_marker_and_limit() {
        let channel = ConsoleChannel::new(Vec::new());
        let thread = ThreadKey::new("C1", "T1");
        for text in ["one", "two", "three"] {
            channel.record_inbound(&msg("T1", text)).await;
        }
        channel.record_inbound(&msg("T2", "elsewhere")).await;

        let page = channel.fetch(&thread, None, 2).await.unwrap();
        let texts: Vec<_> = page.turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["two", "three"]);

        let since = page.turns[0].marker.clone();
        let page = channel.fetch(&thread, Some(&since), 10).await.unwrap();
        assert_eq!(page.turns.len(), 1);
        assert_eq!(page.cursor.as_deref(), Some(page.turns[0].marker.as_str()));

        let empty = channel
            .fetch(&ThreadKey::new("C9", "T9"), None, 10)
            .await
            .unwrap();
        assert!(empty.turns.is_empty() && empty.cursor.is_none());
    }
}

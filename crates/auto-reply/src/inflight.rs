use std::collections::{HashMap, VecDeque};

use {corral_common::ThreadKey, tokio::sync::Mutex, tracing::debug};

/// One queued follow-up turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUp {
    pub participant: String,
    pub text: String,
}

/// Tracks which threads have an orchestration running.
///
/// Text that arrives for a busy thread is parked on that thread's record and
/// handed back to the running orchestration when its current turn finishes,
/// so a thread never has two orchestrations at once. Follow-ups keep the
/// participant who sent them.
#[derive(Default)]
pub struct InFlight {
    threads: Mutex<HashMap<ThreadKey, VecDeque<FollowUp>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `thread` for `text`. Returns the text back when the caller now
    /// owns the thread, or `None` when it was queued behind a running turn.
    pub async fn try_begin(
        &self,
        thread: &ThreadKey,
        participant: &str,
        text: String,
    ) -> Option<String> {
        let mut threads = self.threads.lock().await;
        match threads.get_mut(thread) {
            Some(queue) => {
                queue.push_back(FollowUp {
                    participant: participant.to_string(),
                    text,
                });
                debug!(thread = %thread, participant, queued = queue.len(), "thread busy; follow-up queued");
                None
            },
            None => {
                threads.insert(thread.clone(), VecDeque::new());
                Some(text)
            },
        }
    }

    /// Called by the owner after each turn. Returns the next follow-up, with
    /// consecutive entries from the same participant joined into one turn,
    /// or `None` after releasing the thread.
    pub async fn finish_or_next(&self, thread: &ThreadKey) -> Option<FollowUp> {
        let mut threads = self.threads.lock().await;
        let queue = threads.get_mut(thread)?;
        let Some(mut next) = queue.pop_front() else {
            threads.remove(thread);
            return None;
        };
        while queue
            .front()
            .is_some_and(|f| f.participant == next.participant)
        {
            if let Some(more) = queue.pop_front() {
                next.text.push_str("\n\n");
                next.text.push_str(&more.text);
            }
        }
        Some(next)
    }

    /// Release `thread` and discard anything queued on it.
    pub async fn abandon(&self, thread: &ThreadKey) -> usize {
        self.threads
            .lock()
            .await
            .remove(thread)
            .map_or(0, |q| q.len())
    }
}

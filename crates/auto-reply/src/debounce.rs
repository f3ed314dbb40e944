//! Coalesce rapid-fire message fragments into one request.
//!
//! A window opens on the first fragment for a key and closes once no new
//! fragment has arrived for the configured quiet period. Every caller that
//! contributed to a window receives the same combined text; the caller that
//! opened the window is its leader and does the downstream work.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    corral_common::{CoalesceKey, ThreadKey},
    thiserror::Error,
    tokio::{
        sync::{Mutex, watch},
        task::AbortHandle,
    },
    tracing::debug,
};

const FRAGMENT_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DebounceError {
    #[error("coalescing window was cancelled")]
    Cancelled,
}

/// Outcome of one [`Debouncer::enqueue`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coalesced {
    pub text: String,
    /// Only the caller that opened the window is the leader.
    pub leader: bool,
}

struct Pending {
    fragments: Vec<String>,
    done: watch::Sender<Option<Arc<str>>>,
    timer: AbortHandle,
    generation: u64,
}

type PendingMap = Arc<Mutex<HashMap<CoalesceKey, Pending>>>;

#[derive(Clone)]
pub struct Debouncer {
    window: Duration,
    pending: PendingMap,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Arc::default(),
        }
    }

    /// Add `fragment` to the window for `key` and wait for the window to
    /// close. Each call restarts the quiet-period timer.
    pub async fn enqueue(
        &self,
        key: CoalesceKey,
        fragment: impl Into<String>,
    ) -> Result<Coalesced, DebounceError> {
        let fragment = fragment.into();
        let (mut rx, leader) = {
            let mut pending = self.pending.lock().await;
            match pending.get_mut(&key) {
                Some(entry) => {
                    entry.fragments.push(fragment);
                    entry.timer.abort();
                    entry.generation += 1;
                    entry.timer = self.spawn_timer(key.clone(), entry.generation);
                    debug!(key = %key, fragments = entry.fragments.len(), "fragment coalesced");
                    (entry.done.subscribe(), false)
                },
                None => {
                    let (done, rx) = watch::channel(None);
                    let timer = self.spawn_timer(key.clone(), 0);
                    debug!(key = %key, "coalescing window opened");
                    pending.insert(key, Pending {
                        fragments: vec![fragment],
                        done,
                        timer,
                        generation: 0,
                    });
                    (rx, true)
                },
            }
        };

        loop {
            if let Some(text) = rx.borrow_and_update().as_deref() {
                return Ok(Coalesced {
                    text: text.to_string(),
                    leader,
                });
            }
            if rx.changed().await.is_err() {
                return Err(DebounceError::Cancelled);
            }
        }
    }

    fn spawn_timer(&self, key: CoalesceKey, generation: u64) -> AbortHandle {
        let pending = Arc::clone(&self.pending);
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut map = pending.lock().await;
            // A newer fragment may have restarted the window while this timer
            // waited for the lock.
            if map.get(&key).map(|p| p.generation) != Some(generation) {
                return;
            }
            let Some(entry) = map.remove(&key) else {
                return;
            };
            drop(map);
            let text = entry.fragments.join(FRAGMENT_SEPARATOR);
            debug!(key = %key, fragments = entry.fragments.len(), "coalescing window closed");
            entry.done.send_replace(Some(Arc::from(text)));
        })
        .abort_handle()
    }

    /// Drop the window for `key` without delivering it. Waiters get
    /// [`DebounceError::Cancelled`]. Returns whether a window was open.
    pub async fn cancel(&self, key: &CoalesceKey) -> bool {
        let removed = self.pending.lock().await.remove(key);
        match removed {
            Some(entry) => {
                entry.timer.abort();
                debug!(key = %key, "coalescing window cancelled");
                true
            },
            None => false,
        }
    }

    /// Cancel every open window in `thread`, whoever the participant.
    pub async fn cancel_thread(&self, thread: &ThreadKey) -> usize {
        let mut map = self.pending.lock().await;
        let keys: Vec<_> = map
            .keys()
            .filter(|k| &k.thread == thread)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(entry) = map.remove(key) {
                entry.timer.abort();
            }
        }
        keys.len()
    }
}

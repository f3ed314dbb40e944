use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    anyhow::Result,
    chrono::{DateTime, Utc},
    corral_common::ThreadKey,
    tokio::sync::{Mutex, Notify},
    tracing::{debug, info, warn},
};

use crate::file::{Session, SessionDocument, SessionFile};

struct StoreInner {
    file: SessionFile,
    sessions: Mutex<BTreeMap<String, Session>>,
    dirty: AtomicBool,
}

impl StoreInner {
    async fn flush(&self) -> Result<()> {
        // Held across the write so two flushes never race each other.
        let sessions = self.sessions.lock().await;
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let doc = SessionDocument {
            sessions: sessions.clone(),
        };
        let result = self.file.save(&doc);
        match &result {
            Ok(()) => debug!(count = doc.sessions.len(), "session store flushed"),
            Err(_) => self.dirty.store(true, Ordering::SeqCst),
        }
        result
    }
}

/// Durable thread → session map with debounced writes.
///
/// Mutations update memory immediately and schedule a save `flush_delay`
/// later; bursts of changes collapse into one write. Call
/// [`SessionStore::flush`] before exit to persist pending changes.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
    wake: Arc<Notify>,
}

impl SessionStore {
    /// Load the store from `path` and start its background flusher.
    pub async fn open(path: impl Into<PathBuf>, flush_delay: Duration) -> Self {
        let file = SessionFile::new(path);
        let doc = file.load();
        info!(path = %file.path().display(), count = doc.sessions.len(), "session store loaded");

        let inner = Arc::new(StoreInner {
            file,
            sessions: Mutex::new(doc.sessions),
            dirty: AtomicBool::new(false),
        });
        let wake = Arc::new(Notify::new());
        tokio::spawn(run_flusher(Arc::downgrade(&inner), Arc::clone(&wake), flush_delay));
        Self { inner, wake }
    }

    fn mark_dirty(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub async fn get(&self, key: &ThreadKey) -> Option<Session> {
        self.inner
            .sessions
            .lock()
            .await
            .get(&key.storage_key())
            .cloned()
    }

    /// Insert or replace the session for `key`. An existing entry keeps its
    /// original `created_at`.
    pub async fn set(&self, key: &ThreadKey, mut session: Session) {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(existing) = sessions.get(&key.storage_key()) {
            session.created_at = existing.created_at;
        }
        sessions.insert(key.storage_key(), session);
        drop(sessions);
        self.mark_dirty();
    }

    /// Point an existing session at a new agent session id. Returns `false`
    /// when there is no session for `key`.
    pub async fn update_session_id(&self, key: &ThreadKey, agent_session_id: &str) -> bool {
        self.modify(key, |s| s.agent_session_id = agent_session_id.to_string())
            .await
    }

    pub async fn update_context_marker(&self, key: &ThreadKey, marker: &str) -> bool {
        self.modify(key, |s| s.last_context_marker = Some(marker.to_string()))
            .await
    }

    async fn modify(&self, key: &ThreadKey, f: impl FnOnce(&mut Session)) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        let Some(session) = sessions.get_mut(&key.storage_key()) else {
            return false;
        };
        f(session);
        session.updated_at = Utc::now();
        drop(sessions);
        self.mark_dirty();
        true
    }

    pub async fn remove(&self, key: &ThreadKey) -> Option<Session> {
        let removed = self
            .inner
            .sessions
            .lock()
            .await
            .remove(&key.storage_key());
        if removed.is_some() {
            self.mark_dirty();
        }
        removed
    }

    /// All sessions, most recently updated first. Entries whose key cannot
    /// be parsed are skipped.
    pub async fn list(&self) -> Vec<(ThreadKey, Session)> {
        let sessions = self.inner.sessions.lock().await;
        let mut out: Vec<_> = sessions
            .iter()
            .filter_map(|(k, s)| ThreadKey::parse_storage_key(k).map(|key| (key, s.clone())))
            .collect();
        out.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at));
        out
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop sessions not updated in the last `max_age_days` days.
    pub async fn cleanup(&self, max_age_days: u32) -> usize {
        let cutoff = chrono::Duration::try_days(i64::from(max_age_days))
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            debug!(max_age_days, "max age reaches past the earliest date; nothing is old enough");
            return 0;
        };
        self.cleanup_older_than(cutoff).await
    }

    /// Drop sessions whose `updated_at` is strictly before `cutoff`.
    pub async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut sessions = self.inner.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.updated_at >= cutoff);
        let removed = before - sessions.len();
        drop(sessions);
        if removed > 0 {
            info!(removed, %cutoff, "expired sessions removed");
            self.mark_dirty();
        }
        removed
    }

    /// Write pending changes now. A failed write stays pending and is
    /// retried by the next flush.
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }
}

async fn run_flusher(store: Weak<StoreInner>, wake: Arc<Notify>, delay: Duration) {
    loop {
        wake.notified().await;
        tokio::time::sleep(delay).await;
        let Some(inner) = store.upgrade() else {
            return;
        };
        if let Err(e) = inner.flush().await {
            warn!(path = %inner.file.path().display(), error = %e, "session flush failed; will retry");
        }
    }
}

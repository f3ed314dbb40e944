use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use {
    anyhow::{Context, Result},
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    tracing::warn,
};

/// Agent-side conversation state for one chat thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub agent_session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_name: Option<String>,
    pub participant: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Cursor into the chat platform's history: turns at or before it have
    /// already been shown to the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_context_marker: Option<String>,
}

impl Session {
    pub fn new(agent_session_id: impl Into<String>, participant: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_session_id: agent_session_id.into(),
            sandbox_name: None,
            participant: participant.into(),
            created_at: now,
            updated_at: now,
            last_context_marker: None,
        }
    }
}

/// On-disk document: `{ "sessions": { "<conversationId>:<threadId>": Session } }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDocument {
    #[serde(default)]
    pub sessions: BTreeMap<String, Session>,
}

/// Reads and atomically rewrites the session document.
#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. A missing file is an empty store; an unreadable or
    /// corrupt one is logged and also treated as empty.
    pub fn load(&self) -> SessionDocument {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SessionDocument::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read session file; starting empty");
                return SessionDocument::default();
            },
        };
        match serde_json::from_str(&data) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt session file; starting empty");
                SessionDocument::default()
            },
        }
    }

    /// Write the document: temp file in the same directory, fsync, rename.
    /// Holds an exclusive lock on `<file>.lock` for the duration.
    pub fn save(&self, doc: &SessionDocument) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sessions.json".into());

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(format!("{file_name}.lock")))?;
        let mut lock = fd_lock::RwLock::new(lock_file);
        let _guard = lock.write().context("locking session file")?;

        let data = serde_json::to_vec_pretty(doc)?;
        let tmp = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));
        if let Err(e) = write_and_rename(&tmp, &data, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("writing {}", self.path.display()));
        }
        Ok(())
    }
}

fn write_and_rename(tmp: &Path, data: &[u8], target: &Path) -> std::io::Result<()> {
    let mut f = create_private(tmp)?;
    f.write_all(data)?;
    f.sync_all()?;
    fs::rename(tmp, target)
}

#[cfg(unix)]
fn create_private(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create_new(true).write(true).open(path)
}

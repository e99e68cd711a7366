//! Active-session identity and persistence.
//!
//! The session id scopes both the transport URL and every REST call. It is
//! read once at startup and written on every change, so a restarted client
//! reattaches to the same server-side conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// A server-side conversation as listed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(alias = "session_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "Utc::now", alias = "updated_at", alias = "updatedAt")]
    pub timestamp: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            timestamp: Utc::now(),
        }
    }

    /// Display title, falling back to the id.
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Storage for the active session id.
pub trait SessionPersistence: Send + Sync {
    fn load(&self) -> Result<Option<String>>;
    fn save(&self, session_id: &str) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSession {
    session_id: String,
    saved_at: DateTime<Utc>,
}

/// Keeps the active session id in a small JSON file.
#[derive(Debug, Clone)]
pub struct FileSessionPersistence {
    path: PathBuf,
}

impl FileSessionPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionPersistence for FileSessionPersistence {
    fn load(&self) -> Result<Option<String>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<PersistedSession>(&content) {
            Ok(persisted) if !persisted.session_id.is_empty() => Ok(Some(persisted.session_id)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(
                    "Ignoring unreadable session state at {}: {}",
                    self.path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    fn save(&self, session_id: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&PersistedSession {
            session_id: session_id.to_string(),
            saved_at: Utc::now(),
        })?;
        std::fs::write(&self.path, content).map_err(|e| {
            SyncError::Persistence(format!("failed to write {}: {}", self.path.display(), e))
        })
    }
}

/// In-process persistence, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySessionPersistence {
    slot: Mutex<Option<String>>,
    failure: Mutex<Option<String>>,
}

impl MemorySessionPersistence {
    pub fn with_session(session_id: &str) -> Self {
        Self {
            slot: Mutex::new(Some(session_id.to_string())),
            failure: Mutex::new(None),
        }
    }

    /// Make every later `save` fail with `reason`, or succeed again with `None`.
    pub fn set_failure(&self, reason: Option<&str>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = reason.map(str::to_string);
        }
    }

    pub fn current(&self) -> Option<String> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }
}

impl SessionPersistence for MemorySessionPersistence {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.current())
    }

    fn save(&self, session_id: &str) -> Result<()> {
        if let Some(reason) = self.failure.lock().ok().and_then(|f| f.clone()) {
            return Err(SyncError::Persistence(reason));
        }
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| SyncError::Persistence("session slot poisoned".into()))?;
        *slot = Some(session_id.to_string());
        Ok(())
    }
}

/// Owns the active session and its generation counter.
///
/// The generation increases on every switch or reset. Work started for an
/// older generation (history fetches in particular) is discarded when it
/// completes.
pub struct SessionStore {
    persistence: Arc<dyn SessionPersistence>,
    active: Session,
    generation: u64,
}

impl SessionStore {
    /// Restore the persisted session, or start and persist a new one.
    pub fn load(persistence: Arc<dyn SessionPersistence>) -> Result<Self> {
        let active = match persistence.load()? {
            Some(id) => {
                info!("Restored session {}", id);
                Session::new(id)
            }
            None => {
                let session = Session::new(new_session_id());
                persistence.save(&session.id)?;
                info!("Started new session {}", session.id);
                session
            }
        };
        Ok(Self {
            persistence,
            active,
            generation: 0,
        })
    }

    pub fn active(&self) -> &Session {
        &self.active
    }

    pub fn active_id(&self) -> &str {
        &self.active.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `(session_id, generation)` still names the active session.
    pub fn is_current(&self, session_id: &str, generation: u64) -> bool {
        self.generation == generation && self.active.id == session_id
    }

    /// Make `session` active. Returns the new generation.
    pub fn activate(&mut self, session: Session) -> Result<u64> {
        self.persistence.save(&session.id)?;
        debug!(from = %self.active.id, to = %session.id, "switching session");
        self.active = session;
        self.generation += 1;
        Ok(self.generation)
    }

    /// Replace the active session with a brand-new one.
    pub fn reset(&mut self, title: Option<String>) -> Result<Session> {
        let mut session = Session::new(new_session_id());
        session.title = title;
        self.activate(session.clone())?;
        Ok(session)
    }

    /// Record a new title if `session_id` is the active session.
    pub fn set_title(&mut self, session_id: &str, title: &str) -> bool {
        if self.active.id == session_id {
            self.active.title = Some(title.to_string());
            true
        } else {
            false
        }
    }
}

//! In-memory transport and backend.
//!
//! Used by the test suites, and handy when embedding the engine somewhere
//! the real backend is not reachable.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::connection::{Connector, Link};
use crate::error::{ConnectError, Result, SyncError};
use crate::history::{BackendApi, SessionHistory};
use crate::session::Session;

const LINK_BUFFER: usize = 64;

/// Server side of one accepted link.
pub struct MemoryLink {
    pub session_id: String,
    /// Frames to deliver to the client.
    pub inbound: mpsc::Sender<String>,
    /// Frames the client sent.
    pub outbound: mpsc::Receiver<String>,
}

/// Receives every link a [`MemoryConnector`] opens.
pub struct MemoryServer {
    links: mpsc::UnboundedReceiver<MemoryLink>,
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<MemoryLink> {
        self.links.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryLink> {
        self.links.try_recv().ok()
    }
}

#[derive(Default)]
struct Failures {
    queued: VecDeque<ConnectError>,
    always: Option<ConnectError>,
}

/// A [`Connector`] whose links terminate in a [`MemoryServer`].
#[derive(Clone)]
pub struct MemoryConnector {
    links: mpsc::UnboundedSender<MemoryLink>,
    failures: Arc<Mutex<Failures>>,
    opens: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryServer) {
        let (links, rx) = mpsc::unbounded_channel();
        let connector = Self {
            links,
            failures: Arc::new(Mutex::new(Failures::default())),
            opens: Arc::new(AtomicUsize::new(0)),
        };
        (connector, MemoryServer { links: rx })
    }

    /// Fail the next open with `err`.
    pub fn fail_next(&self, err: ConnectError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.queued.push_back(err);
        }
    }

    /// Fail every open with `err` until [`MemoryConnector::recover`].
    pub fn fail_always(&self, err: ConnectError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.always = Some(err);
        }
    }

    pub fn recover(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.queued.clear();
            failures.always = None;
        }
    }

    /// Number of open attempts so far, failed ones included.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn next_failure(&self) -> Option<ConnectError> {
        let mut failures = self.failures.lock().ok()?;
        failures
            .queued
            .pop_front()
            .or_else(|| failures.always.clone())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, session_id: &str) -> Result<Link, ConnectError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.next_failure() {
            return Err(err);
        }
        let (out_tx, out_rx) = mpsc::channel(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(LINK_BUFFER);
        self.links
            .send(MemoryLink {
                session_id: session_id.to_string(),
                inbound: in_tx,
                outbound: out_rx,
            })
            .map_err(|_| ConnectError::Unavailable("memory server dropped".into()))?;
        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[derive(Default)]
struct BackendState {
    histories: HashMap<String, SessionHistory>,
    delays: HashMap<String, Duration>,
    sessions: Vec<Session>,
    fetches: Vec<String>,
}

/// A [`BackendApi`] backed by maps. Fetches can be delayed per session.
#[derive(Default, Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

impl MemoryBackend {
    fn with_state<T>(&self, f: impl FnOnce(&mut BackendState) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SyncError::Backend("memory backend poisoned".into()))?;
        Ok(f(&mut state))
    }

    pub fn set_history(&self, session_id: &str, history: SessionHistory) {
        let _ = self.with_state(|s| s.histories.insert(session_id.to_string(), history));
    }

    pub fn set_delay(&self, session_id: &str, delay: Duration) {
        let _ = self.with_state(|s| s.delays.insert(session_id.to_string(), delay));
    }

    pub fn add_session(&self, session: Session) {
        let _ = self.with_state(|s| s.sessions.push(session));
    }

    /// Session ids whose history was requested, in order.
    pub fn fetches(&self) -> Vec<String> {
        self.with_state(|s| s.fetches.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl BackendApi for MemoryBackend {
    async fn fetch_history(&self, session_id: &str) -> Result<SessionHistory> {
        let delay = self.with_state(|s| {
            s.fetches.push(session_id.to_string());
            s.delays.get(session_id).copied()
        })?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with_state(|s| s.histories.get(session_id).cloned().unwrap_or_default())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.with_state(|s| s.sessions.clone())
    }

    async fn rename_session(&self, session_id: &str, title: &str) -> Result<()> {
        self.with_state(|s| {
            match s.sessions.iter_mut().find(|session| session.id == session_id) {
                Some(session) => {
                    session.title = Some(title.to_string());
                    Ok(())
                }
                None => Err(SyncError::SessionNotFound(session_id.to_string())),
            }
        })?
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.with_state(|s| {
            let before = s.sessions.len();
            s.sessions.retain(|session| session.id != session_id);
            s.histories.remove(session_id);
            if s.sessions.len() == before {
                Err(SyncError::SessionNotFound(session_id.to_string()))
            } else {
                Ok(())
            }
        })?
    }
}

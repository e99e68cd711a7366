//! REST side of the backend: session history and session management.
//!
//! History is fetched whenever a session becomes active. Every fetch carries
//! a [`HistoryTicket`]; the engine drops any result whose ticket no longer
//! names the active session, so a slow response for a session the user has
//! already left can never overwrite the current view.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::progress::DeploymentProgress;
use crate::session::Session;
use crate::transcript::ChatMessage;

/// Persisted state of one session, as returned by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHistory {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, alias = "deployment", alias = "deployment_progress")]
    pub deployment_progress: Option<DeploymentProgress>,
}

/// Backend operations that are plain request/response.
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn fetch_history(&self, session_id: &str) -> Result<SessionHistory>;
    async fn list_sessions(&self) -> Result<Vec<Session>>;
    async fn rename_session(&self, session_id: &str, title: &str) -> Result<()>;
    async fn delete_session(&self, session_id: &str) -> Result<()>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SessionList {
    Wrapped { sessions: Vec<Session> },
    Bare(Vec<Session>),
}

/// [`BackendApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SyncError::from_reqwest)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn session_url(&self, session_id: &str) -> String {
        format!("{}/api/sessions/{}", self.base_url, session_id)
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn fetch_history(&self, session_id: &str) -> Result<SessionHistory> {
        let url = format!("{}/history", self.session_url(session_id));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(SyncError::from_reqwest)?;

        // A session the backend has never seen simply has no history yet.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(session_id, "no stored history");
            return Ok(SessionHistory::default());
        }
        let resp = resp.error_for_status().map_err(SyncError::from_reqwest)?;
        resp.json().await.map_err(SyncError::from_reqwest)
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let url = format!("{}/api/sessions", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(SyncError::from_reqwest)?;
        let list: SessionList = resp.json().await.map_err(SyncError::from_reqwest)?;
        Ok(match list {
            SessionList::Wrapped { sessions } => sessions,
            SessionList::Bare(sessions) => sessions,
        })
    }

    async fn rename_session(&self, session_id: &str, title: &str) -> Result<()> {
        let resp = self
            .client
            .patch(self.session_url(session_id))
            .json(&serde_json::json!({ "title": title }))
            .send()
            .await
            .map_err(SyncError::from_reqwest)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SyncError::SessionNotFound(session_id.to_string()));
        }
        resp.error_for_status().map_err(SyncError::from_reqwest)?;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.session_url(session_id))
            .send()
            .await
            .map_err(SyncError::from_reqwest)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SyncError::SessionNotFound(session_id.to_string()));
        }
        resp.error_for_status().map_err(SyncError::from_reqwest)?;
        Ok(())
    }
}

/// Identifies which session activation a fetch belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTicket {
    pub session_id: String,
    pub generation: u64,
}

#[derive(Debug)]
pub struct HistoryResult {
    pub ticket: HistoryTicket,
    pub outcome: Result<SessionHistory>,
}

/// Runs history fetches in the background, one at a time.
///
/// Starting a new fetch cancels the previous one. Results are delivered on
/// the channel given to [`HistorySync::new`].
pub struct HistorySync {
    backend: Arc<dyn BackendApi>,
    results: mpsc::UnboundedSender<HistoryResult>,
    inflight: Option<CancellationToken>,
}

impl HistorySync {
    pub fn new(backend: Arc<dyn BackendApi>, results: mpsc::UnboundedSender<HistoryResult>) -> Self {
        Self {
            backend,
            results,
            inflight: None,
        }
    }

    pub fn request(&mut self, ticket: HistoryTicket) {
        self.cancel();
        let cancel = CancellationToken::new();
        self.inflight = Some(cancel.clone());

        let backend = self.backend.clone();
        let results = self.results.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(session_id = %ticket.session_id, "history fetch cancelled");
                    return;
                }
                outcome = backend.fetch_history(&ticket.session_id) => outcome,
            };
            if let Err(e) = &outcome {
                warn!(session_id = %ticket.session_id, "history fetch failed: {}", e);
            }
            let _ = results.send(HistoryResult { ticket, outcome });
        });
    }

    /// Abandon the in-flight fetch, if any.
    pub fn cancel(&mut self) {
        if let Some(token) = self.inflight.take() {
            token.cancel();
        }
    }
}

impl Drop for HistorySync {
    fn drop(&mut self) {
        self.cancel();
    }
}

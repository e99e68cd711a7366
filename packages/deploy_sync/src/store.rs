//! Client-side state for the active session.
//!
//! [`SyncStore`] owns the transcript, thought buffer, typing flag and
//! deployment aggregator, and publishes a [`StoreChange`] for every mutation.
//! It is synchronous and has no I/O; the router drives it from frames and
//! the engine drives it from user commands and history results.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::history::SessionHistory;
use crate::progress::{DeploymentProgress, DeploymentProgressAggregator, StartOutcome};
use crate::protocol::{AssistantMessage, DeploymentReport, DeploymentStart, StageUpdate};
use crate::transcript::{ChatMessage, ChatTranscript, ThoughtBuffer};

const CHANGE_CAPACITY: usize = 256;

/// What changed in the store. Observers re-read the snapshot for details.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    /// A message was appended or patched.
    Transcript { message_id: String },
    /// The transcript was replaced (session switch or history merge).
    TranscriptReloaded,
    Thoughts,
    Typing(bool),
    Deployment,
    /// The active session changed.
    Session { session_id: String },
    /// An informational notice for the user. Never stored in the transcript.
    Notice(String),
}

/// Point-in-time copy of the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub session_id: String,
    pub messages: Vec<ChatMessage>,
    pub thoughts: Vec<String>,
    pub typing: bool,
    pub deployment: Option<DeploymentProgress>,
}

pub struct SyncStore {
    session_id: String,
    transcript: ChatTranscript,
    thoughts: ThoughtBuffer,
    typing: bool,
    deployment: DeploymentProgressAggregator,
    changes: broadcast::Sender<StoreChange>,
}

impl SyncStore {
    pub fn new(session_id: &str, deployment: DeploymentProgressAggregator) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            session_id: session_id.to_string(),
            transcript: ChatTranscript::default(),
            thoughts: ThoughtBuffer::default(),
            typing: false,
            deployment,
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub fn change_sender(&self) -> broadcast::Sender<StoreChange> {
        self.changes.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn transcript(&self) -> &ChatTranscript {
        &self.transcript
    }

    pub fn thoughts(&self) -> &ThoughtBuffer {
        &self.thoughts
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }

    pub fn deployment(&self) -> Option<&DeploymentProgress> {
        self.deployment.progress()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            session_id: self.session_id.clone(),
            messages: self.transcript.messages().to_vec(),
            thoughts: self.thoughts.fragments().to_vec(),
            typing: self.typing,
            deployment: self.deployment.progress().cloned(),
        }
    }

    fn emit(&self, change: StoreChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    fn set_typing(&mut self, typing: bool) {
        if self.typing != typing {
            self.typing = typing;
            self.emit(StoreChange::Typing(typing));
        }
    }

    fn append(&mut self, message: ChatMessage) {
        let id = message.id.clone();
        if self.transcript.append(message) {
            self.emit(StoreChange::Transcript { message_id: id });
        }
    }

    // --- inbound events ---

    pub fn on_typing(&mut self) {
        self.thoughts.clear();
        self.emit(StoreChange::Thoughts);
        self.set_typing(true);
    }

    pub fn on_thought(&mut self, content: &str) {
        self.thoughts.push(content);
        self.emit(StoreChange::Thoughts);
    }

    pub fn on_progress(&mut self, content: &str) {
        let thoughts = self.thoughts.take();
        if thoughts.is_some() {
            self.emit(StoreChange::Thoughts);
        }
        let id = self.transcript.upsert_progress(content, thoughts);
        self.emit(StoreChange::Transcript { message_id: id });
    }

    pub fn on_message(&mut self, message: AssistantMessage) {
        let mut entry = ChatMessage::assistant(message.content);
        entry.actions = message.actions;
        entry.metadata = message.metadata;
        entry.data = message.data;
        entry.thoughts = self.thoughts.take();
        if entry.thoughts.is_some() {
            self.emit(StoreChange::Thoughts);
        }
        self.set_typing(false);
        self.append(entry);
    }

    pub fn on_error(&mut self, message: &str) {
        self.set_typing(false);
        self.append(ChatMessage::assistant(message).with_meta("type", "error"));
    }

    pub fn on_deployment_started(&mut self, start: &DeploymentStart, explicit_resume: bool) {
        let outcome = self.deployment.start(start, explicit_resume);
        if outcome == StartOutcome::Merged {
            debug!(deployment_id = %start.deployment_id, "merged into existing progress");
        }
        self.emit(StoreChange::Deployment);
    }

    pub fn on_deployment_progress(&mut self, update: &StageUpdate) {
        if self.deployment.apply_update(update) {
            self.emit(StoreChange::Deployment);
        }
    }

    pub fn on_deployment_complete(&mut self, report: &DeploymentReport) {
        if self.deployment.complete(report) {
            self.emit(StoreChange::Deployment);
        }
        let succeeded = report.succeeded();
        let content = match (&report.message, report.url()) {
            (Some(message), _) => message.clone(),
            (None, Some(url)) if succeeded => {
                format!("Deployment successful! Your service is live at {}", url)
            }
            (None, _) if succeeded => "Deployment successful!".to_string(),
            (None, _) => format!(
                "Deployment failed: {}",
                report.error.as_deref().unwrap_or("unknown error")
            ),
        };
        let status = if succeeded { "success" } else { "failed" };
        let mut entry = ChatMessage::assistant(content)
            .with_meta("type", "deployment_complete")
            .with_meta("status", status);
        entry.deployment_url = report.url().map(str::to_string);
        self.set_typing(false);
        self.append(entry);
    }

    // --- local actions ---

    /// Record a message the user sent. Undelivered messages are kept but
    /// flagged.
    pub fn push_user_message(&mut self, text: &str, delivered: bool) -> String {
        let mut message = ChatMessage::user(text);
        if !delivered {
            message = message.with_meta("delivered", false);
        }
        let id = message.id.clone();
        self.append(message);
        id
    }

    pub fn notify(&self, notice: impl Into<String>) {
        self.emit(StoreChange::Notice(notice.into()));
    }

    /// Drop everything and start over for `session_id`.
    pub fn reset_for_session(&mut self, session_id: &str) {
        self.session_id = session_id.to_string();
        self.transcript.clear();
        self.thoughts.clear();
        self.typing = false;
        self.deployment.reset();
        self.emit(StoreChange::Session {
            session_id: session_id.to_string(),
        });
        self.emit(StoreChange::TranscriptReloaded);
        self.emit(StoreChange::Deployment);
    }

    /// Fold fetched history into the live state.
    pub fn apply_history(&mut self, history: SessionHistory) {
        let restored = self.transcript.merge_history(history.messages);
        let had_deployment = history.deployment_progress.is_some();
        if let Some(snapshot) = history.deployment_progress {
            self.deployment.restore(snapshot);
        }
        info!(
            session_id = %self.session_id,
            messages = restored,
            deployment = had_deployment,
            "history applied"
        );
        self.emit(StoreChange::TranscriptReloaded);
        if had_deployment {
            self.emit(StoreChange::Deployment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::DeploymentStatus;
    use crate::protocol::StageStatus;
    use crate::transcript::Role;

    fn store() -> SyncStore {
        SyncStore::new("s-1", DeploymentProgressAggregator::default())
    }

    fn drain(rx: &mut broadcast::Receiver<StoreChange>) -> Vec<StoreChange> {
        let mut out = Vec::new();
        while let Ok(change) = rx.try_recv() {
            out.push(change);
        }
        out
    }

    #[test]
    fn thoughts_attach_to_next_message() {
        let mut store = store();
        store.on_typing();
        store.on_thought("reading package.json");
        store.on_thought("found express");
        store.on_message(AssistantMessage {
            content: "It's a Node app.".into(),
            actions: None,
            metadata: None,
            data: None,
        });

        let last = store.transcript().last().unwrap();
        assert_eq!(last.thoughts.as_ref().unwrap().len(), 2);
        assert!(store.thoughts().is_empty());
        assert!(!store.is_typing());
    }

    #[test]
    fn typing_clears_stale_thoughts() {
        let mut store = store();
        store.on_thought("left over");
        store.on_typing();
        assert!(store.thoughts().is_empty());
        assert!(store.is_typing());
    }

    #[test]
    fn progress_flushes_thoughts_into_status_line() {
        let mut store = store();
        store.on_thought("checking Dockerfile");
        store.on_progress("Generating Dockerfile...");
        let last = store.transcript().last().unwrap();
        assert!(last.is_progress_cursor());
        assert_eq!(last.thoughts.as_ref().unwrap()[0], "checking Dockerfile");
    }

    #[test]
    fn undelivered_user_message_is_flagged() {
        let mut store = store();
        store.push_user_message("hello", false);
        let last = store.transcript().last().unwrap();
        assert_eq!(last.role, Role::User);
        assert_eq!(
            last.metadata.as_ref().unwrap().get("delivered"),
            Some(&serde_json::Value::Bool(false))
        );

        store.push_user_message("again", true);
        assert!(store.transcript().last().unwrap().metadata.is_none());
    }

    #[test]
    fn completion_appends_summary_message() {
        let mut store = store();
        store.on_deployment_started(
            &DeploymentStart {
                deployment_id: "d-1".into(),
                resume_stage: None,
                resume_progress: None,
            },
            false,
        );
        store.on_deployment_complete(&DeploymentReport {
            url: Some("https://app.example.com".into()),
            ..Default::default()
        });

        let deployment = store.deployment().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Success);
        let last = store.transcript().last().unwrap();
        assert_eq!(last.metadata_type(), Some("deployment_complete"));
        assert_eq!(last.deployment_url.as_deref(), Some("https://app.example.com"));
        assert!(last.content.contains("https://app.example.com"));
    }

    #[test]
    fn error_event_becomes_error_message() {
        let mut store = store();
        store.on_typing();
        store.on_error("Repository not found");
        let last = store.transcript().last().unwrap();
        assert_eq!(last.metadata_type(), Some("error"));
        assert!(!store.is_typing());
    }

    #[test]
    fn reset_clears_everything() {
        let mut store = store();
        store.on_deployment_started(
            &DeploymentStart {
                deployment_id: "d-1".into(),
                resume_stage: None,
                resume_progress: None,
            },
            false,
        );
        store.on_deployment_progress(&StageUpdate {
            stage: "build".into(),
            status: StageStatus::InProgress,
            message: None,
            details: vec![],
        });
        store.push_user_message("hi", true);
        let mut rx = store.subscribe();

        store.reset_for_session("s-2");

        let snap = store.snapshot();
        assert_eq!(snap.session_id, "s-2");
        assert!(snap.messages.is_empty());
        assert!(snap.deployment.is_none());
        assert!(drain(&mut rx).contains(&StoreChange::Session {
            session_id: "s-2".into()
        }));
    }

    #[test]
    fn notices_stay_out_of_transcript() {
        let store = store();
        let mut rx = store.subscribe();
        store.notify("Session reset");
        assert!(store.transcript().is_empty());
        assert_eq!(
            drain(&mut rx),
            vec![StoreChange::Notice("Session reset".into())]
        );
    }
}

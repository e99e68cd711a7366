//! Chat transcript and thought buffering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use uuid::Uuid;

use crate::protocol::Action;

/// Metadata `type` carried by the collapsing status line.
pub const PROGRESS_METADATA_TYPE: &str = "progress";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Whether a message is a normal entry or the mutable status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    #[default]
    Standard,
    ProgressCursor,
}

impl MessageKind {
    fn is_standard(&self) -> bool {
        *self == Self::Standard
    }
}

/// Ids are UUIDv7, so generation order matches insertion order.
pub fn new_message_id() -> String {
    Uuid::now_v7().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default = "new_message_id")]
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "MessageKind::is_standard")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<Action>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_url: Option<String>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            kind: MessageKind::Standard,
            actions: None,
            metadata: None,
            data: None,
            thoughts: None,
            deployment_url: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Set one metadata key, creating the map if needed.
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn metadata_type(&self) -> Option<&str> {
        self.metadata.as_ref()?.get("type")?.as_str()
    }

    pub fn is_progress_cursor(&self) -> bool {
        self.kind == MessageKind::ProgressCursor
    }
}

/// Reasoning fragments streamed during the current turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThoughtBuffer {
    fragments: Vec<String>,
}

impl ThoughtBuffer {
    pub fn push(&mut self, fragment: impl Into<String>) {
        self.fragments.push(fragment.into());
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
    }

    /// Drain the buffer, yielding `None` when nothing was streamed.
    pub fn take(&mut self) -> Option<Vec<String>> {
        if self.fragments.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.fragments))
        }
    }

    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

/// Ordered message log for one session.
///
/// The progress cursor is the id of the status line currently being
/// rewritten in place. Any other append closes it, so the next `progress`
/// event starts a new status line below the newer messages.
#[derive(Debug, Clone, Default)]
pub struct ChatTranscript {
    messages: Vec<ChatMessage>,
    cursor: Option<String>,
}

impl ChatTranscript {
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn get(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Append a message. A message whose id is already present is dropped
    /// and `false` is returned.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.cursor = message.is_progress_cursor().then(|| message.id.clone());
        self.messages.push(message);
        true
    }

    /// Patch the most recent message matching `predicate`.
    pub fn update_last<P, F>(&mut self, predicate: P, patch: F) -> bool
    where
        P: Fn(&ChatMessage) -> bool,
        F: FnOnce(&mut ChatMessage),
    {
        match self.messages.iter_mut().rev().find(|m| predicate(m)) {
            Some(message) => {
                patch(message);
                true
            }
            None => false,
        }
    }

    /// Rewrite the open status line, or start one. Returns the id of the
    /// status line.
    pub fn upsert_progress(&mut self, content: &str, thoughts: Option<Vec<String>>) -> String {
        if let Some(id) = self.cursor.clone() {
            let updated = self.update_last(
                |m| m.id == id,
                |m| {
                    m.content = content.to_string();
                    m.timestamp = Utc::now();
                    if let Some(new) = thoughts.clone() {
                        m.thoughts.get_or_insert_with(Vec::new).extend(new);
                    }
                },
            );
            if updated {
                return id;
            }
        }

        let mut message =
            ChatMessage::assistant(content).with_meta("type", PROGRESS_METADATA_TYPE);
        message.kind = MessageKind::ProgressCursor;
        message.thoughts = thoughts;
        let id = message.id.clone();
        self.append(message);
        id
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.cursor = None;
    }

    /// Fold in rehydrated history. History comes first; anything recorded
    /// live while the fetch was in flight is kept after it.
    pub fn merge_history(&mut self, history: Vec<ChatMessage>) -> usize {
        let mut seen = HashSet::new();
        let mut merged = Vec::with_capacity(history.len() + self.messages.len());
        for mut message in history {
            if seen.insert(message.id.clone()) {
                // A restored status line is history, not a live cursor.
                message.kind = MessageKind::Standard;
                merged.push(message);
            }
        }
        let restored = merged.len();
        for message in self.messages.drain(..) {
            if seen.insert(message.id.clone()) {
                merged.push(message);
            }
        }
        self.messages = merged;
        if let Some(id) = &self.cursor {
            if self.messages.last().map(|m| &m.id) != Some(id) {
                self.cursor = None;
            }
        }
        restored
    }
}

//! Wire Protocol Types
//!
//! Message types for the client-server conversation over the single
//! persistent connection. Inbound frames are validated against the known
//! `type` tags before being decoded, so a protocol addition on the server
//! never takes the client down.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::ProtocolError;

/// Every inbound `type` tag this client understands.
pub const KNOWN_EVENT_TYPES: &[&str] = &[
    "typing",
    "thought",
    "progress",
    "deployment_started",
    "deployment_resumed",
    "deployment_progress",
    "deployment_complete",
    "message",
    "error",
];

/// Messages sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// The assistant started a new turn
    Typing {},
    /// One streamed reasoning fragment for the current turn
    Thought { content: String },
    /// Transient status line, collapsed into one transcript entry
    Progress { content: String },
    /// A deployment run started (or restarted after a reconnect)
    DeploymentStarted(DeploymentStart),
    /// Explicit re-attachment to a run that is already underway
    DeploymentResumed(DeploymentStart),
    /// One stage of the current run changed
    DeploymentProgress(StageUpdate),
    /// The run finished, successfully or not
    DeploymentComplete(DeploymentReport),
    /// A complete assistant message; terminates the current turn
    Message(AssistantMessage),
    /// Server-side application error
    Error { message: String },
}

impl ServerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Typing {} => "typing",
            Self::Thought { .. } => "thought",
            Self::Progress { .. } => "progress",
            Self::DeploymentStarted(_) => "deployment_started",
            Self::DeploymentResumed(_) => "deployment_resumed",
            Self::DeploymentProgress(_) => "deployment_progress",
            Self::DeploymentComplete(_) => "deployment_complete",
            Self::Message(_) => "message",
            Self::Error { .. } => "error",
        }
    }
}

/// Payload of `deployment_started` / `deployment_resumed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStart {
    pub deployment_id: String,
    /// Stage the server is resuming from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_stage: Option<String>,
    /// Overall percentage the server had reached before resuming
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_progress: Option<f64>,
}

/// Payload of `deployment_progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageUpdate {
    pub stage: String,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Log lines; a bare string is accepted as a single line
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub details: Vec<String>,
}

/// Per-stage lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in-progress", alias = "in_progress", alias = "running")]
    InProgress,
    #[serde(rename = "success", alias = "completed", alias = "done")]
    Success,
    #[serde(rename = "error", alias = "failed")]
    Error,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// Position in the stage lifecycle; a stage never moves backwards.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Success | Self::Error => 2,
        }
    }
}

/// Payload of `deployment_complete`. The backend has sent the outcome in
/// several redundant shapes over time; [`DeploymentReport::succeeded`]
/// picks one canonical answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeploymentReport {
    /// Outcome of the run: the `status` field wins, then the `success`
    /// flag, then "a URL and no error".
    pub fn succeeded(&self) -> bool {
        if let Some(status) = self.status.as_deref() {
            match status.to_ascii_lowercase().as_str() {
                "success" | "succeeded" | "completed" | "deployed" => return true,
                "failed" | "failure" | "error" => return false,
                _ => {}
            }
        }
        if let Some(success) = self.success {
            return success;
        }
        self.url().is_some() && self.error.is_none()
    }

    pub fn url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .or(self.deployment_url.as_deref())
            .filter(|u| !u.is_empty())
    }
}

/// A quick-reply action attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of `message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<Action>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Validate a raw text frame and decode it.
///
/// The `type` tag is checked against [`KNOWN_EVENT_TYPES`] before the
/// payload is decoded, so unknown tags and malformed known payloads are
/// reported separately.
pub fn parse_server_event(raw: &str) -> Result<ServerEvent, ProtocolError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::NotJson(e.to_string()))?;
    let event_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();
    if !KNOWN_EVENT_TYPES.contains(&event_type.as_str()) {
        return Err(ProtocolError::UnknownType(event_type));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
        event_type,
        reason: e.to_string(),
    })
}

/// Messages sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Message {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Map<String, Value>>,
    },
}

impl ClientMessage {
    pub fn chat(message: impl Into<String>, context: Option<Map<String, Value>>) -> Self {
        Self::Message {
            message: message.into(),
            context,
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Non-chat intents. These travel inside an ordinary `message` envelope
/// with the command itself JSON-encoded as the message text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StructuredCommand {
    /// Upload environment variables for the pending deployment
    EnvVars { variables: BTreeMap<String, String> },
    /// Abort the running deployment
    Abort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deployment_id: Option<String>,
    },
}

impl StructuredCommand {
    pub fn to_client_message(&self) -> Result<ClientMessage, serde_json::Error> {
        Ok(ClientMessage::chat(serde_json::to_string(self)?, None))
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(line) => vec![line],
        OneOrMany::Many(lines) => lines,
        OneOrMany::Null(()) => Vec::new(),
    })
}

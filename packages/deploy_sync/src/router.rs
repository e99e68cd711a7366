//! Inbound frame dispatch.
//!
//! Every frame is validated, decoded and handed to exactly one store
//! handler. Invalid frames are logged and dropped; they never change state.

use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::protocol::{ServerEvent, parse_server_event};
use crate::store::SyncStore;

/// Decode `raw` and apply it to `store`. Returns the handled event type.
pub fn dispatch(store: &mut SyncStore, raw: &str) -> Result<&'static str, ProtocolError> {
    let event = match parse_server_event(raw) {
        Ok(event) => event,
        Err(e) => {
            match &e {
                ProtocolError::UnknownType(t) => warn!(event_type = %t, "ignoring unknown event"),
                other => warn!(code = other.error_code(), "dropping invalid frame: {}", other),
            }
            return Err(e);
        }
    };
    let event_type = event.event_type();
    debug!(event_type, session_id = %store.session_id(), "dispatching event");
    apply(store, event);
    Ok(event_type)
}

/// Apply an already-decoded event.
pub fn apply(store: &mut SyncStore, event: ServerEvent) {
    match event {
        ServerEvent::Typing {} => store.on_typing(),
        ServerEvent::Thought { content } => store.on_thought(&content),
        ServerEvent::Progress { content } => store.on_progress(&content),
        ServerEvent::DeploymentStarted(start) => store.on_deployment_started(&start, false),
        ServerEvent::DeploymentResumed(start) => store.on_deployment_started(&start, true),
        ServerEvent::DeploymentProgress(update) => store.on_deployment_progress(&update),
        ServerEvent::DeploymentComplete(report) => store.on_deployment_complete(&report),
        ServerEvent::Message(message) => store.on_message(message),
        ServerEvent::Error { message } => store.on_error(&message),
    }
}

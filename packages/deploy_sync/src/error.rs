//! Error types for the sync engine.

use tokio_tungstenite::tungstenite;

/// Errors raised while validating an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not a JSON object: {0}")]
    NotJson(String),

    #[error("frame has no `type` tag")]
    MissingType,

    #[error("unknown event type `{0}`")]
    UnknownType(String),

    #[error("malformed `{event_type}` payload: {reason}")]
    Malformed { event_type: String, reason: String },
}

impl ProtocolError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotJson(_) => "not_json",
            Self::MissingType => "missing_type",
            Self::UnknownType(_) => "unknown_type",
            Self::Malformed { .. } => "malformed_payload",
        }
    }
}

/// Errors raised while opening a connection to the backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    /// The backend could not be reached. Retried with backoff.
    #[error("backend is unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the handshake. Never retried.
    #[error("backend rejected the connection: {0}")]
    Rejected(String),
}

impl ConnectError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Classify a WebSocket handshake failure. HTTP-level refusals (4xx)
    /// are fatal; everything else is treated as a transient outage.
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Http(response) if response.status().is_client_error() => {
                Self::Rejected(format!("handshake refused with {}", response.status()))
            }
            tungstenite::Error::Url(_) => Self::Rejected(err.to_string()),
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

/// Top-level error for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("backend request failed: {0}")]
    Backend(String),

    #[error("session `{0}` not found")]
    SessionNotFound(String),

    #[error("session persistence failed: {0}")]
    Persistence(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sync engine has shut down")]
    EngineGone,
}

impl SyncError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Connect(ConnectError::Unavailable(_)) => "backend_unavailable",
            Self::Connect(ConnectError::Rejected(_)) => "connection_rejected",
            Self::Protocol(e) => e.error_code(),
            Self::Backend(_) => "backend_error",
            Self::SessionNotFound(_) => "session_not_found",
            Self::Persistence(_) => "persistence_error",
            Self::Config(_) => "config_error",
            Self::Serialization(_) => "serialization_error",
            Self::EngineGone => "engine_gone",
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Connect(ConnectError::Unavailable(err.to_string()))
        } else if err.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            Self::Backend(format!("not found: {}", err))
        } else {
            Self::Backend(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Persistence(err.to_string())
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(ProtocolError::MissingType.error_code(), "missing_type");
        assert_eq!(
            SyncError::from(ConnectError::Rejected("nope".into())).error_code(),
            "connection_rejected"
        );
        assert_eq!(
            SyncError::from(ProtocolError::UnknownType("x".into())).error_code(),
            "unknown_type"
        );
        assert_eq!(SyncError::EngineGone.error_code(), "engine_gone");
    }

    #[test]
    fn connect_error_fatality() {
        assert!(ConnectError::Rejected("bad session".into()).is_fatal());
        assert!(!ConnectError::Unavailable("refused".into()).is_fatal());
    }

    #[test]
    fn tungstenite_io_errors_are_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = ConnectError::from_tungstenite(tungstenite::Error::Io(io));
        assert!(matches!(err, ConnectError::Unavailable(_)));
    }

    #[test]
    fn transparent_connect_display() {
        let err = SyncError::from(ConnectError::Unavailable("down".into()));
        assert_eq!(err.to_string(), "backend is unavailable: down");
    }

    #[test]
    fn io_error_maps_to_persistence() {
        let err: SyncError = std::io::Error::other("disk full").into();
        assert!(matches!(err, SyncError::Persistence(_)));
    }
}

//! Real-time session and deployment-progress synchronization for a
//! conversational deployment assistant.

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod history;
pub mod memory;
pub mod progress;
pub mod protocol;
pub mod router;
pub mod session;
pub mod store;
pub mod transcript;

pub use config::{SyncConfig, SyncPaths};
pub use connection::ws::WsConnector;
pub use connection::{BackoffPolicy, ConnectionManager, ConnectionState, Connector};
pub use engine::{EngineOptions, SyncEngine, SyncHandle};
pub use error::{ConnectError, ProtocolError, SyncError};
pub use history::{BackendApi, HttpBackend, SessionHistory};
pub use progress::{DeploymentProgress, DeploymentProgressAggregator, DeploymentStatus, Stage};
pub use protocol::{ServerEvent, StageStatus, StructuredCommand};
pub use session::{FileSessionPersistence, Session, SessionPersistence, SessionStore};
pub use store::{StoreChange, SyncSnapshot, SyncStore};
pub use transcript::{ChatMessage, ChatTranscript, Role};

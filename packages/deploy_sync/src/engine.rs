//! The sync engine actor.
//!
//! One task owns every piece of mutable state: the active session, the
//! store, the connection manager and the history fetcher. Inbound frames,
//! history results and user commands are all processed on that task, one at
//! a time, so no handler ever observes a half-applied session switch.
//! [`SyncHandle`] is the cloneable front door.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::connection::{BackoffPolicy, ConnectionManager, ConnectionState, Connector, Frame};
use crate::error::{Result, SyncError};
use crate::history::{BackendApi, HistoryResult, HistorySync, HistoryTicket};
use crate::progress::{DeploymentProgressAggregator, ProgressConfig, StageCatalog};
use crate::protocol::{ClientMessage, StructuredCommand};
use crate::router;
use crate::session::{Session, SessionPersistence, SessionStore};
use crate::store::{StoreChange, SyncSnapshot, SyncStore};

const COMMAND_BUFFER: usize = 32;

/// Engine tunables.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub backoff: BackoffPolicy,
    pub catalog: StageCatalog,
    pub progress: ProgressConfig,
}

/// Commands accepted by the engine actor.
#[derive(Debug)]
pub enum EngineCommand {
    Connect {
        respond_to: oneshot::Sender<()>,
    },
    Disconnect {
        respond_to: oneshot::Sender<()>,
    },
    SendChat {
        text: String,
        context: Option<serde_json::Map<String, serde_json::Value>>,
        respond_to: oneshot::Sender<bool>,
    },
    SendCommand {
        command: StructuredCommand,
        respond_to: oneshot::Sender<Result<bool>>,
    },
    SwitchSession {
        session_id: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    ResetSession {
        respond_to: oneshot::Sender<Result<Session>>,
    },
    CreateSession {
        title: Option<String>,
        respond_to: oneshot::Sender<Result<Session>>,
    },
    RenameSession {
        session_id: String,
        title: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    DeleteSession {
        session_id: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    ListSessions {
        respond_to: oneshot::Sender<Result<Vec<Session>>>,
    },
    ActiveSession {
        respond_to: oneshot::Sender<Session>,
    },
    Snapshot {
        respond_to: oneshot::Sender<SyncSnapshot>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Completions of backend calls that must be applied on the actor task.
enum Internal {
    Renamed {
        session_id: String,
        title: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Deleted {
        session_id: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct SyncHandle {
    sender: mpsc::Sender<EngineCommand>,
    changes: broadcast::Sender<StoreChange>,
    connection: watch::Receiver<ConnectionState>,
}

impl SyncHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| SyncError::EngineGone)?;
        rx.await.map_err(|_| SyncError::EngineGone)
    }

    /// Open the connection for the active session.
    pub async fn connect(&self) -> Result<()> {
        self.call(|respond_to| EngineCommand::Connect { respond_to })
            .await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.call(|respond_to| EngineCommand::Disconnect { respond_to })
            .await
    }

    /// Send a chat message. The message is recorded in the transcript either
    /// way; `Ok(false)` means it was not delivered.
    pub async fn send_chat(
        &self,
        text: &str,
        context: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<bool> {
        self.call(|respond_to| EngineCommand::SendChat {
            text: text.to_string(),
            context,
            respond_to,
        })
        .await
    }

    /// Send a structured command. Not recorded in the transcript.
    pub async fn send_command(&self, command: StructuredCommand) -> Result<bool> {
        self.call(|respond_to| EngineCommand::SendCommand {
            command,
            respond_to,
        })
        .await?
    }

    pub async fn switch_session(&self, session_id: &str) -> Result<()> {
        self.call(|respond_to| EngineCommand::SwitchSession {
            session_id: session_id.to_string(),
            respond_to,
        })
        .await?
    }

    /// Abandon the active session and start a new one.
    pub async fn reset_session(&self) -> Result<Session> {
        self.call(|respond_to| EngineCommand::ResetSession { respond_to })
            .await?
    }

    pub async fn create_session(&self, title: Option<String>) -> Result<Session> {
        self.call(|respond_to| EngineCommand::CreateSession { title, respond_to })
            .await?
    }

    pub async fn rename_session(&self, session_id: &str, title: &str) -> Result<()> {
        self.call(|respond_to| EngineCommand::RenameSession {
            session_id: session_id.to_string(),
            title: title.to_string(),
            respond_to,
        })
        .await?
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.call(|respond_to| EngineCommand::DeleteSession {
            session_id: session_id.to_string(),
            respond_to,
        })
        .await?
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.call(|respond_to| EngineCommand::ListSessions { respond_to })
            .await?
    }

    pub async fn active_session(&self) -> Result<Session> {
        self.call(|respond_to| EngineCommand::ActiveSession { respond_to })
            .await
    }

    pub async fn snapshot(&self) -> Result<SyncSnapshot> {
        self.call(|respond_to| EngineCommand::Snapshot { respond_to })
            .await
    }

    /// Store change notifications. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.call(|respond_to| EngineCommand::Shutdown { respond_to })
            .await
    }
}

pub struct SyncEngine {
    sessions: SessionStore,
    store: SyncStore,
    connection: ConnectionManager,
    history: HistorySync,
    backend: Arc<dyn BackendApi>,
    commands: mpsc::Receiver<EngineCommand>,
    frames: mpsc::UnboundedReceiver<Frame>,
    history_results: mpsc::UnboundedReceiver<HistoryResult>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl SyncEngine {
    /// Restore the active session, start the actor and fetch that session's
    /// history. Must be called from within a Tokio runtime.
    pub fn spawn(
        options: EngineOptions,
        connector: Arc<dyn Connector>,
        backend: Arc<dyn BackendApi>,
        persistence: Arc<dyn SessionPersistence>,
    ) -> Result<SyncHandle> {
        Self::spawn_subscribed(options, connector, backend, persistence).map(|(handle, _)| handle)
    }

    /// Like [`SyncEngine::spawn`], also returning a change receiver that
    /// was subscribed before the actor started, so it sees the result of
    /// the initial history fetch.
    pub fn spawn_subscribed(
        options: EngineOptions,
        connector: Arc<dyn Connector>,
        backend: Arc<dyn BackendApi>,
        persistence: Arc<dyn SessionPersistence>,
    ) -> Result<(SyncHandle, broadcast::Receiver<StoreChange>)> {
        let sessions = SessionStore::load(persistence)?;
        let store = SyncStore::new(
            sessions.active_id(),
            DeploymentProgressAggregator::new(options.catalog, options.progress),
        );

        let (frames_tx, frames) = mpsc::unbounded_channel();
        let connection = ConnectionManager::new(connector, options.backoff, frames_tx);
        let (history_tx, history_results) = mpsc::unbounded_channel();
        let history = HistorySync::new(backend.clone(), history_tx);
        let (sender, commands) = mpsc::channel(COMMAND_BUFFER);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let handle = SyncHandle {
            sender,
            changes: store.change_sender(),
            connection: connection.subscribe(),
        };

        let engine = SyncEngine {
            sessions,
            store,
            connection,
            history,
            backend,
            commands,
            frames,
            history_results,
            internal_tx,
            internal_rx,
        };
        let changes = handle.subscribe();
        tokio::spawn(engine.run());
        Ok((handle, changes))
    }

    async fn run(mut self) {
        info!(session_id = %self.sessions.active_id(), "sync engine started");
        self.request_history();

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => {
                        debug!("all handles dropped");
                        self.connection.disconnect().await;
                        break;
                    }
                },
                Some(frame) = self.frames.recv() => self.handle_frame(frame),
                Some(result) = self.history_results.recv() => self.handle_history(result),
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal).await,
            }
        }
        self.history.cancel();
        info!("sync engine stopped");
    }

    /// Returns false when the actor should stop.
    async fn handle_command(&mut self, cmd: EngineCommand) -> bool {
        match cmd {
            EngineCommand::Connect { respond_to } => {
                self.connection.connect(self.sessions.active_id()).await;
                let _ = respond_to.send(());
            }

            EngineCommand::Disconnect { respond_to } => {
                self.connection.disconnect().await;
                let _ = respond_to.send(());
            }

            EngineCommand::SendChat {
                text,
                context,
                respond_to,
            } => {
                let delivered = match ClientMessage::chat(text.as_str(), context).to_frame() {
                    Ok(frame) => self.connection.send(frame).await,
                    Err(e) => {
                        warn!("failed to encode chat message: {}", e);
                        false
                    }
                };
                if !delivered {
                    debug!("chat message not delivered, recording locally");
                }
                self.store.push_user_message(&text, delivered);
                let _ = respond_to.send(delivered);
            }

            EngineCommand::SendCommand {
                command,
                respond_to,
            } => {
                let result = command
                    .to_client_message()
                    .and_then(|msg| msg.to_frame())
                    .map_err(SyncError::from);
                let result = match result {
                    Ok(frame) => Ok(self.connection.send(frame).await),
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            EngineCommand::SwitchSession {
                session_id,
                respond_to,
            } => {
                let result = if session_id == self.sessions.active_id() {
                    debug!(session_id, "already active");
                    Ok(())
                } else {
                    self.activate(Session::new(session_id)).await
                };
                let _ = respond_to.send(result);
            }

            EngineCommand::ResetSession { respond_to } => {
                let result = self.start_new_session(None).await;
                if result.is_ok() {
                    self.store.notify("Session reset. Starting a new conversation.");
                }
                let _ = respond_to.send(result);
            }

            EngineCommand::CreateSession { title, respond_to } => {
                let _ = respond_to.send(self.start_new_session(title).await);
            }

            EngineCommand::RenameSession {
                session_id,
                title,
                respond_to,
            } => {
                let backend = self.backend.clone();
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    match backend.rename_session(&session_id, &title).await {
                        Ok(()) => {
                            let _ = internal.send(Internal::Renamed {
                                session_id,
                                title,
                                respond_to,
                            });
                        }
                        Err(e) => {
                            let _ = respond_to.send(Err(e));
                        }
                    }
                });
            }

            EngineCommand::DeleteSession {
                session_id,
                respond_to,
            } => {
                let backend = self.backend.clone();
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    match backend.delete_session(&session_id).await {
                        Ok(()) => {
                            let _ = internal.send(Internal::Deleted {
                                session_id,
                                respond_to,
                            });
                        }
                        Err(e) => {
                            let _ = respond_to.send(Err(e));
                        }
                    }
                });
            }

            EngineCommand::ListSessions { respond_to } => {
                let backend = self.backend.clone();
                tokio::spawn(async move {
                    let _ = respond_to.send(backend.list_sessions().await);
                });
            }

            EngineCommand::ActiveSession { respond_to } => {
                let _ = respond_to.send(self.sessions.active().clone());
            }

            EngineCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.store.snapshot());
            }

            EngineCommand::Shutdown { respond_to } => {
                self.connection.disconnect().await;
                let _ = respond_to.send(());
                return false;
            }
        }
        true
    }

    fn handle_frame(&mut self, frame: Frame) {
        let current = self.connection.current_epoch();
        if frame.epoch != current {
            debug!(
                frame_epoch = frame.epoch,
                current_epoch = current,
                "dropping frame from a closed connection"
            );
            return;
        }
        // Errors are logged by the router; an invalid frame changes nothing.
        let _ = router::dispatch(&mut self.store, &frame.text);
    }

    fn handle_history(&mut self, result: HistoryResult) {
        let HistoryResult { ticket, outcome } = result;
        if !self
            .sessions
            .is_current(&ticket.session_id, ticket.generation)
        {
            debug!(
                session_id = %ticket.session_id,
                generation = ticket.generation,
                "discarding history for an inactive session"
            );
            return;
        }
        match outcome {
            Ok(history) => self.store.apply_history(history),
            Err(e) => self
                .store
                .notify(format!("Could not load conversation history: {}", e)),
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Renamed {
                session_id,
                title,
                respond_to,
            } => {
                self.sessions.set_title(&session_id, &title);
                let _ = respond_to.send(Ok(()));
            }
            Internal::Deleted {
                session_id,
                respond_to,
            } => {
                let result = if session_id == self.sessions.active_id() {
                    info!(session_id, "active session deleted, starting a new one");
                    self.start_new_session(None).await.map(|_| ())
                } else {
                    Ok(())
                };
                let _ = respond_to.send(result);
            }
        }
    }

    async fn start_new_session(&mut self, title: Option<String>) -> Result<Session> {
        let reconnect = self.link_wanted();
        let session = self.sessions.reset(title)?;
        self.rebuild(reconnect).await;
        Ok(session)
    }

    async fn activate(&mut self, session: Session) -> Result<()> {
        let reconnect = self.link_wanted();
        self.sessions.activate(session)?;
        self.rebuild(reconnect).await;
        Ok(())
    }

    fn link_wanted(&self) -> bool {
        !matches!(
            self.connection.state(),
            ConnectionState::Idle | ConnectionState::Disconnected
        )
    }

    /// Tear down everything tied to the previous session and bring up the
    /// one `sessions` now holds. Only called once the switch is persisted.
    async fn rebuild(&mut self, reconnect: bool) {
        self.connection.disconnect().await;
        self.history.cancel();

        let session_id = self.sessions.active_id().to_string();
        self.store.reset_for_session(&session_id);
        self.request_history();

        if reconnect {
            self.connection.connect(&session_id).await;
        }
        info!(session_id, generation = self.sessions.generation(), "session active");
    }

    fn request_history(&mut self) {
        self.history.request(HistoryTicket {
            session_id: self.sessions.active_id().to_string(),
            generation: self.sessions.generation(),
        });
    }
}

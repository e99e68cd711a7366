//! ConnectionManager: the single persistent link to the backend.
//!
//! One supervisor task per `connect()` call opens the link, pumps inbound
//! frames to the engine and reconnects with exponential backoff when the
//! link drops. Each supervisor runs under an epoch number; `disconnect()`
//! bumps the epoch, so frames and state updates from a torn-down supervisor
//! are recognizably stale and get dropped.

pub mod ws;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConnectError;

/// Observable connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected,
    Error { message: String },
}

impl ConnectionState {
    /// Whether a supervisor is running (or about to run) for this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Reconnecting { .. }
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn reconnect_attempt(&self) -> u32 {
        match self {
            Self::Reconnecting { attempt } => *attempt,
            _ => 0,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Error { message } => Some(message),
            _ => None,
        }
    }
}

/// Reconnect schedule: `base * 2^(attempt-1)`, capped at `max_delay`, plus
/// up to `jitter` of random spread. Gives up after `max_attempts` failures.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter: Duration::from_millis(500),
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt `attempt` (1-based), without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// Both directions of an open connection, as text frames.
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Opens links to the backend for a given session.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, session_id: &str) -> Result<Link, ConnectError>;
}

/// An inbound frame tagged with the epoch of the link that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub epoch: u64,
    pub text: String,
}

struct Inner {
    session_id: Option<String>,
    outbound: Option<mpsc::Sender<String>>,
    cancel: Option<CancellationToken>,
}

/// Manages the one live link for the active session.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: BackoffPolicy,
    frames: mpsc::UnboundedSender<Frame>,
    state: Arc<watch::Sender<ConnectionState>>,
    epoch: Arc<AtomicU64>,
    inner: Arc<Mutex<Inner>>,
}

impl ConnectionManager {
    /// Frames from live links are delivered on `frames`.
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: BackoffPolicy,
        frames: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            connector,
            policy,
            frames,
            state: Arc::new(state),
            epoch: Arc::new(AtomicU64::new(0)),
            inner: Arc::new(Mutex::new(Inner {
                session_id: None,
                outbound: None,
                cancel: None,
            })),
        }
    }

    /// Observe state changes. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Epoch of the current supervisor. Frames carrying any other epoch
    /// are stale.
    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Open the link for `session_id` unless one is already up or being
    /// established for that session.
    pub async fn connect(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        if self.state.borrow().is_active() && inner.session_id.as_deref() == Some(session_id) {
            debug!(session_id, "already connecting or connected");
            return;
        }
        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        inner.session_id = Some(session_id.to_string());
        inner.outbound = None;
        inner.cancel = Some(cancel.clone());
        self.state.send_replace(ConnectionState::Connecting);
        info!(session_id, epoch, "connecting");

        let supervisor = Supervisor {
            connector: self.connector.clone(),
            policy: self.policy.clone(),
            frames: self.frames.clone(),
            state: self.state.clone(),
            epoch_counter: self.epoch.clone(),
            inner: self.inner.clone(),
            session_id: session_id.to_string(),
            epoch,
            cancel,
        };
        tokio::spawn(supervisor.run());
    }

    /// Close the link and cancel any pending reconnect.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }
        inner.outbound = None;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if *self.state.borrow() != ConnectionState::Idle {
            self.state.send_replace(ConnectionState::Disconnected);
        }
        debug!(session_id = ?inner.session_id, "disconnected");
    }

    /// Queue a frame for sending. Returns false, without queueing, when not
    /// connected.
    pub async fn send(&self, frame: String) -> bool {
        let inner = self.inner.lock().await;
        if !self.state.borrow().is_connected() {
            debug!("send while not connected");
            return false;
        }
        match &inner.outbound {
            Some(outbound) => outbound.try_send(frame).is_ok(),
            None => false,
        }
    }
}

struct Supervisor {
    connector: Arc<dyn Connector>,
    policy: BackoffPolicy,
    frames: mpsc::UnboundedSender<Frame>,
    state: Arc<watch::Sender<ConnectionState>>,
    epoch_counter: Arc<AtomicU64>,
    inner: Arc<Mutex<Inner>>,
    session_id: String,
    epoch: u64,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Publish `state` only if this supervisor is still current.
    async fn publish(&self, state: ConnectionState) -> bool {
        let _inner = self.inner.lock().await;
        if self.cancel.is_cancelled() || self.epoch_counter.load(Ordering::SeqCst) != self.epoch {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    async fn run(self) {
        let mut attempt = 0u32;
        loop {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return,
                opened = self.connector.open(&self.session_id) => opened,
            };

            match opened {
                Ok(link) => {
                    attempt = 0;
                    if !self.pump(link).await {
                        return;
                    }
                    warn!(session_id = %self.session_id, "connection lost, will attempt reconnection");
                }
                Err(e) if e.is_fatal() => {
                    warn!(session_id = %self.session_id, "connection rejected: {}", e);
                    self.publish(ConnectionState::Error {
                        message: e.to_string(),
                    })
                    .await;
                    return;
                }
                Err(e) => {
                    warn!(session_id = %self.session_id, attempt, "connect failed: {}", e);
                }
            }

            attempt += 1;
            if attempt > self.policy.max_attempts {
                warn!(session_id = %self.session_id, "giving up after {} attempts", self.policy.max_attempts);
                self.publish(ConnectionState::Error {
                    message: format!(
                        "unable to reach backend after {} attempts",
                        self.policy.max_attempts
                    ),
                })
                .await;
                return;
            }
            if !self.publish(ConnectionState::Reconnecting { attempt }).await {
                return;
            }

            let delay = self.policy.delay_for(attempt);
            info!(session_id = %self.session_id, attempt, ?delay, "reconnection attempt scheduled");
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Forward inbound frames until the link closes. Returns false when the
    /// supervisor should stop (cancelled or superseded) rather than
    /// reconnect.
    async fn pump(&self, link: Link) -> bool {
        let Link {
            outbound,
            mut inbound,
        } = link;
        {
            let mut inner = self.inner.lock().await;
            if self.cancel.is_cancelled()
                || self.epoch_counter.load(Ordering::SeqCst) != self.epoch
            {
                return false;
            }
            inner.outbound = Some(outbound);
            self.state.send_replace(ConnectionState::Connected);
        }
        info!(session_id = %self.session_id, epoch = self.epoch, "connected");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                frame = inbound.recv() => match frame {
                    Some(text) => {
                        let frame = Frame { epoch: self.epoch, text };
                        if self.frames.send(frame).is_err() {
                            debug!("frame consumer gone, stopping supervisor");
                            return false;
                        }
                    }
                    None => break,
                },
            }
        }

        let mut inner = self.inner.lock().await;
        if self.cancel.is_cancelled() || self.epoch_counter.load(Ordering::SeqCst) != self.epoch {
            return false;
        }
        inner.outbound = None;
        true
    }
}

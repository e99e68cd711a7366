pub mod render;
pub mod sessions;

use anyhow::{Context as _, Result, bail};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use deploy_sync::{
    ConnectionState, FileSessionPersistence, HttpBackend, StoreChange, StructuredCommand,
    SyncConfig, SyncEngine, SyncHandle, SyncPaths, WsConnector,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const HISTORY_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolved paths and configuration shared by every subcommand.
pub struct Context {
    pub paths: SyncPaths,
    pub config: SyncConfig,
}

impl Context {
    pub fn load(data_dir: Option<PathBuf>, base_url: Option<String>) -> Result<Self> {
        let paths = SyncPaths::new(data_dir)?;
        let mut config = SyncConfig::load(&paths.data_dir)?;
        if let Some(url) = base_url {
            config.backend.base_url = url.trim_end_matches('/').to_string();
        }
        debug!(base_url = %config.backend.base_url, "configuration loaded");
        Ok(Self { paths, config })
    }

    /// Start an engine for the persisted active session.
    pub fn start(&self) -> Result<SyncHandle> {
        self.start_subscribed().map(|(handle, _)| handle)
    }

    /// Start an engine along with a change receiver that will see the
    /// initial history load.
    pub fn start_subscribed(&self) -> Result<(SyncHandle, broadcast::Receiver<StoreChange>)> {
        let connector = WsConnector::new(&self.config.backend.base_url)?;
        let backend = HttpBackend::new(
            &self.config.backend.base_url,
            self.config.backend.request_timeout,
        )?;
        let persistence = FileSessionPersistence::new(self.paths.session_state_path());
        let started = SyncEngine::spawn_subscribed(
            self.config.engine.clone(),
            Arc::new(connector),
            Arc::new(backend),
            Arc::new(persistence),
        )?;
        Ok(started)
    }
}

/// Wait until the initial history fetch has been applied (or reported as
/// failed). `changes` must be subscribed before the engine started.
async fn wait_for_history(changes: &mut broadcast::Receiver<StoreChange>) {
    let wait = async {
        loop {
            match changes.recv().await {
                Ok(StoreChange::TranscriptReloaded) => break,
                Ok(StoreChange::Notice(notice)) => {
                    eprintln!("{}", notice);
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    };
    if tokio::time::timeout(HISTORY_TIMEOUT, wait).await.is_err() {
        warn!("timed out waiting for conversation history");
    }
}

/// Connect and wait for the link to come up.
async fn connect(handle: &SyncHandle) -> Result<()> {
    let mut state = handle.connection_state();
    handle.connect().await?;

    let wait = async {
        loop {
            let current = state.borrow_and_update().clone();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Error { message } => bail!("Connection failed: {}", message),
                other @ ConnectionState::Reconnecting { .. } => {
                    eprintln!("{}", render::connection_line(&other));
                }
                _ => {}
            }
            state
                .changed()
                .await
                .context("Engine stopped while connecting")?;
        }
    };
    tokio::time::timeout(CONNECT_TIMEOUT, wait)
        .await
        .context("Timed out connecting to the backend")?
}

/// Print changes for the active session until Ctrl-C or the engine stops.
async fn stream(handle: &SyncHandle) -> Result<()> {
    let mut changes = handle.subscribe();
    let mut state = handle.connection_state();
    let mut printed: HashSet<String> = HashSet::new();
    let mut last_progress: Option<(u8, String)> = None;

    for message in handle.snapshot().await?.messages {
        println!("{}", render::message_line(&message));
        printed.insert(message.id);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nInterrupted.");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                eprintln!("[{}]", render::connection_line(&current));
                if matches!(current, ConnectionState::Error { .. }) {
                    break;
                }
            }
            change = changes.recv() => {
                let change = match change {
                    Ok(change) => change,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "display fell behind");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                match change {
                    StoreChange::Transcript { message_id } => {
                        let snapshot = handle.snapshot().await?;
                        if let Some(message) = snapshot.messages.iter().find(|m| m.id == message_id) {
                            // A progress cursor is updated in place; print each revision.
                            if printed.insert(message_id) || message.is_progress_cursor() {
                                println!("{}", render::message_line(message));
                            }
                        }
                    }
                    StoreChange::TranscriptReloaded => {
                        for message in handle.snapshot().await?.messages {
                            if printed.insert(message.id.clone()) {
                                println!("{}", render::message_line(&message));
                            }
                        }
                    }
                    StoreChange::Deployment => {
                        if let Some(progress) = handle.snapshot().await?.deployment {
                            let key = (progress.overall_progress, progress.current_stage.clone());
                            if last_progress.as_ref() != Some(&key) {
                                println!("{}", render::deployment_summary(&progress));
                                last_progress = Some(key);
                            }
                        }
                    }
                    StoreChange::Typing(true) => eprintln!("(assistant is typing...)"),
                    StoreChange::Notice(notice) => eprintln!("{}", notice),
                    StoreChange::Session { session_id } => {
                        printed.clear();
                        last_progress = None;
                        eprintln!("Switched to session {}", session_id);
                    }
                    StoreChange::Typing(false) | StoreChange::Thoughts => {}
                }
            }
        }
    }
    Ok(())
}

pub async fn watch_command(ctx: &Context) -> Result<()> {
    let (handle, mut changes) = ctx.start_subscribed()?;
    wait_for_history(&mut changes).await;
    connect(&handle).await?;
    let session = handle.active_session().await?;
    eprintln!("Watching session {} (Ctrl-C to stop)", session.display_title());

    let result = stream(&handle).await;
    let _ = handle.shutdown().await;
    result
}

pub async fn send_command(ctx: &Context, message: &str, watch: bool) -> Result<()> {
    let (handle, mut changes) = ctx.start_subscribed()?;
    wait_for_history(&mut changes).await;
    connect(&handle).await?;

    if !handle.send_chat(message, None).await? {
        let _ = handle.shutdown().await;
        bail!("Message was not delivered; the connection dropped");
    }
    eprintln!("Sent.");

    let result = if watch { stream(&handle).await } else { Ok(()) };
    let _ = handle.shutdown().await;
    result
}

pub async fn status_command(ctx: &Context, json: bool) -> Result<()> {
    let (handle, mut changes) = ctx.start_subscribed()?;
    wait_for_history(&mut changes).await;
    let snapshot = handle.snapshot().await?;
    let session = handle.active_session().await?;
    let _ = handle.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!("Session: {} ({})", session.display_title(), session.id);
    println!(
        "Updated: {}",
        session.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();
    if snapshot.messages.is_empty() {
        println!("No messages yet.");
    }
    for message in &snapshot.messages {
        println!("{}", render::message_line(message));
    }
    if let Some(progress) = &snapshot.deployment {
        println!();
        for line in render::deployment_lines(progress) {
            println!("{}", line);
        }
    }
    Ok(())
}

pub fn parse_env_vars(vars: &[String]) -> Result<BTreeMap<String, String>> {
    let mut parsed = BTreeMap::new();
    for var in vars {
        let Some((key, value)) = var.split_once('=') else {
            bail!("Expected KEY=VALUE, got {:?}", var);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Empty variable name in {:?}", var);
        }
        parsed.insert(key.to_string(), value.to_string());
    }
    Ok(parsed)
}

async fn send_structured(ctx: &Context, command: StructuredCommand) -> Result<()> {
    let handle = ctx.start()?;
    connect(&handle).await?;
    let delivered = handle.send_command(command).await?;
    let _ = handle.shutdown().await;
    if !delivered {
        bail!("Command was not delivered; the connection dropped");
    }
    Ok(())
}

pub async fn env_command(ctx: &Context, vars: &[String]) -> Result<()> {
    let variables = parse_env_vars(vars)?;
    let count = variables.len();
    send_structured(ctx, StructuredCommand::EnvVars { variables }).await?;
    println!("Uploaded {} variable(s).", count);
    Ok(())
}

pub async fn abort_command(ctx: &Context, deployment_id: Option<String>) -> Result<()> {
    send_structured(ctx, StructuredCommand::Abort { deployment_id }).await?;
    println!("Abort requested.");
    Ok(())
}

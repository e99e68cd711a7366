//! Plain-text rendering of engine state.

use deploy_sync::connection::ConnectionState;
use deploy_sync::progress::{DeploymentProgress, DeploymentStatus};
use deploy_sync::protocol::StageStatus;
use deploy_sync::transcript::{ChatMessage, Role};

const BAR_WIDTH: usize = 30;

pub fn progress_bar(percent: u8, width: usize) -> String {
    let percent = percent.min(100) as usize;
    let filled = percent * width / 100;
    format!(
        "[{}{}] {:>3}%",
        "#".repeat(filled),
        "-".repeat(width - filled),
        percent
    )
}

fn stage_marker(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Pending => " ",
        StageStatus::InProgress => ">",
        StageStatus::Success => "+",
        StageStatus::Error => "x",
    }
}

pub fn deployment_summary(progress: &DeploymentProgress) -> String {
    let status = match progress.status {
        DeploymentStatus::Deploying => "deploying",
        DeploymentStatus::Success => "success",
        DeploymentStatus::Failed => "failed",
    };
    format!(
        "{} {} ({}, stage: {})",
        progress_bar(progress.overall_progress, BAR_WIDTH),
        progress.deployment_id,
        status,
        progress.current_stage
    )
}

pub fn deployment_lines(progress: &DeploymentProgress) -> Vec<String> {
    let mut lines = vec![deployment_summary(progress)];
    for stage in &progress.stages {
        let mut line = format!("  [{}] {}", stage_marker(stage.status), stage.label);
        if let Some(message) = &stage.message {
            line.push_str(&format!(": {}", message));
        }
        lines.push(line);
    }
    if let Some(url) = &progress.deployment_url {
        lines.push(format!("  live at {}", url));
    }
    lines
}

pub fn message_line(message: &ChatMessage) -> String {
    let who = match message.role {
        Role::User => "you",
        Role::Assistant => "assistant",
    };
    let mut line = if message.is_progress_cursor() {
        format!("  ... {}", message.content)
    } else {
        format!("{}> {}", who, message.content)
    };
    if message.metadata_type() == Some("error") {
        line = format!("{}> error: {}", who, message.content);
    }
    if message
        .metadata
        .as_ref()
        .and_then(|m| m.get("delivered"))
        .and_then(|v| v.as_bool())
        == Some(false)
    {
        line.push_str("  (not delivered)");
    }
    if let Some(url) = &message.deployment_url {
        if !message.content.contains(url.as_str()) {
            line.push_str(&format!("  <{}>", url));
        }
    }
    line
}

pub fn connection_line(state: &ConnectionState) -> String {
    match state {
        ConnectionState::Idle => "idle".to_string(),
        ConnectionState::Connecting => "connecting...".to_string(),
        ConnectionState::Connected => "connected".to_string(),
        ConnectionState::Reconnecting { attempt } => format!("reconnecting (attempt {})", attempt),
        ConnectionState::Disconnected => "disconnected".to_string(),
        ConnectionState::Error { message } => format!("connection failed: {}", message),
    }
}

use anyhow::Result;

use super::Context;
use deploy_sync::Session;

fn print_table(sessions: &[Session], active_id: &str) {
    println!("{:<2}{:<38} {:<32} {}", "", "ID", "TITLE", "UPDATED");
    println!("{}", "-".repeat(96));
    for session in sessions {
        let marker = if session.id == active_id { "*" } else { "" };
        let title = session.title.as_deref().unwrap_or("(untitled)");
        println!(
            "{:<2}{:<38} {:<32} {}",
            marker,
            session.id,
            truncate(title, 32),
            session.timestamp.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} session(s)", sessions.len());
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

pub async fn list_command(ctx: &Context, json: bool) -> Result<()> {
    let handle = ctx.start()?;
    let sessions = handle.list_sessions().await;
    let active = handle.active_session().await?;
    let _ = handle.shutdown().await;
    let sessions = sessions?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else if sessions.is_empty() {
        println!("No sessions on the backend.");
    } else {
        print_table(&sessions, &active.id);
    }
    Ok(())
}

pub async fn current_command(ctx: &Context) -> Result<()> {
    let handle = ctx.start()?;
    let session = handle.active_session().await?;
    let _ = handle.shutdown().await;
    println!("{}", session.id);
    if let Some(title) = &session.title {
        println!("{}", title);
    }
    Ok(())
}

pub async fn switch_command(ctx: &Context, session_id: &str) -> Result<()> {
    let handle = ctx.start()?;
    let result = handle.switch_session(session_id).await;
    let _ = handle.shutdown().await;
    result?;
    println!("Active session: {}", session_id);
    Ok(())
}

pub async fn new_command(ctx: &Context, title: Option<String>) -> Result<()> {
    let handle = ctx.start()?;
    let result = handle.create_session(title).await;
    let _ = handle.shutdown().await;
    let session = result?;
    println!("Created session {}", session.id);
    Ok(())
}

pub async fn reset_command(ctx: &Context) -> Result<()> {
    let handle = ctx.start()?;
    let result = handle.reset_session().await;
    let _ = handle.shutdown().await;
    let session = result?;
    println!("Session reset. New session: {}", session.id);
    Ok(())
}

pub async fn rename_command(ctx: &Context, session_id: &str, title: &str) -> Result<()> {
    let handle = ctx.start()?;
    let result = handle.rename_session(session_id, title).await;
    let _ = handle.shutdown().await;
    result?;
    println!("Renamed {} to {:?}", session_id, title);
    Ok(())
}

pub async fn delete_command(ctx: &Context, session_id: &str) -> Result<()> {
    let handle = ctx.start()?;
    let result = handle.delete_session(session_id).await;
    let active = handle.active_session().await;
    let _ = handle.shutdown().await;
    result?;
    println!("Deleted session {}", session_id);
    if let Ok(active) = active {
        if active.id != session_id {
            println!("Active session: {}", active.id);
        }
    }
    Ok(())
}

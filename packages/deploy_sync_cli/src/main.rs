use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

mod cli;

#[derive(Parser)]
#[command(name = "deploysync")]
#[command(about = "Follow and drive a deployment assistant conversation from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.deploysync)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Backend base URL, overriding config.toml and DEPLOY_SYNC_BACKEND__BASE_URL
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream the active session until interrupted
    Watch,

    /// Send a chat message to the assistant
    Send(SendArgs),

    /// Show the active session's transcript and deployment progress
    Status(StatusArgs),

    /// Upload environment variables for the pending deployment
    Env(EnvArgs),

    /// Abort the running deployment
    Abort(AbortArgs),

    /// Manage sessions
    #[command(subcommand)]
    Sessions(SessionCommands),
}

#[derive(Parser)]
struct SendArgs {
    /// Message text
    message: String,

    /// Keep streaming after the message is sent
    #[arg(short, long)]
    watch: bool,
}

#[derive(Parser)]
struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct EnvArgs {
    /// KEY=VALUE pairs
    #[arg(required = true)]
    vars: Vec<String>,
}

#[derive(Parser)]
struct AbortArgs {
    /// Deployment to abort (defaults to the running one)
    #[arg(long)]
    deployment_id: Option<String>,
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List sessions known to the backend
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the active session
    Current,
    /// Make another session active
    Switch { session_id: String },
    /// Start a new session and make it active
    New {
        #[arg(long)]
        title: Option<String>,
    },
    /// Abandon the active session and start over
    Reset,
    /// Rename a session
    Rename { session_id: String, title: String },
    /// Delete a session
    Delete { session_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "deploy_sync=debug,deploysync=debug,info"
    } else {
        "deploy_sync=warn,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let ctx = cli::Context::load(cli.data_dir, cli.base_url)?;

    match cli.command {
        Commands::Watch => cli::watch_command(&ctx).await,
        Commands::Send(args) => cli::send_command(&ctx, &args.message, args.watch).await,
        Commands::Status(args) => cli::status_command(&ctx, args.json).await,
        Commands::Env(args) => cli::env_command(&ctx, &args.vars).await,
        Commands::Abort(args) => cli::abort_command(&ctx, args.deployment_id).await,
        Commands::Sessions(cmd) => match cmd {
            SessionCommands::List { json } => cli::sessions::list_command(&ctx, json).await,
            SessionCommands::Current => cli::sessions::current_command(&ctx).await,
            SessionCommands::Switch { session_id } => {
                cli::sessions::switch_command(&ctx, &session_id).await
            }
            SessionCommands::New { title } => cli::sessions::new_command(&ctx, title).await,
            SessionCommands::Reset => cli::sessions::reset_command(&ctx).await,
            SessionCommands::Rename { session_id, title } => {
                cli::sessions::rename_command(&ctx, &session_id, &title).await
            }
            SessionCommands::Delete { session_id } => {
                cli::sessions::delete_command(&ctx, &session_id).await
            }
        },
    }
}

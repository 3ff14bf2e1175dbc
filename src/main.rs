use anyhow::Result;
use cairn::{cli, config, server};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cairn", version, about = "Verified-memory knowledge daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server on the configured transport (stdio by default) with the heartbeat
    Serve,
    /// Start the HTTP server (MCP at /mcp, JSON/SSE API under /api) with the heartbeat
    Http,
    /// Create the workspace templates and the index database
    Init,
    /// Run a verified search
    Search {
        /// Natural language query
        query: String,
        /// Maximum number of results
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Reconcile the index with the workspace files
    Reindex {
        /// Rebuild from scratch and swap in atomically
        #[arg(long)]
        full: bool,
    },
    /// Show index statistics
    Stats,
    /// Run or inspect the heartbeat
    Heartbeat {
        #[command(subcommand)]
        action: HeartbeatAction,
    },
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
    /// Check the workspace, database, and model files
    Doctor,
}

#[derive(Subcommand)]
enum HeartbeatAction {
    /// Run one cycle now
    Run,
    /// Show tasks and whether they are due
    Status,
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to ~/.cairn/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::CairnConfig::load()?;

    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => match config.server.transport.as_str() {
            "http" => server::serve_http(config).await?,
            _ => server::serve_stdio(config).await?,
        },
        Command::Http => server::serve_http(config).await?,
        Command::Init => cli::init(&config).await?,
        Command::Search { query, top_k } => cli::search::search(config, &query, top_k).await?,
        Command::Reindex { full } => cli::reindex::reindex(config, full).await?,
        Command::Stats => cli::stats::stats(&config)?,
        Command::Heartbeat { action } => match action {
            HeartbeatAction::Run => cli::heartbeat::run(config).await?,
            HeartbeatAction::Status => cli::heartbeat::status(config).await?,
        },
        Command::Model { action } => match action {
            ModelAction::Download => cli::model_download(&config.embedding).await?,
        },
        Command::Doctor => cli::doctor::doctor(&config)?,
    }

    Ok(())
}

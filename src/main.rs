//! Gamelink server
//!
//! Runs the game WebSocket server, or connects to one as a client for quick
//! manual checks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gamelink::config::{ServerConfig, CONFIG_FILE};
use gamelink::server::{builtin_router, Envelope, GameServer};
use gamelink::ws::WsClient;

/// How long shutdown waits for sessions to finish closing
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Gamelink server
///
/// WebSocket transport for game engine clients
#[derive(Parser, Debug)]
#[command(name = "gamelink")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the game server
    Serve(ServeArgs),
    /// Connect to a server, send one event and print the replies
    Connect(ConnectArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Shared secret for client tokens
    #[arg(long, env = "GAMELINK_SECRET", hide_env_values = true)]
    secret: Option<String>,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Server URL, e.g. ws://127.0.0.1:9000/
    url: String,

    /// Configuration file supplying header names and transport limits
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Identity sent in the identity header (Player-ID by default)
    #[arg(long)]
    player_id: String,

    /// Bearer token
    #[arg(long, env = "GAMELINK_TOKEN", hide_env_values = true)]
    token: String,

    /// Event name to send
    #[arg(long, default_value = "ping")]
    event: String,

    /// JSON payload for the event
    #[arg(long, default_value = "null")]
    data: String,

    /// Seconds to keep printing replies after the last one
    #[arg(long, default_value_t = 2)]
    wait: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Connect(args) => connect(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    info!("Gamelink v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?
        .with_bind(args.bind)
        .with_port(args.port)
        .with_secret(args.secret);
    config.validate()?;

    let router = builtin_router()?;
    info!("Registered events: {}", router.events().join(", "));

    let server = Arc::new(GameServer::new(config, router));
    let server_handle = Arc::clone(&server);

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    let handle = server.handle();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while handle.count().await > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        info!("{} sessions still closing at exit", handle.count().await);
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn connect(args: ConnectArgs) -> anyhow::Result<()> {
    let config = ServerConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let data: Value = serde_json::from_str(&args.data).context("--data must be valid JSON")?;
    let headers = vec![
        (config.auth.token_header, format!("Bearer {}", args.token)),
        (config.auth.identity_header, args.player_id),
    ];

    let options = config.transport.client_options();
    let mut client = WsClient::connect(&args.url, &headers, &options).await?;
    info!("Connected to {}", args.url);

    let json = Envelope::new(args.event, data).to_json()?;
    client.send_text(&json).await?;

    let wait = Duration::from_secs(args.wait);
    while let Ok(Some(message)) = tokio::time::timeout(wait, client.recv()).await {
        println!("{}", message);
    }

    if let Err(e) = client.close().await {
        debug!("Connection ended with error: {}", e);
    }
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

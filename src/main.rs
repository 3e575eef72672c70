//! gold-accrual daemon and operator CLI
//!
//! `serve` (the default) runs the read-only HTTP API and the leaderboard
//! rebuild scheduler. Every other subcommand runs once against the same
//! database and exits.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use gold_accrual::api::create_router;
use gold_accrual::cli::{execute, Commands};
use gold_accrual::leaderboard::spawn_rebuild_task;
use gold_accrual::{Config, Engine};

#[derive(Parser)]
#[command(name = "gold-accrual")]
#[command(about = "Passive gold accrual engine with a cached leaderboard")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "gold-accrual.toml")]
    config: PathBuf,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "GOLD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// HTTP API port (overrides config file)
    #[arg(long)]
    http_port: Option<u16>,

    /// Ownership oracle base URL (overrides config file)
    #[arg(long, env = "GOLD_ORACLE_URL")]
    oracle_url: Option<String>,

    /// Log level for this crate (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("gold_accrual={}", cli.log_level).parse()?),
        )
        .init();

    if !cli.config.exists() {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }
    let mut config = Config::load(&cli.config)?;

    // Apply CLI overrides
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(url) = cli.oracle_url {
        config.oracle.url = Some(url);
    }
    config.validate()?;

    let engine = Engine::from_config(&config)?;

    match cli.command {
        None | Some(Commands::Serve) => serve(engine, &config).await,
        Some(command) => match execute(&engine, command).await {
            Ok(output) => {
                println!("{}", output);
                Ok(())
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
    }
}

async fn serve(engine: Engine, config: &Config) -> anyhow::Result<()> {
    info!(
        data_dir = %config.storage.data_dir.display(),
        top_n = config.engine.top_n,
        rebuild_interval_secs = config.engine.rebuild_interval_secs,
        "Starting gold-accrual"
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let scheduler = spawn_rebuild_task(
        engine.cache.clone(),
        config.engine.rebuild_interval(),
        shutdown_rx,
    );

    let app = create_router(engine);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.http_port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(()).await;
    if let Err(e) = scheduler.await {
        error!(error = %e, "Leaderboard scheduler ended abnormally");
    }
    info!("gold-accrual stopped");
    Ok(())
}

mod routes;

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use panelforge_engine::config::EngineConfig;
use panelforge_engine::ComicEngine;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "panelforge=info,tower_http=info";

#[derive(Debug, Parser)]
#[command(name = "panelforge", version, about = "Comic panel and storyboard generation service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API.
    Serve(ServeArgs),
    /// Run one expired-session sweep and exit.
    Sweep(SweepArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    #[arg(long)]
    temp_dir: Option<PathBuf>,
    #[arg(long)]
    scripts_dir: Option<PathBuf>,
    #[arg(long)]
    styles_dir: Option<PathBuf>,
    /// Use the offline providers instead of the Ark API.
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct SweepArgs {
    #[arg(long)]
    temp_dir: Option<PathBuf>,
    #[arg(long)]
    retention_hours: Option<u64>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("panelforge error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // A missing .env is fine; the process environment still applies.
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Sweep(args) => sweep(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = if args.dryrun {
        EngineConfig::from_lookup(offline_lookup)
    } else {
        EngineConfig::from_env()
    }
    .context("invalid configuration")?;
    if let Some(dir) = args.temp_dir {
        config.temp_dir = dir;
    }
    if let Some(dir) = args.scripts_dir {
        config.scripts_dir = dir;
    }
    if let Some(dir) = args.styles_dir {
        config.styles_dir = dir;
    }

    let engine = ComicEngine::new(config).await.context("engine startup")?;
    let reaper = engine.spawn_reaper();
    let app = routes::router(engine);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(addr = %args.bind, "panelforge listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    reaper.abort();
    info!("panelforge stopped");
    Ok(())
}

async fn sweep(args: SweepArgs) -> Result<()> {
    let mut config = EngineConfig::from_lookup(offline_lookup).context("invalid configuration")?;
    if let Some(dir) = args.temp_dir {
        config.temp_dir = dir;
    }
    if let Some(hours) = args.retention_hours {
        config.retention = retention_from_hours(hours);
    }
    let engine = ComicEngine::new(config).await.context("engine startup")?;
    let report = engine.purge_expired().await.context("session sweep")?;
    println!(
        "{}",
        json!({
            "scanned": report.scanned,
            "removed": report.removed,
            "failed": report.failed,
        })
    );
    Ok(())
}

const MAX_RETENTION_HOURS: u64 = 24 * 365;

fn retention_from_hours(hours: u64) -> Duration {
    Duration::from_secs(hours.clamp(1, MAX_RETENTION_HOURS) * 3600)
}

// Environment lookup with both providers pinned to the offline ones, so no
// credential is required.
fn offline_lookup(key: &str) -> Option<String> {
    match key {
        "PANELFORGE_IMAGE_PROVIDER" | "PANELFORGE_TEXT_PROVIDER" => Some("dryrun".to_string()),
        _ => env::var(key).ok(),
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

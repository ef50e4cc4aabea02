// leasemgr: engine daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use leasemgr_engine::config::ManagerConfig;
use leasemgr_engine::startup::Engine;
use tracing::info;

#[derive(Parser)]
#[command(name = "leasemgr", about = "Multi-tenant resource-reservation lease manager")]
struct Cli {
    /// Path to the TOML config file. Defaults to `$LEASEMGR_CONFIG` or
    /// `~/.config/leasemgr/leasemgr.toml`, falling back to built-in
    /// defaults if neither is present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Postgres connection string. Omit to run against the in-memory
    /// repository (no persistence across restarts).
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ManagerConfig::load_from(path)
            .with_context(|| format!("failed to load config from `{}`", path.display()))?,
        None => ManagerConfig::load(),
    };

    info!(plugins = ?config.plugins, "starting leasemgr engine");
    let engine = Engine::build(config, cli.database_url.as_deref())
        .await
        .context("failed to build engine from config")?;

    leasemgr_engine::runtime::run_standalone(Arc::new(engine))
        .await
        .context("leasemgr engine terminated unexpectedly")
}

mod config;
mod platform;
mod relay;
mod scheduler;
mod state;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, StateBackend};
use crate::platform::discord::DiscordSource;
use crate::relay::rename::SystemClock;
use crate::relay::{Relay, RelaySettings};
use crate::scheduler::Scheduler;
use crate::state::json::JsonStateStore;
use crate::state::sqlite::SqliteStateStore;
use crate::state::StateStore;
use crate::transport::sftp::SftpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,imgrelay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Channel: {}", config.discord.channel_id);
    info!(
        "  SFTP: {}@{}:{} -> {}",
        config.sftp.user, config.sftp.host, config.sftp.port, config.sftp.remote_dir
    );
    info!("  Rename pattern: {}", config.relay.rename_pattern);
    info!(
        "  State: {} at {}",
        config.state.backend,
        config.state.path.display()
    );

    let store: Arc<dyn StateStore> = match config.state.backend {
        StateBackend::Json => Arc::new(JsonStateStore::new(config.state.path.clone())),
        StateBackend::Sqlite => Arc::new(SqliteStateStore::open(&config.state.path)?),
    };

    let source = DiscordSource::new(config.discord.clone())?;
    let transport = SftpTransport::new(config.sftp.clone(), config.relay.delivery_timeout());

    let relay = Arc::new(Relay::new(
        Arc::new(source),
        Arc::new(transport),
        store,
        Arc::new(SystemClock),
        RelaySettings::from(&config),
    ));

    let mut scheduler = Scheduler::new().await?;
    scheduler::tasks::register_relay_tasks(&mut scheduler, relay.clone(), &config.relay.poll_cron)
        .await?;

    if config.relay.run_on_start {
        scheduler::tasks::run_check(relay.clone()).await;
    }

    scheduler.start().await?;
    for job in scheduler.jobs() {
        info!("  Job: {} ({})", job.name, job.cron_expr);
    }
    info!("Relay is running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down...");
    scheduler.shutdown().await?;
    relay.shutdown();

    Ok(())
}

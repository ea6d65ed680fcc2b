//! # Duewatch — deadline reminder daemon
//!
//! Tracks user-defined deadlines and delivers each configured reminder
//! exactly once, across restarts, at a bounded outbound rate.
//!
//! Usage:
//!   duewatch                        # run with ~/.duewatch/config.toml
//!   duewatch --config ./dev.toml    # explicit config file
//!   duewatch --init-config          # write a default config and exit

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use duewatch_channels::{ConsoleSender, TelegramSender, WebhookSender};
use duewatch_core::DuewatchConfig;
use duewatch_scheduler::{
    NotificationLedger, SchedulerEngine, SqliteDeadlineStore, SystemClock, Transport,
};

#[derive(Parser)]
#[command(name = "duewatch", version, about = "⏰ Duewatch — deadline reminder daemon")]
struct Cli {
    /// Path to config.toml (default: ~/.duewatch/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Database path override
    #[arg(long)]
    db_path: Option<String>,

    /// Write a default config file and exit
    #[arg(long)]
    init_config: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "duewatch=debug,tower_http=debug"
    } else {
        "duewatch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    if cli.init_config {
        let config = DuewatchConfig::default();
        config.save()?;
        println!(
            "Wrote default config to {}",
            DuewatchConfig::default_path().display()
        );
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => DuewatchConfig::load_from(std::path::Path::new(path))?,
        None => DuewatchConfig::load()?,
    };
    if let Some(db_path) = cli.db_path {
        config.database_path = db_path;
    }
    // bad values abort here, never mid-scan
    config.validate()?;

    let db_path = std::path::PathBuf::from(shellexpand::tilde(&config.database_path).to_string());
    let pref_defaults = duewatch_core::NotificationPreference::from_enabled(
        0,
        &config.notifications.default_timezone,
        &config.notifications.thresholds(),
    );
    let store = Arc::new(SqliteDeadlineStore::open_with_defaults(&db_path, pref_defaults)?);
    let ledger = Arc::new(NotificationLedger::open(&db_path)?);

    let transport: Arc<dyn Transport> = if config.telegram.enabled {
        Arc::new(TelegramSender::new(config.telegram.clone()))
    } else if config.webhook.enabled {
        Arc::new(WebhookSender::new(config.webhook.clone()))
    } else {
        tracing::warn!("⚠️ no transport configured; reminders go to the console");
        Arc::new(ConsoleSender)
    };

    let engine = SchedulerEngine::new(
        store,
        ledger,
        transport,
        Arc::new(SystemClock),
        config.scheduler.clone(),
        config.dispatch.clone(),
        config.rate_limit.clone(),
    );
    let handle = engine.start();
    tracing::info!(
        "⏰ duewatch started (upcoming scan every {}s, reconciliation every {}s)",
        config.scheduler.upcoming_interval_secs,
        config.scheduler.reconcile_interval_secs
    );

    let (gateway_shutdown_tx, gateway_shutdown_rx) = tokio::sync::watch::channel(false);
    let gateway_join = if config.gateway.enabled {
        let state = duewatch_gateway::AppState {
            engine: engine.clone(),
            start_time: std::time::Instant::now(),
        };
        let gateway_config = config.gateway.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = duewatch_gateway::serve(&gateway_config, state, gateway_shutdown_rx).await
            {
                tracing::error!("gateway failed: {e}");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl-C");
    gateway_shutdown_tx.send(true).ok();
    handle.shutdown().await;
    if let Some(join) = gateway_join {
        join.await.ok();
    }
    Ok(())
}

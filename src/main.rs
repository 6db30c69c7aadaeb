use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ticketwatch::config::Config;
use ticketwatch::diagnostics::SnapshotDir;
use ticketwatch::extract::TicketPageExtractor;
use ticketwatch::fetch::HttpCapabilityFactory;
use ticketwatch::notify::{Dispatcher, TelegramChannel};
use ticketwatch::poller::{cancel_on_signal, Poller, PollerSettings};
use ticketwatch::session::{FileSessionStore, SessionManager};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_CONFIG_FILE: &str = "ticketwatch.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config_path = std::env::var("TICKETWATCH_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        Config::from_env()?
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("ticketwatch v{} starting", env!("CARGO_PKG_VERSION"));
    if !config_path.exists() {
        info!(path = %config_path.display(), "no config file found, using env-only config");
    }

    config.validate()?;
    let p = &config.polling;
    info!(
        event_url = %config.target.event_url,
        chats = config.telegram.chat_ids.len(),
        sleep_min = p.sleep_min_secs,
        sleep_max = p.sleep_max_secs,
        heartbeat_mins = p.heartbeat_interval_minutes,
        restart_interval = p.restart_interval,
        rate_limit_threshold = p.rate_limit_restart_threshold,
        resend_hours = p.resend_interval_hours,
        test_mode = p.test_mode,
        session_file = %config.storage.session_file.display(),
        "configuration loaded"
    );
    if p.test_mode {
        warn!("test mode enabled: synthetic offers may be injected");
    }

    let sessions = SessionManager::new(
        Arc::new(HttpCapabilityFactory::new(Some(config.target.site_url.clone()))),
        Arc::new(FileSessionStore::new(config.storage.session_file.clone())),
    );
    let channel = TelegramChannel::new(
        config.telegram.api_base.clone(),
        config.telegram.bot_token.clone(),
        Duration::from_secs(config.telegram.send_timeout_secs),
    );
    let dispatcher = Dispatcher::new(
        Arc::new(channel),
        config.telegram.max_retries,
        Duration::from_secs(config.telegram.retry_backoff_secs),
    );
    let poller = Poller::new(
        PollerSettings::from_config(&config),
        sessions,
        Arc::new(TicketPageExtractor),
        dispatcher,
        config.telegram.chat_ids.clone(),
        Arc::new(SnapshotDir::new(config.storage.snapshot_dir.clone())),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone(), tokio::signal::ctrl_c()));
    #[cfg(unix)]
    tokio::spawn(cancel_on_signal(shutdown.clone(), sigterm()));

    poller.run(shutdown).await;
    info!("script terminated");
    Ok(())
}

#[cfg(unix)]
async fn sigterm() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

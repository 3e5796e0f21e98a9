//! Calculation Member Daemon
//!
//! Keeps an event stream open to the calculation-dispatch platform and logs
//! its health until stopped.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults (config from the user config dir if present)
//! calculation-member
//!
//! # Custom config file and endpoint
//! calculation-member --config /etc/calculation-member.toml --endpoint wss://dispatch.example.com/events
//!
//! # Announce capability tags
//! calculation-member --tags pricing,risk
//! ```
//!
//! Every setting can also come from a `CALC_MEMBER_*` environment variable.

use anyhow::Context;
use clap::Parser;
use calculation_member::stream::{ConnectionManager, MonitoringEvent, MonitoringEventType, WebSocketConnector};
use calculation_member::{config::default_config_path, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "calculation-member")]
#[command(about = "Event stream client for the calculation-dispatch platform")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "CALC_MEMBER_CONFIG")]
    config: Option<PathBuf>,

    /// Platform event stream endpoint (ws:// or wss://)
    #[arg(long)]
    endpoint: Option<String>,

    /// Source URI stamped on outbound envelopes
    #[arg(long)]
    source: Option<String>,

    /// Capability tags, comma separated
    #[arg(long, value_delimiter = ',')]
    tags: Option<Vec<String>>,

    /// Write the effective config to the config path and exit
    #[arg(long)]
    write_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("calculation_member=info".parse()?))
        .init();

    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = if config_path.exists() {
        Config::load(&config_path).with_context(|| format!("loading {}", config_path.display()))?
    } else {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        Config::default()
    };

    config.apply_env();

    // CLI overrides
    if let Some(endpoint) = args.endpoint {
        config.endpoint_url = endpoint;
    }
    if let Some(source) = args.source {
        config.source = Some(source);
    }
    if let Some(tags) = args.tags {
        config.tags = tags;
    }

    config.validate()?;

    if args.write_config {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Config written");
        return Ok(());
    }

    let manager_config = config.manager_config();
    info!(
        endpoint = %config.endpoint_url,
        source = %manager_config.source,
        tags = ?manager_config.tags,
        "Starting calculation-member"
    );

    let connector = Arc::new(WebSocketConnector::new(config.endpoint_url.clone(), config.connect_timeout()));
    let manager = ConnectionManager::builder(connector, manager_config)
        .with_listener(
            MonitoringEventType::ReconnectCeilingReached,
            Arc::new(|event: &MonitoringEvent| {
                error!(event = ?event, "Reconnection abandoned, restart required");
            }),
        )
        .with_listener(
            MonitoringEventType::PendingEventsBacklog,
            Arc::new(|event: &MonitoringEvent| {
                if let MonitoringEvent::PendingEventsBacklog { pending, max_size, .. } = event {
                    warn!(pending = pending, max_size = max_size, "Acknowledgments are not keeping up");
                }
            }),
        )
        .build();

    manager.start();

    info!("Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");

    manager.shutdown().await;

    let snapshot = manager.monitor().snapshot();
    info!(
        acknowledged = snapshot.acknowledged,
        rejected = snapshot.rejected,
        pending = snapshot.pending_events,
        evicted = snapshot.evicted_events,
        "Final stream stats"
    );

    Ok(())
}

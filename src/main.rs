//! Feedhub Server
//!
//! Run with: cargo run --bin feedhub
//!
//! # Configuration
//!
//! Read from `~/.config/feedhub/config.toml`, `/etc/feedhub/config.toml` or
//! `./config.toml`, then overridden by environment variables:
//! - `FEEDHUB_API_HOST`, `FEEDHUB_API_PORT`: bind address (default: 0.0.0.0:8090)
//! - `FEEDHUB_CATALOG`: JSON catalog of feeds, filters and bindings
//! - `FEEDHUB_PROBE_TIMEOUT_SECS`: connection test deadline (default: 10)
//! - `FEEDHUB_LOG_LEVEL`, `FEEDHUB_LOG_FORMAT`: logging (default: info, pretty)
//! - `RUST_LOG`: overrides the configured log level

use anyhow::Context;
use feedhub::api::{serve, AppState};
use feedhub::config::{Config, LoggingConfig};
use feedhub::connector::DecoderRegistry;
use feedhub::engine::FeedEngine;
use feedhub::hub::FanoutHub;
use feedhub::store::{FeedStore, MemoryStore};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_default();
    init_tracing(&config.logging);

    tracing::info!("Starting Feedhub v{}", env!("CARGO_PKG_VERSION"));

    // Catalog
    let store = match &config.store.catalog {
        Some(path) => {
            tracing::info!("Loading catalog from {}", path);
            MemoryStore::load(path).with_context(|| format!("failed to load catalog {}", path))?
        }
        None => {
            tracing::info!("No catalog configured, starting empty");
            MemoryStore::new()
        }
    };
    let store: Arc<dyn FeedStore> = Arc::new(store);

    // Hub and engine
    let hub = Arc::new(FanoutHub::new(config.hub.hub_config()));
    let engine = Arc::new(
        FeedEngine::new(store, hub)
            .with_decoders(DecoderRegistry::with_builtin())
            .with_adapter_options(config.adapter_options())
            .with_probe_timeout(config.connector.probe_timeout()),
    );

    let failures = engine.activate_all().await?;
    let summary = engine.summary().await;
    tracing::info!(
        active = summary.active_feeds,
        failed = failures.len(),
        "Feeds activated"
    );

    // Run server
    let state = AppState::new(Arc::clone(&engine), config.api.clone());
    serve(state, &config.api).await?;

    // Graceful shutdown
    tracing::info!("Stopping feeds...");
    engine.shutdown().await;
    tracing::info!("Feedhub stopped");

    Ok(())
}

/// `RUST_LOG` wins over the configured level
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("feedhub={},tower_http=info", logging.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.is_json() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

//! # Feedhub
//!
//! Feed connector and filter engine. Feedhub holds long-lived connections to
//! external data sources, normalizes what they emit into events, and fans the
//! events out to subscribers, each optionally narrowed by a saved filter.
//!
//! ## Features
//!
//! - **Three protocols**: WebSocket streams, HTTP polling and protobuf frames
//! - **Reconnection**: exponential backoff with a terminal failed state
//! - **Transforms**: sandboxed response scripts for polled feeds
//! - **Filters**: AND/OR rule groups with per-record array filtering
//! - **Fan-out**: bounded per-subscriber channels that never block a feed
//!
//! ## Modules
//!
//! - [`feed`]: connection config types and validation
//! - [`connector`]: protocol adapters, reconnection and the connection probe
//! - [`normalize`]: raw payload to event normalization
//! - [`filter`]: filter model, evaluation and field discovery
//! - [`hub`]: subscriber fan-out and the event stream endpoint
//! - [`engine`]: feed lifecycle orchestration
//! - [`store`]: feed and filter catalog
//! - [`api`]: REST API server with Axum
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use feedhub::{FanoutHub, FeedEngine, HubConfig, MemoryStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::load("catalog.json")?);
//!     let hub = Arc::new(FanoutHub::new(HubConfig::default()));
//!     let engine = FeedEngine::new(store, hub.clone());
//!
//!     // Start every feed marked active in the catalog
//!     for (feed_id, error) in engine.activate_all().await? {
//!         eprintln!("{} failed to start: {}", feed_id, error);
//!     }
//!
//!     engine.subscribe("btc-ticker", "dashboard").await?;
//!     println!("{} subscribers", hub.subscription_count("btc-ticker").await);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod connector;
pub mod engine;
pub mod feed;
pub mod filter;
pub mod hub;
pub mod normalize;
pub mod store;
pub mod transform;
pub mod value;

// Re-export top-level types for convenience
pub use feed::{
    Authentication, FeedConfigError, FeedConnectionConfig, FeedId, HttpPollingSettings,
    ProtocolConfig, ReconnectionConfig, StreamSettings,
};

pub use connector::{
    test_connection, ConnectionPhase, ConnectionState, ConnectorError, DecoderRegistry,
    FeedStatsSnapshot, TestResult,
};

pub use normalize::{normalize, NormalizedEvent, RawPayload};

pub use filter::{
    available_fields, evaluate, CompiledFilter, FieldInfo, FilterError, FilterOutcome, FilterSet,
};

pub use hub::{FanoutHub, HubConfig, HubError, HubStats, OutboundEvent};

pub use engine::{EngineError, FeedEngine, FeedStatus};

pub use store::{FeedRecord, FeedStore, MemoryStore, StoreError};

pub use api::{build_router, serve, ApiError, AppState};

pub use config::{Config, ConfigError, LoggingConfig};

//! Feed Engine
//!
//! The library facade: owns the running connectors, the fan-out hub and the
//! catalog store, and exposes the feed lifecycle and subscription operations
//! used by the HTTP API and the CLI.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::connector::{
    build_adapter, test_connection, AdapterOptions, ConnectionPhase, ConnectionState, ConnectorError,
    DecoderRegistry, EventSink, FeedRunner, FeedStatsSnapshot, RunnerHandle, TestResult,
};
use crate::feed::{FeedConnectionConfig, FeedId};
use crate::filter::{available_fields, CompiledFilter, FieldInfo, FilterError, FilterSet};
use crate::hub::{FanoutHub, HubError};
use crate::store::{FeedStore, StoreError};

/// Default bound on a connection test
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Status of one feed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatus {
    pub id: FeedId,
    pub name: String,
    pub protocol: &'static str,
    pub active: bool,
    pub state: ConnectionState,
    /// Present while a connector is running
    pub stats: Option<FeedStatsSnapshot>,
    pub subscribers: usize,
}

/// Counts for health reporting
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSummary {
    pub active_feeds: usize,
    pub connected_feeds: usize,
    pub failed_feeds: usize,
}

/// Runs feeds and routes their events to subscribers
pub struct FeedEngine {
    store: Arc<dyn FeedStore>,
    hub: Arc<FanoutHub>,
    decoders: DecoderRegistry,
    options: AdapterOptions,
    probe_timeout: Duration,
    connectors: RwLock<HashMap<FeedId, RunnerHandle>>,
}

impl FeedEngine {
    pub fn new(store: Arc<dyn FeedStore>, hub: Arc<FanoutHub>) -> Self {
        Self {
            store,
            hub,
            decoders: DecoderRegistry::with_builtin(),
            options: AdapterOptions::default(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            connectors: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_decoders(mut self, decoders: DecoderRegistry) -> Self {
        self.decoders = decoders;
        self
    }

    pub fn with_adapter_options(mut self, options: AdapterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn hub(&self) -> &Arc<FanoutHub> {
        &self.hub
    }

    pub fn store(&self) -> &Arc<dyn FeedStore> {
        &self.store
    }

    pub fn decoders(&self) -> &DecoderRegistry {
        &self.decoders
    }

    /// Probe an unsaved config. Never registers anything.
    pub async fn test_connection(&self, config: &FeedConnectionConfig) -> TestResult {
        test_connection(config, &self.decoders, &self.options, self.probe_timeout).await
    }

    /// Start (or restart) the connector for a stored feed.
    ///
    /// Configuration errors are returned here and never reach the runner.
    pub async fn activate_feed(&self, feed_id: &str) -> Result<(), EngineError> {
        let config = self
            .store
            .get_feed_config(feed_id)
            .await?
            .ok_or_else(|| EngineError::FeedNotFound(feed_id.to_string()))?;

        let adapter = build_adapter(&config, &self.decoders, &self.options)?;
        let sink: Arc<dyn EventSink> = self.hub.clone();

        // The old runner is fully stopped before the new one connects
        let mut connectors = self.connectors.write().await;
        let restarted = match connectors.remove(feed_id) {
            Some(previous) => {
                previous.stop().await;
                true
            }
            None => false,
        };

        let handle = FeedRunner::new(feed_id, adapter, sink)
            .with_reconnection(config.reconnection())
            .spawn();
        connectors.insert(feed_id.to_string(), handle);

        if restarted {
            info!(feed_id = %feed_id, "Feed restarted");
        } else {
            info!(feed_id = %feed_id, protocol = config.protocol_name(), "Feed activated");
        }
        Ok(())
    }

    /// Stop a feed's connector. Dropping the handle aborts the task, which
    /// closes the socket or cancels the poll timer and in-flight request.
    pub async fn deactivate_feed(&self, feed_id: &str) -> Result<(), EngineError> {
        let handle = self
            .connectors
            .write()
            .await
            .remove(feed_id)
            .ok_or_else(|| EngineError::NotActive(feed_id.to_string()))?;
        drop(handle);

        info!(feed_id = %feed_id, "Feed deactivated");
        Ok(())
    }

    /// Activate every feed the store marks active; failures are logged and
    /// returned, and do not stop the others
    pub async fn activate_all(&self) -> Result<Vec<(FeedId, EngineError)>, EngineError> {
        let mut failures = Vec::new();
        for feed_id in self.store.list_active_feeds().await? {
            if let Err(e) = self.activate_feed(&feed_id).await {
                warn!(feed_id = %feed_id, error = %e, "Feed failed to activate");
                failures.push((feed_id, e));
            }
        }
        Ok(failures)
    }

    /// Connection state; `disconnected` for inactive feeds
    pub async fn feed_state(&self, feed_id: &str) -> ConnectionState {
        match self.connectors.read().await.get(feed_id) {
            Some(handle) => handle.state().await,
            None => ConnectionState::default(),
        }
    }

    pub async fn feed_status(&self, feed_id: &str) -> Result<FeedStatus, EngineError> {
        let record = self
            .store
            .get_feed(feed_id)
            .await?
            .ok_or_else(|| EngineError::FeedNotFound(feed_id.to_string()))?;

        let connectors = self.connectors.read().await;
        let (state, stats) = match connectors.get(feed_id) {
            Some(handle) => (handle.state().await, Some(handle.stats().snapshot())),
            None => (ConnectionState::default(), None),
        };

        Ok(FeedStatus {
            id: record.id,
            name: record.name,
            protocol: record.config.protocol_name(),
            active: stats.is_some(),
            state,
            stats,
            subscribers: self.hub.subscription_count(feed_id).await,
        })
    }

    /// Status of every stored feed, sorted by ID
    pub async fn list_feeds(&self) -> Result<Vec<FeedStatus>, EngineError> {
        let mut statuses = Vec::new();
        for record in self.store.list_feeds().await? {
            statuses.push(self.feed_status(&record.id).await?);
        }
        Ok(statuses)
    }

    /// Field paths of the last event an active feed delivered; empty until
    /// the first event
    pub async fn feed_fields(&self, feed_id: &str) -> Result<Vec<FieldInfo>, EngineError> {
        let connectors = self.connectors.read().await;
        let handle = connectors
            .get(feed_id)
            .ok_or_else(|| EngineError::NotActive(feed_id.to_string()))?;

        Ok(handle
            .stats()
            .last_payload()
            .await
            .map(|payload| available_fields(&payload))
            .unwrap_or_default())
    }

    /// IDs of feeds with a running connector, sorted
    pub async fn active_feeds(&self) -> Vec<FeedId> {
        let mut ids: Vec<FeedId> = self.connectors.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn summary(&self) -> EngineSummary {
        let connectors = self.connectors.read().await;
        let mut summary = EngineSummary {
            active_feeds: connectors.len(),
            ..Default::default()
        };
        for handle in connectors.values() {
            let state = handle.state().await;
            if state.is_terminal() {
                summary.failed_feeds += 1;
            } else if state.phase == ConnectionPhase::Connected {
                summary.connected_feeds += 1;
            }
        }
        summary
    }

    /// Subscribe to a stored feed, restoring a persisted filter binding
    pub async fn subscribe(&self, feed_id: &str, subscriber_id: &str) -> Result<(), EngineError> {
        if self.store.get_feed(feed_id).await?.is_none() {
            return Err(EngineError::FeedNotFound(feed_id.to_string()));
        }

        if self.hub.subscribe(feed_id, subscriber_id).await {
            if let Some(set) = self
                .store
                .get_active_filter_for_subscription(feed_id, subscriber_id)
                .await?
            {
                self.hub
                    .set_filter(feed_id, subscriber_id, Some(compile(&set)?))
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, feed_id: &str, subscriber_id: &str) -> Result<(), EngineError> {
        self.hub.unsubscribe(feed_id, subscriber_id).await?;
        Ok(())
    }

    /// Bind a stored filter to a subscription (replacing any previous one),
    /// or unbind with `None`. Returns the bound filter.
    pub async fn set_subscription_filter(
        &self,
        feed_id: &str,
        subscriber_id: &str,
        filter_id: Option<&str>,
    ) -> Result<Option<FilterSet>, EngineError> {
        let set = match filter_id {
            Some(filter_id) => Some(
                self.store
                    .get_filter_set(filter_id)
                    .await?
                    .ok_or_else(|| EngineError::FilterNotFound(filter_id.to_string()))?,
            ),
            None => None,
        };
        let compiled = set.as_ref().map(compile).transpose()?;

        // Persist first so a failed write leaves the live binding untouched
        if !self.hub.is_subscribed(feed_id, subscriber_id).await {
            return Err(HubError::not_found(feed_id, subscriber_id).into());
        }
        self.store
            .bind_subscription_filter(feed_id, subscriber_id, filter_id)
            .await?;
        self.hub.set_filter(feed_id, subscriber_id, compiled).await?;
        Ok(set)
    }

    /// Stop every connector
    pub async fn shutdown(&self) {
        let mut connectors = self.connectors.write().await;
        let count = connectors.len();
        connectors.clear();
        info!(feeds = count, "Engine stopped");
    }
}

fn compile(set: &FilterSet) -> Result<Arc<CompiledFilter>, EngineError> {
    set.validate()?;
    Ok(Arc::new(CompiledFilter::compile(set)))
}

/// Engine operation errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Feed not found: {0}")]
    FeedNotFound(String),

    #[error("Filter not found: {0}")]
    FilterNotFound(String),

    #[error("Feed is not active: {0}")]
    NotActive(String),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("Invalid filter: {0}")]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Hub(#[from] HubError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{ProtobufSettings, ProtocolConfig, StreamSettings};
    use crate::filter::{Condition, FilterGroup, FilterRule, Operator, RuleValue};
    use crate::hub::HubConfig;
    use crate::store::{FeedRecord, MemoryStore};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    /// Serves `frames` to every connection, then holds the socket open
    async fn ticker(frames: Vec<&'static str>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let frames = frames.clone();
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    // Give the test time to connect its subscriber
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    for frame in frames {
                        ws.send(WsMessage::Text(frame.into())).await.unwrap();
                    }
                    while ws.next().await.is_some() {}
                });
            }
        });
        addr
    }

    async fn engine_with(feeds: Vec<FeedRecord>, filters: Vec<FilterSet>) -> FeedEngine {
        let store = MemoryStore::new();
        for feed in feeds {
            store.put_feed(feed).await.unwrap();
        }
        for filter in filters {
            store.put_filter(filter).await.unwrap();
        }
        FeedEngine::new(Arc::new(store), Arc::new(FanoutHub::new(HubConfig::default())))
    }

    fn ws_feed(id: &str, url: String, event_name: &str) -> FeedRecord {
        FeedRecord {
            id: id.into(),
            name: id.to_uppercase(),
            active: true,
            config: FeedConnectionConfig::websocket(url, Some(event_name)),
        }
    }

    fn movers() -> FilterSet {
        FilterSet::new("movers", "Big movers").with_group(FilterGroup::new(
            Condition::And,
            vec![FilterRule::new("changePercent24h", Operator::GreaterThan, RuleValue::scalar(3))],
        ))
    }

    #[tokio::test]
    async fn test_filtered_round_trip() {
        let addr = ticker(vec![
            r#"{"event":"heartbeat"}"#,
            r#"{"symbol":"BTC","price":50000,"changePercent24h":4}"#,
        ])
        .await;
        let engine = engine_with(vec![ws_feed("btc", format!("ws://{}/", addr), "tick")], vec![movers()]).await;

        let (_, mut rx) = engine.hub().connect("desk").await.unwrap();
        engine.subscribe("btc", "desk").await.unwrap();
        engine
            .set_subscription_filter("btc", "desk", Some("movers"))
            .await
            .unwrap();
        engine.activate_feed("btc").await.unwrap();

        let outbound = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outbound.feed_id, "btc");
        assert_eq!(outbound.event_name, "tick");
        assert_eq!(outbound.data["symbol"], "BTC");
        let summary = outbound.filter.unwrap();
        assert!(summary.filter_applied);
        assert_eq!((summary.match_count, summary.total_count), (1, 1));

        let status = engine.feed_status("btc").await.unwrap();
        assert!(status.active);
        assert_eq!(status.state.phase, ConnectionPhase::Connected);
        assert_eq!(status.subscribers, 1);

        let fields = engine.feed_fields("btc").await.unwrap();
        assert!(fields.iter().any(|f| f.path == "changePercent24h"));

        engine.deactivate_feed("btc").await.unwrap();
        assert_eq!(engine.feed_state("btc").await.phase, ConnectionPhase::Disconnected);
        assert!(!engine.feed_status("btc").await.unwrap().active);
    }

    #[tokio::test]
    async fn test_persisted_binding_restored_on_subscribe() {
        let engine = engine_with(
            vec![ws_feed("btc", "ws://127.0.0.1:9/".into(), "tick")],
            vec![movers()],
        )
        .await;
        engine
            .store()
            .bind_subscription_filter("btc", "desk", Some("movers"))
            .await
            .unwrap();

        engine.subscribe("btc", "desk").await.unwrap();
        let bound = engine.hub().filter_for("btc", "desk").await.unwrap();
        assert_eq!(bound.name(), "Big movers");

        engine.set_subscription_filter("btc", "desk", None).await.unwrap();
        assert!(engine.hub().filter_for("btc", "desk").await.is_none());
    }

    #[tokio::test]
    async fn test_activation_errors() {
        let bad_proto = FeedRecord {
            id: "proto".into(),
            name: String::new(),
            active: true,
            config: FeedConnectionConfig {
                url: "ws://127.0.0.1:9/".into(),
                headers: Vec::new(),
                query_params: Vec::new(),
                protocol: ProtocolConfig::Protobuf(ProtobufSettings {
                    stream: StreamSettings::default(),
                    protobuf_type: "acme.Unknown".into(),
                }),
            },
        };
        let engine = engine_with(vec![bad_proto], Vec::new()).await;

        assert!(matches!(
            engine.activate_feed("missing").await,
            Err(EngineError::FeedNotFound(_))
        ));
        match engine.activate_feed("proto").await {
            Err(EngineError::Connector(e)) => assert!(e.is_config()),
            other => panic!("expected config error, got {:?}", other),
        }
        assert!(engine.active_feeds().await.is_empty());

        let failures = engine.activate_all().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "proto");
    }

    #[tokio::test]
    async fn test_subscription_errors() {
        let engine = engine_with(vec![ws_feed("btc", "ws://127.0.0.1:9/".into(), "tick")], vec![movers()]).await;

        assert!(matches!(
            engine.subscribe("nope", "desk").await,
            Err(EngineError::FeedNotFound(_))
        ));
        assert!(matches!(
            engine.set_subscription_filter("btc", "desk", Some("movers")).await,
            Err(EngineError::Hub(_))
        ));

        engine.subscribe("btc", "desk").await.unwrap();
        assert!(matches!(
            engine.set_subscription_filter("btc", "desk", Some("ghost")).await,
            Err(EngineError::FilterNotFound(_))
        ));
        assert!(matches!(
            engine.deactivate_feed("btc").await,
            Err(EngineError::NotActive(_))
        ));

        engine.unsubscribe("btc", "desk").await.unwrap();
        assert!(engine.unsubscribe("btc", "desk").await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_feed_fails_after_retries() {
        let mut feed = ws_feed("dead", "ws://127.0.0.1:9/".into(), "tick");
        if let ProtocolConfig::Websocket(stream) = &mut feed.config.protocol {
            stream.reconnection.delay_ms = 10;
            stream.reconnection.max_attempts = 2;
        }
        let engine = engine_with(vec![feed], Vec::new()).await;
        engine.activate_feed("dead").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let state = engine.feed_state("dead").await;
            if state.is_terminal() {
                assert_eq!(state.attempt, 3);
                assert!(state.last_error.is_some());
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "feed never failed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(engine.summary().await.failed_feeds, 1);

        engine.shutdown().await;
        assert!(engine.active_feeds().await.is_empty());
    }

    /// Streams `{"conn": n}` frames every 20ms, numbering connections from 1
    async fn counting_ticker() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut conn = 0u64;
            while let Ok((stream, _)) = listener.accept().await {
                conn += 1;
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    loop {
                        let frame = json!({"conn": conn}).to_string();
                        if ws.send(WsMessage::Text(frame)).await.is_err() {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_restart_stops_old_runner_first() {
        let addr = counting_ticker().await;
        let engine = engine_with(vec![ws_feed("btc", format!("ws://{}/", addr), "tick")], Vec::new()).await;
        let (_, mut rx) = engine.hub().connect("desk").await.unwrap();
        engine.subscribe("btc", "desk").await.unwrap();

        engine.activate_feed("btc").await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.data["conn"], 1);

        engine.activate_feed("btc").await.unwrap();
        // Anything from the first connection was queued before the restart returned
        while rx.try_recv().is_ok() {}

        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.data["conn"], 2);
        }
        assert_eq!(engine.active_feeds().await, vec!["btc".to_string()]);
    }

    /// Delegates to a [`MemoryStore`] but refuses binding writes
    struct ReadOnlyBindings(MemoryStore);

    #[async_trait::async_trait]
    impl FeedStore for ReadOnlyBindings {
        async fn get_feed(&self, feed_id: &str) -> Result<Option<FeedRecord>, StoreError> {
            self.0.get_feed(feed_id).await
        }

        async fn list_active_feeds(&self) -> Result<Vec<FeedId>, StoreError> {
            self.0.list_active_feeds().await
        }

        async fn list_feeds(&self) -> Result<Vec<FeedRecord>, StoreError> {
            self.0.list_feeds().await
        }

        async fn get_filter_set(&self, filter_id: &str) -> Result<Option<FilterSet>, StoreError> {
            self.0.get_filter_set(filter_id).await
        }

        async fn get_active_filter_for_subscription(
            &self,
            feed_id: &str,
            subscriber_id: &str,
        ) -> Result<Option<FilterSet>, StoreError> {
            self.0.get_active_filter_for_subscription(feed_id, subscriber_id).await
        }

        async fn bind_subscription_filter(
            &self,
            _feed_id: &str,
            _subscriber_id: &str,
            _filter_id: Option<&str>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "catalog is read-only",
            )))
        }
    }

    #[tokio::test]
    async fn test_failed_binding_write_leaves_hub_unchanged() {
        let store = MemoryStore::new();
        store
            .put_feed(ws_feed("btc", "ws://127.0.0.1:9/".into(), "tick"))
            .await
            .unwrap();
        store.put_filter(movers()).await.unwrap();
        let engine = FeedEngine::new(
            Arc::new(ReadOnlyBindings(store)),
            Arc::new(FanoutHub::new(HubConfig::default())),
        );

        engine.subscribe("btc", "desk").await.unwrap();
        let err = engine
            .set_subscription_filter("btc", "desk", Some("movers"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Io(_))));
        assert!(engine.hub().filter_for("btc", "desk").await.is_none());
    }

    #[tokio::test]
    async fn test_probe_does_not_register() {
        let engine = engine_with(Vec::new(), Vec::new())
            .await
            .with_probe_timeout(Duration::from_millis(500));
        let result = engine
            .test_connection(&FeedConnectionConfig::websocket("ws://127.0.0.1:9/", None))
            .await;

        assert!(!result.success);
        assert!(engine.active_feeds().await.is_empty());
        assert_eq!(engine.hub().stats().await.subscriptions, 0);
    }
}

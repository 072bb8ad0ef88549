//! Feed Runner
//!
//! One task per active feed. The runner opens the adapter, normalizes each
//! payload and publishes it to the sink in arrival order, and drives the
//! reconnection state machine when the session ends. Aborting the task
//! releases the session and any pending backoff timer.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::reconnect::ConnectionState;
use super::{AdapterEvent, AdapterSession, EventSink, ProtocolAdapter};
use crate::feed::{FeedId, ReconnectionConfig};
use crate::normalize::normalize;

/// Counters for one feed
#[derive(Debug, Default)]
pub struct FeedStats {
    events_received: AtomicU64,
    events_dropped: AtomicU64,
    errors: AtomicU64,
    last_event_ms: AtomicI64,
    last_payload: RwLock<Option<Value>>,
}

/// Point-in-time copy of [`FeedStats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatsSnapshot {
    pub events_received: u64,
    /// Payloads the normalizer rejected
    pub events_dropped: u64,
    /// Adapter-reported errors: decode failures, failed polls
    pub errors: u64,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl FeedStats {
    pub fn snapshot(&self) -> FeedStatsSnapshot {
        let last = self.last_event_ms.load(Ordering::Relaxed);
        FeedStatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_event_at: if last > 0 {
                Utc.timestamp_millis_opt(last).single()
            } else {
                None
            },
        }
    }

    /// Payload of the most recent event, for field introspection
    pub async fn last_payload(&self) -> Option<Value> {
        self.last_payload.read().await.clone()
    }

    async fn record_event(&self, timestamp: DateTime<Utc>, payload: &Value) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        self.last_event_ms
            .store(timestamp.timestamp_millis(), Ordering::Relaxed);
        *self.last_payload.write().await = Some(payload.clone());
    }
}

/// Handle to a running feed task. Dropping it stops the feed.
#[derive(Debug)]
pub struct RunnerHandle {
    task: JoinHandle<()>,
    state: Arc<RwLock<ConnectionState>>,
    stats: Arc<FeedStats>,
    protocol: &'static str,
}

impl RunnerHandle {
    pub async fn state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    pub fn stats(&self) -> &Arc<FeedStats> {
        &self.stats
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    /// Whether the task has ended, which only happens in `failed`
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the feed task
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Cancel the feed task and wait until it has stopped publishing
    pub async fn stop(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for RunnerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Drives one feed's adapter
pub struct FeedRunner {
    feed_id: FeedId,
    adapter: Arc<dyn ProtocolAdapter>,
    sink: Arc<dyn EventSink>,
    policy: ReconnectionConfig,
    state: Arc<RwLock<ConnectionState>>,
    stats: Arc<FeedStats>,
}

impl FeedRunner {
    pub fn new(feed_id: impl Into<FeedId>, adapter: Arc<dyn ProtocolAdapter>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            feed_id: feed_id.into(),
            adapter,
            sink,
            policy: ReconnectionConfig::default(),
            state: Arc::new(RwLock::new(ConnectionState::default())),
            stats: Arc::new(FeedStats::default()),
        }
    }

    pub fn with_reconnection(mut self, policy: ReconnectionConfig) -> Self {
        self.policy = policy;
        self
    }

    /// Start the feed task
    pub fn spawn(self) -> RunnerHandle {
        let state = Arc::clone(&self.state);
        let stats = Arc::clone(&self.stats);
        let protocol = self.adapter.protocol();
        let task = tokio::spawn(self.run());

        RunnerHandle {
            task,
            state,
            stats,
            protocol,
        }
    }

    fn polls(&self) -> bool {
        self.adapter.protocol() == "http-polling"
    }

    async fn transition(&self, f: impl FnOnce(&ConnectionState) -> ConnectionState) -> ConnectionState {
        let mut state = self.state.write().await;
        *state = f(&state);
        state.clone()
    }

    async fn run(self) {
        self.transition(ConnectionState::activate).await;

        loop {
            let reason = match self.adapter.open().await {
                Ok(mut session) => {
                    self.transition(ConnectionState::opened).await;
                    info!(
                        feed_id = %self.feed_id,
                        protocol = self.adapter.protocol(),
                        "Feed connected"
                    );
                    self.pump(&mut session).await
                }
                Err(e) if e.is_config() => {
                    let disabled = ReconnectionConfig {
                        enabled: false,
                        ..self.policy
                    };
                    let reason = e.to_string();
                    self.transition(|s| s.failed(reason, &disabled).0).await;
                    error!(feed_id = %self.feed_id, error = %e, "Feed configuration rejected");
                    return;
                }
                Err(e) => e.to_string(),
            };

            let policy = self.policy;
            let mut delay = None;
            let state = self
                .transition(|s| {
                    let (next, wait) = s.failed(reason.clone(), &policy);
                    delay = wait;
                    next
                })
                .await;

            match delay {
                Some(delay) => {
                    warn!(
                        feed_id = %self.feed_id,
                        attempt = state.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Feed disconnected, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                    self.transition(ConnectionState::retry).await;
                }
                None => {
                    error!(
                        feed_id = %self.feed_id,
                        attempt = state.attempt,
                        error = %reason,
                        "Feed failed, re-activation required"
                    );
                    return;
                }
            }
        }
    }

    /// Forward session events until it closes; returns the close reason
    async fn pump(&self, session: &mut AdapterSession) -> String {
        let format = self.adapter.payload_format();
        let event_name = self.adapter.event_name().to_string();
        let polls = self.polls();

        while let Some(event) = session.next().await {
            match event {
                AdapterEvent::Data(raw) => match normalize(&self.feed_id, &event_name, raw, format) {
                    Ok(event) => {
                        self.stats.record_event(event.timestamp, &event.payload).await;
                        if polls {
                            self.transition(ConnectionState::poll_succeeded).await;
                        }
                        self.sink.publish(event).await;
                    }
                    Err(e) => {
                        self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(feed_id = %self.feed_id, error = %e, "Dropping undecodable event");
                    }
                },
                AdapterEvent::Error(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    if polls {
                        let state = self.transition(|s| s.poll_failed(e.clone())).await;
                        warn!(
                            feed_id = %self.feed_id,
                            consecutive_failures = state.attempt,
                            error = %e,
                            "Poll failed"
                        );
                    } else {
                        debug!(feed_id = %self.feed_id, error = %e, "Dropping frame");
                    }
                }
                AdapterEvent::Closed(reason) => {
                    return reason.unwrap_or_else(|| "closed by peer".to_string());
                }
            }
        }

        "session ended".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::reconnect::ConnectionPhase;
    use crate::connector::{ConnectorError, Handshake};
    use crate::feed::PayloadFormat;
    use crate::normalize::{NormalizedEvent, RawPayload};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::{mpsc, Mutex};

    type Script = Result<Vec<AdapterEvent>, String>;

    struct ScriptedAdapter {
        protocol: &'static str,
        opens: Mutex<VecDeque<Script>>,
        hold_open: bool,
    }

    impl ScriptedAdapter {
        fn new(protocol: &'static str, opens: Vec<Script>, hold_open: bool) -> Arc<Self> {
            Arc::new(Self {
                protocol,
                opens: Mutex::new(opens.into()),
                hold_open,
            })
        }
    }

    #[async_trait]
    impl ProtocolAdapter for ScriptedAdapter {
        fn protocol(&self) -> &'static str {
            self.protocol
        }

        fn payload_format(&self) -> PayloadFormat {
            PayloadFormat::Json
        }

        fn event_name(&self) -> &str {
            "tick"
        }

        async fn open(&self) -> Result<AdapterSession, ConnectorError> {
            let script = self
                .opens
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err("no more scripted opens".into()));
            let events = script.map_err(ConnectorError::ConnectionFailed)?;

            let (tx, rx) = mpsc::channel(16);
            let hold_open = self.hold_open;
            let task = tokio::spawn(async move {
                for event in events {
                    let _ = tx.send(event).await;
                }
                if hold_open {
                    std::future::pending::<()>().await;
                }
            });
            Ok(AdapterSession::new(rx, task, Handshake::default()))
        }
    }

    #[derive(Default)]
    struct CollectSink {
        events: Mutex<Vec<NormalizedEvent>>,
    }

    #[async_trait]
    impl EventSink for CollectSink {
        async fn publish(&self, event: NormalizedEvent) {
            self.events.lock().await.push(event);
        }
    }

    fn policy(max_attempts: u32) -> ReconnectionConfig {
        ReconnectionConfig {
            enabled: true,
            delay_ms: 10,
            max_attempts,
        }
    }

    async fn wait_for(handle: &RunnerHandle, check: impl Fn(&ConnectionState) -> bool) -> ConnectionState {
        for _ in 0..200 {
            let state = handle.state().await;
            if check(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("state never reached: {:?}", handle.state().await);
    }

    #[tokio::test]
    async fn test_fails_after_max_attempts() {
        let adapter = ScriptedAdapter::new(
            "websocket",
            vec![Err("refused".into()), Err("refused".into()), Err("refused".into())],
            false,
        );
        let sink = Arc::new(CollectSink::default());
        let mut handle = FeedRunner::new("btc", adapter, sink)
            .with_reconnection(policy(2))
            .spawn();

        tokio::time::timeout(Duration::from_secs(2), &mut handle.task)
            .await
            .unwrap()
            .unwrap();

        let state = handle.state().await;
        assert_eq!(state.phase, ConnectionPhase::Failed);
        assert_eq!(state.attempt, 3);
        assert!(state.last_error.unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn test_normalizes_in_order_and_drops_bad_frames() {
        let adapter = ScriptedAdapter::new(
            "websocket",
            vec![Ok(vec![
                AdapterEvent::Data(RawPayload::Text(r#"{"a": 1}"#.into())),
                AdapterEvent::Data(RawPayload::Text("{broken".into())),
                AdapterEvent::Data(RawPayload::Text(r#"{"a": 2}"#.into())),
                AdapterEvent::Closed(None),
            ])],
            false,
        );
        let sink = Arc::new(CollectSink::default());
        let mut handle = FeedRunner::new("btc", adapter, sink.clone())
            .with_reconnection(policy(0))
            .spawn();

        tokio::time::timeout(Duration::from_secs(2), &mut handle.task)
            .await
            .unwrap()
            .unwrap();

        let events = sink.events.lock().await;
        let payloads: Vec<_> = events.iter().map(|e| e.payload.clone()).collect();
        assert_eq!(payloads, vec![json!({"a": 1}), json!({"a": 2})]);
        assert!(events.iter().all(|e| e.feed_id == "btc" && e.event_name == "tick"));

        let stats = handle.stats().snapshot();
        assert_eq!(stats.events_received, 2);
        assert_eq!(stats.events_dropped, 1);
        assert!(stats.last_event_at.is_some());
        assert_eq!(handle.stats().last_payload().await, Some(json!({"a": 2})));
    }

    #[tokio::test]
    async fn test_reconnects_after_disconnect() {
        let adapter = ScriptedAdapter::new(
            "websocket",
            vec![
                Ok(vec![AdapterEvent::Closed(Some("reset".into()))]),
                Ok(vec![AdapterEvent::Data(RawPayload::Text(r#"{"a": 1}"#.into()))]),
            ],
            true,
        );
        let sink = Arc::new(CollectSink::default());
        let handle = FeedRunner::new("btc", adapter, sink.clone())
            .with_reconnection(policy(3))
            .spawn();

        let state = wait_for(&handle, |s| {
            s.phase == ConnectionPhase::Connected && handle.stats().snapshot().events_received == 1
        })
        .await;
        assert_eq!(state.attempt, 0);
        assert_eq!(sink.events.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_poll_failures_are_a_health_signal() {
        let adapter = ScriptedAdapter::new(
            "http-polling",
            vec![Ok(vec![
                AdapterEvent::Error("HTTP 503".into()),
                AdapterEvent::Error("timeout".into()),
            ])],
            true,
        );
        let sink = Arc::new(CollectSink::default());
        let handle = FeedRunner::new("rest", adapter, sink).spawn();

        let state = wait_for(&handle, |s| s.attempt == 2).await;
        assert_eq!(state.phase, ConnectionPhase::Connected);
        assert_eq!(state.last_error.as_deref(), Some("timeout"));
        assert_eq!(handle.stats().snapshot().errors, 2);
    }

    #[tokio::test]
    async fn test_abort_stops_feed() {
        let adapter = ScriptedAdapter::new("websocket", vec![Ok(vec![])], true);
        let sink = Arc::new(CollectSink::default());
        let handle = FeedRunner::new("btc", adapter, sink).spawn();

        wait_for(&handle, |s| s.phase == ConnectionPhase::Connected).await;
        handle.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_stop_waits_for_task() {
        let adapter = ScriptedAdapter::new("websocket", vec![Ok(vec![])], true);
        let sink = Arc::new(CollectSink::default());
        let handle = FeedRunner::new("btc", adapter, sink).spawn();
        let state = Arc::clone(&handle.state);

        wait_for(&handle, |s| s.phase == ConnectionPhase::Connected).await;
        handle.stop().await;
        // The task has released its clone of the state
        assert_eq!(Arc::strong_count(&state), 1);
    }
}

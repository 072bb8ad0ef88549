//! Feed Connectors
//!
//! A connector is a running protocol adapter plus its reconnection controller.
//!
//! - [`ProtocolAdapter`]: opens an [`AdapterSession`] from a feed config. A
//!   session yields [`AdapterEvent`]s over a channel and releases its socket,
//!   timers and in-flight requests when dropped.
//! - [`websocket`], [`http_poll`], [`protobuf`]: the adapter variants.
//! - [`reconnect`]: the connection state machine as pure transitions.
//! - [`runner`]: drives one feed: open, normalize, publish, back off, retry.
//! - [`probe`]: one-shot connection test for unsaved configs.

mod error;
pub mod http_poll;
pub mod probe;
pub mod protobuf;
pub mod reconnect;
pub mod runner;
pub mod websocket;

pub use error::ConnectorError;
pub use http_poll::HttpPollAdapter;
pub use probe::{test_connection, Diagnostics, TestResult};
pub use protobuf::{DecoderRegistry, MessageDecoder};
pub use reconnect::{ConnectionPhase, ConnectionState};
pub use runner::{FeedRunner, FeedStats, FeedStatsSnapshot, RunnerHandle};
pub use websocket::WebSocketAdapter;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::feed::{FeedConnectionConfig, PayloadFormat, ProtocolConfig};
use crate::normalize::{NormalizedEvent, RawPayload};
use crate::transform::TransformLimits;

/// Outcome emitted by an adapter session
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// A payload for the normalizer
    Data(RawPayload),
    /// A non-fatal failure: decode error, failed poll tick
    Error(String),
    /// The session ended, with a reason when it ended abnormally
    Closed(Option<String>),
}

/// What the adapter saw while opening the connection
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub url: String,
    pub protocol: String,
    /// Request headers sent, with credentials redacted
    pub headers: BTreeMap<String, String>,
    pub status_code: Option<u16>,
    /// Response headers, recorded before the body is read
    pub response_headers: BTreeMap<String, String>,
}

impl Handshake {
    pub(crate) fn new(url: &str, protocol: &str) -> Self {
        Self {
            url: url.to_string(),
            protocol: protocol.to_string(),
            headers: BTreeMap::new(),
            status_code: None,
            response_headers: BTreeMap::new(),
        }
    }

    pub(crate) fn record_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), redact(name, value));
    }

    /// Status line and headers of the response, as soon as they arrive
    pub(crate) fn record_response<'a>(
        &mut self,
        status: u16,
        headers: impl IntoIterator<Item = (&'a str, &'a [u8])>,
    ) {
        self.status_code = Some(status);
        for (name, value) in headers {
            let value = String::from_utf8_lossy(value);
            self.response_headers.insert(name.to_string(), redact(name, &value));
        }
    }
}

fn redact(name: &str, value: &str) -> String {
    let lowered = name.to_ascii_lowercase();
    if lowered == "authorization"
        || lowered.contains("key")
        || lowered.contains("token")
        || lowered.contains("cookie")
    {
        "[redacted]".to_string()
    } else {
        value.to_string()
    }
}

/// An open adapter connection.
///
/// Dropping the session aborts its background task, which closes the socket or
/// stops the poll timer and any in-flight request.
#[derive(Debug)]
pub struct AdapterSession {
    events: mpsc::Receiver<AdapterEvent>,
    task: JoinHandle<()>,
    handshake: Handshake,
}

impl AdapterSession {
    pub(crate) fn new(
        events: mpsc::Receiver<AdapterEvent>,
        task: JoinHandle<()>,
        handshake: Handshake,
    ) -> Self {
        Self {
            events,
            task,
            handshake,
        }
    }

    /// Next event; `None` once the session task has ended
    pub async fn next(&mut self) -> Option<AdapterEvent> {
        self.events.recv().await
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Tear down the session
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for AdapterSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Uniform contract implemented by every protocol variant
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// The `connectionType` label
    fn protocol(&self) -> &'static str;

    /// How text payloads from this adapter are decoded
    fn payload_format(&self) -> PayloadFormat;

    /// Event name stamped on normalized events
    fn event_name(&self) -> &str;

    /// Open a session. Stream adapters connect and send their handshake
    /// messages before returning; the HTTP adapter starts its poll timer.
    async fn open(&self) -> Result<AdapterSession, ConnectorError>;
}

/// Receives normalized events from running connectors, in source order
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: NormalizedEvent);
}

/// Tunables shared by all adapters
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// Capacity of a session's event channel
    pub channel_capacity: usize,
    /// Bound on WebSocket connect + upgrade
    pub connect_timeout: Duration,
    /// Limits for HTTP transform scripts
    pub transform_limits: TransformLimits,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            connect_timeout: Duration::from_secs(10),
            transform_limits: TransformLimits::default(),
        }
    }
}

/// Build the adapter for a config.
///
/// Validation and decoder lookup happen here, so configuration errors surface
/// at activation rather than mid-stream.
pub fn build_adapter(
    config: &FeedConnectionConfig,
    decoders: &DecoderRegistry,
    options: &AdapterOptions,
) -> Result<Arc<dyn ProtocolAdapter>, ConnectorError> {
    config.validate()?;

    let adapter: Arc<dyn ProtocolAdapter> = match &config.protocol {
        ProtocolConfig::Websocket(stream) => Arc::new(WebSocketAdapter::new(
            config.clone(),
            stream.clone(),
            options.clone(),
        )),
        ProtocolConfig::Protobuf(settings) => Arc::new(protobuf::protobuf_adapter(
            config.clone(),
            settings,
            decoders,
            options.clone(),
        )?),
        ProtocolConfig::HttpPolling(settings) => Arc::new(HttpPollAdapter::new(
            config.clone(),
            settings.clone(),
            options,
        )?),
    };

    Ok(adapter)
}

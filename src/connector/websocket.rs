//! WebSocket Adapter
//!
//! Connects with `tokio-tungstenite`, sends the configured handshake frames and
//! forwards inbound frames that match the feed's `eventName`. The protobuf
//! variant is this adapter with a binary frame decoder attached.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info};

use super::{AdapterEvent, AdapterOptions, AdapterSession, ConnectorError, Handshake, MessageDecoder, ProtocolAdapter};
use crate::feed::{FeedConfigError, FeedConnectionConfig, MessageFormat, PayloadFormat, StreamSettings};
use crate::normalize::RawPayload;

/// Object keys that name the event a frame belongs to
const ENVELOPE_KEYS: [&str; 4] = ["event", "type", "channel", "topic"];

/// Adapter for `websocket` feeds, and for `protobuf` feeds with a decoder
pub struct WebSocketAdapter {
    config: FeedConnectionConfig,
    stream: StreamSettings,
    options: AdapterOptions,
    decoder: Option<Arc<dyn MessageDecoder>>,
}

impl WebSocketAdapter {
    pub fn new(config: FeedConnectionConfig, stream: StreamSettings, options: AdapterOptions) -> Self {
        Self {
            config,
            stream,
            options,
            decoder: None,
        }
    }

    /// Decode binary frames with `decoder`
    pub fn with_decoder(mut self, decoder: Arc<dyn MessageDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Build the upgrade request: url, query params and enabled headers
    fn build_request(&self) -> Result<(Request<()>, Handshake), ConnectorError> {
        let url = self.config.request_url()?;
        let mut handshake = Handshake::new(url.as_str(), self.protocol());

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectorError::HandshakeFailed(e.to_string()))?;

        for header in self.config.enabled_headers() {
            let name = HeaderName::from_bytes(header.key.as_bytes())
                .map_err(|_| FeedConfigError::InvalidHeader(header.key.clone()))?;
            let value = HeaderValue::from_str(&header.value)
                .map_err(|_| FeedConfigError::InvalidHeader(header.key.clone()))?;
            request.headers_mut().append(name, value);
            handshake.record_header(&header.key, &header.value);
        }

        Ok((request, handshake))
    }

    fn handshake_messages(&self) -> impl Iterator<Item = &String> {
        self.stream
            .connection_message
            .iter()
            .chain(self.stream.connection_messages.iter())
            .filter(|message| !message.is_empty())
    }

    fn subscribed_event(&self) -> Option<String> {
        self.stream
            .event_name
            .as_ref()
            .filter(|name| !name.is_empty())
            .cloned()
    }
}

#[async_trait]
impl ProtocolAdapter for WebSocketAdapter {
    fn protocol(&self) -> &'static str {
        if self.decoder.is_some() {
            "protobuf"
        } else {
            "websocket"
        }
    }

    fn payload_format(&self) -> PayloadFormat {
        self.stream.message_format.into()
    }

    fn event_name(&self) -> &str {
        self.stream.event_name_or_default()
    }

    async fn open(&self) -> Result<AdapterSession, ConnectorError> {
        let (request, mut handshake) = self.build_request()?;
        let timeout = self.options.connect_timeout;

        let (socket, response) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| ConnectorError::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;
        handshake.record_response(
            response.status().as_u16(),
            response.headers().iter().map(|(name, value)| (name.as_str(), value.as_bytes())),
        );

        let (mut write, read) = socket.split();

        for message in self.handshake_messages() {
            write
                .send(WsMessage::Text(message.clone()))
                .await
                .map_err(|e| ConnectorError::HandshakeFailed(e.to_string()))?;
        }

        info!(
            url = %handshake.url,
            protocol = self.protocol(),
            "WebSocket connected"
        );

        let (tx, rx) = mpsc::channel(self.options.channel_capacity);
        let reader = FrameReader {
            event_name: self.subscribed_event(),
            format: self.stream.message_format,
            decoder: self.decoder.clone(),
        };
        let task = tokio::spawn(reader.run(write, read, tx));

        Ok(AdapterSession::new(rx, task, handshake))
    }
}

struct FrameReader {
    event_name: Option<String>,
    format: MessageFormat,
    decoder: Option<Arc<dyn MessageDecoder>>,
}

impl FrameReader {
    async fn run<W, R>(self, mut write: W, mut read: R, tx: mpsc::Sender<AdapterEvent>)
    where
        W: futures_util::Sink<WsMessage> + Unpin + Send,
        R: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin + Send,
    {
        while let Some(message) = read.next().await {
            let event = match message {
                Ok(WsMessage::Text(text)) => {
                    match select_event(&text, self.event_name.as_deref(), self.format) {
                        Some(payload) => AdapterEvent::Data(payload),
                        None => continue,
                    }
                }
                Ok(WsMessage::Binary(bytes)) => match &self.decoder {
                    Some(decoder) => match decoder.decode(&bytes) {
                        Ok(value) => AdapterEvent::Data(RawPayload::Structured(value)),
                        Err(e) => AdapterEvent::Error(e.to_string()),
                    },
                    None => AdapterEvent::Data(RawPayload::Binary(bytes)),
                },
                Ok(WsMessage::Ping(payload)) => {
                    if write.send(WsMessage::Pong(payload)).await.is_err() {
                        let _ = tx
                            .send(AdapterEvent::Closed(Some("failed to answer ping".into())))
                            .await;
                        return;
                    }
                    continue;
                }
                Ok(WsMessage::Close(frame)) => {
                    debug!(frame = ?frame, "WebSocket closed by peer");
                    let reason = frame.map(|f| format!("{} {}", u16::from(f.code), f.reason));
                    let _ = tx.send(AdapterEvent::Closed(reason)).await;
                    return;
                }
                Ok(_) => continue,
                Err(e) => {
                    let _ = tx.send(AdapterEvent::Closed(Some(e.to_string()))).await;
                    return;
                }
            };

            if tx.send(event).await.is_err() {
                return;
            }
        }

        let _ = tx
            .send(AdapterEvent::Closed(Some("stream ended".into())))
            .await;
    }
}

/// Match a text frame against the subscribed event name.
///
/// Returns `None` for frames addressed to another event. Frames without an
/// envelope pass through; frames that are not JSON are left for the
/// normalizer to judge.
pub(crate) fn select_event(text: &str, event_name: Option<&str>, format: MessageFormat) -> Option<RawPayload> {
    let name = match event_name {
        Some(name) if format == MessageFormat::Json => name,
        _ => return Some(RawPayload::Text(text.to_string())),
    };

    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return Some(RawPayload::Text(text.to_string())),
    };

    match value {
        Value::Array(mut items) if items.len() == 2 && items[0].is_string() => {
            if items[0].as_str() == Some(name) {
                Some(RawPayload::Structured(items.swap_remove(1)))
            } else {
                None
            }
        }
        Value::Object(map) => {
            let envelope: Vec<&str> = ENVELOPE_KEYS
                .iter()
                .filter_map(|key| map.get(*key).and_then(Value::as_str))
                .collect();

            if envelope.is_empty() || envelope.contains(&name) {
                Some(RawPayload::Structured(Value::Object(map)))
            } else {
                None
            }
        }
        other => Some(RawPayload::Structured(other)),
    }
}

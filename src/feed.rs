//! Feed Connection Configuration
//!
//! The immutable description of how to reach a feed. A config is created when a
//! feed is registered or edited and is never mutated while the feed is active;
//! edits go through a deactivate/activate cycle.
//!
//! The wire shape is camelCase JSON with a `connectionType` discriminator:
//!
//! ```json
//! {
//!   "connectionType": "websocket",
//!   "url": "wss://stream.example.com/ws",
//!   "headers": [{"key": "X-Client", "value": "feedhub", "enabled": true}],
//!   "eventName": "tick",
//!   "messageFormat": "json",
//!   "reconnection": {"enabled": true, "delayMs": 1000, "maxAttempts": 5}
//! }
//! ```
//!
//! Fields that belong to another connection type are ignored.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::transform::{parse_script, TransformError};

/// Opaque feed identifier
pub type FeedId = String;

/// A single header or query parameter entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            enabled: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Format of frames on a streaming connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    #[default]
    Json,
    Xml,
    Text,
}

/// Format of an HTTP response body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Json,
    Xml,
    Csv,
    Text,
}

/// Body formats understood by the normalizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Xml,
    Csv,
    Text,
}

impl From<MessageFormat> for PayloadFormat {
    fn from(format: MessageFormat) -> Self {
        match format {
            MessageFormat::Json => Self::Json,
            MessageFormat::Xml => Self::Xml,
            MessageFormat::Text => Self::Text,
        }
    }
}

impl From<ResponseFormat> for PayloadFormat {
    fn from(format: ResponseFormat) -> Self {
        match format {
            ResponseFormat::Json => Self::Json,
            ResponseFormat::Xml => Self::Xml,
            ResponseFormat::Csv => Self::Csv,
            ResponseFormat::Text => Self::Text,
        }
    }
}

/// Reconnection policy for streaming feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reconnect_delay")]
    pub delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_reconnect_delay() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: default_reconnect_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Settings shared by the WebSocket and Protobuf adapters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    /// First frame sent after the socket opens
    #[serde(default)]
    pub connection_message: Option<String>,
    /// Frames sent in order after `connection_message`
    #[serde(default)]
    pub connection_messages: Vec<String>,
    #[serde(default)]
    pub message_format: MessageFormat,
    /// Logical channel to subscribe to
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub reconnection: ReconnectionConfig,
}

impl StreamSettings {
    /// The event name stamped on normalized events
    pub fn event_name_or_default(&self) -> &str {
        self.event_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or("message")
    }
}

/// Protobuf-over-WebSocket settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtobufSettings {
    #[serde(flatten)]
    pub stream: StreamSettings,
    /// Decoder registry key
    pub protobuf_type: String,
}

/// HTTP method for polling requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Credentials injected into polling requests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Authentication {
    #[default]
    None,
    Bearer {
        token: String,
    },
    #[serde(rename_all = "camelCase")]
    ApiKey {
        #[serde(default = "default_api_key_header")]
        header_name: String,
        key: String,
    },
    Basic {
        username: String,
        #[serde(default)]
        password: String,
    },
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

/// Optional transformation applied to the extracted payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub script: String,
}

/// HTTP polling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpPollingSettings {
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_http_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub request_body: Option<String>,
    #[serde(default)]
    pub response_format: ResponseFormat,
    #[serde(default)]
    pub data_path: Option<String>,
    #[serde(default)]
    pub authentication: Authentication,
    #[serde(default)]
    pub transform: TransformConfig,
    /// Event name stamped on normalized events
    #[serde(default)]
    pub event_name: Option<String>,
}

fn default_polling_interval() -> u64 {
    5000
}

fn default_http_timeout() -> u64 {
    10_000
}

impl Default for HttpPollingSettings {
    fn default() -> Self {
        Self {
            method: HttpMethod::default(),
            polling_interval_ms: default_polling_interval(),
            timeout_ms: default_http_timeout(),
            request_body: None,
            response_format: ResponseFormat::default(),
            data_path: None,
            authentication: Authentication::default(),
            transform: TransformConfig::default(),
            event_name: None,
        }
    }
}

/// Protocol-specific configuration, selected by `connectionType`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "connectionType", rename_all = "kebab-case")]
pub enum ProtocolConfig {
    Websocket(StreamSettings),
    HttpPolling(HttpPollingSettings),
    Protobuf(ProtobufSettings),
}

/// How to connect to a feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedConnectionConfig {
    pub url: String,
    #[serde(default)]
    pub headers: Vec<KeyValue>,
    #[serde(default)]
    pub query_params: Vec<KeyValue>,
    #[serde(flatten)]
    pub protocol: ProtocolConfig,
}

impl FeedConnectionConfig {
    /// Build a WebSocket config with default stream settings
    pub fn websocket(url: impl Into<String>, event_name: Option<&str>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            query_params: Vec::new(),
            protocol: ProtocolConfig::Websocket(StreamSettings {
                event_name: event_name.map(str::to_string),
                ..Default::default()
            }),
        }
    }

    /// Build an HTTP polling config with default settings
    pub fn http_polling(url: impl Into<String>, settings: HttpPollingSettings) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            query_params: Vec::new(),
            protocol: ProtocolConfig::HttpPolling(settings),
        }
    }

    /// The `connectionType` label
    pub fn protocol_name(&self) -> &'static str {
        match self.protocol {
            ProtocolConfig::Websocket(_) => "websocket",
            ProtocolConfig::HttpPolling(_) => "http-polling",
            ProtocolConfig::Protobuf(_) => "protobuf",
        }
    }

    /// The event name stamped on normalized events
    pub fn event_name(&self) -> &str {
        match &self.protocol {
            ProtocolConfig::Websocket(stream) => stream.event_name_or_default(),
            ProtocolConfig::Protobuf(proto) => proto.stream.event_name_or_default(),
            ProtocolConfig::HttpPolling(http) => http
                .event_name
                .as_deref()
                .filter(|name| !name.is_empty())
                .unwrap_or("poll"),
        }
    }

    /// Reconnection policy; HTTP feeds retry their timer with the defaults
    pub fn reconnection(&self) -> ReconnectionConfig {
        match &self.protocol {
            ProtocolConfig::Websocket(stream) => stream.reconnection,
            ProtocolConfig::Protobuf(proto) => proto.stream.reconnection,
            ProtocolConfig::HttpPolling(_) => ReconnectionConfig::default(),
        }
    }

    /// Enabled headers, in order
    pub fn enabled_headers(&self) -> impl Iterator<Item = &KeyValue> {
        self.headers.iter().filter(|h| h.enabled && !h.key.is_empty())
    }

    /// Enabled query parameters, in order
    pub fn enabled_query_params(&self) -> impl Iterator<Item = &KeyValue> {
        self.query_params
            .iter()
            .filter(|q| q.enabled && !q.key.is_empty())
    }

    /// Parse `url` and append the enabled query parameters
    pub fn request_url(&self) -> Result<Url, FeedConfigError> {
        let mut url = Url::parse(self.url.trim())
            .map_err(|e| FeedConfigError::InvalidUrl(format!("{}: {}", self.url, e)))?;

        let params: Vec<&KeyValue> = self.enabled_query_params().collect();
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for param in params {
                pairs.append_pair(&param.key, &param.value);
            }
        }
        Ok(url)
    }

    /// Check the config for errors that must be rejected at save/activation time.
    ///
    /// The protobuf decoder lookup happens at adapter construction, which has
    /// the registry at hand.
    pub fn validate(&self) -> Result<(), FeedConfigError> {
        if self.url.trim().is_empty() {
            return Err(FeedConfigError::MissingUrl);
        }
        let url = self.request_url()?;

        match &self.protocol {
            ProtocolConfig::Websocket(_) | ProtocolConfig::Protobuf(_) => {
                if !matches!(url.scheme(), "ws" | "wss") {
                    return Err(FeedConfigError::UnsupportedScheme {
                        scheme: url.scheme().to_string(),
                        protocol: self.protocol_name(),
                    });
                }
            }
            ProtocolConfig::HttpPolling(http) => {
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(FeedConfigError::UnsupportedScheme {
                        scheme: url.scheme().to_string(),
                        protocol: self.protocol_name(),
                    });
                }
                if http.polling_interval_ms == 0 {
                    return Err(FeedConfigError::Invalid(
                        "pollingIntervalMs must be greater than zero".into(),
                    ));
                }
                if http.timeout_ms == 0 {
                    return Err(FeedConfigError::Invalid(
                        "timeoutMs must be greater than zero".into(),
                    ));
                }
                if http.transform.enabled {
                    parse_script(&http.transform.script)?;
                }
            }
        }

        if let ProtocolConfig::Protobuf(proto) = &self.protocol {
            if proto.protobuf_type.trim().is_empty() {
                return Err(FeedConfigError::UnknownProtobufType(String::new()));
            }
        }

        Ok(())
    }
}

/// Configuration errors, rejected at save or activation time
#[derive(Debug, Error)]
pub enum FeedConfigError {
    #[error("Feed url is required")]
    MissingUrl,

    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    #[error("Scheme '{scheme}' is not valid for {protocol} feeds")]
    UnsupportedScheme {
        scheme: String,
        protocol: &'static str,
    },

    #[error("Unknown protobuf type: '{0}'")]
    UnknownProtobufType(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid transform script: {0}")]
    Transform(#[from] TransformError),

    #[error("Invalid feed config: {0}")]
    Invalid(String),
}

//! HTTP Polling Adapter
//!
//! Issues one request per tick of a fixed-period timer. The first tick fires
//! immediately. If the previous tick's request is still in flight when the
//! next tick fires, it is aborted and awaited before the new request starts,
//! so at most one request per feed is ever outstanding.

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{AdapterEvent, AdapterOptions, AdapterSession, ConnectorError, Handshake, ProtocolAdapter};
use crate::feed::{Authentication, FeedConfigError, FeedConnectionConfig, HttpMethod, HttpPollingSettings, PayloadFormat};
use crate::normalize::{decode_text, RawPayload};
use crate::transform::Transform;
use crate::value::resolve_path;

/// Tick and in-flight accounting for one polling feed
#[derive(Debug, Default)]
pub struct PollCounters {
    ticks: AtomicU64,
    aborted: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl PollCounters {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Requests aborted because the next tick fired first
    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Highest number of simultaneously outstanding requests observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self)
    }
}

struct InFlightGuard<'a>(&'a PollCounters);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The request spawned by the latest tick
#[derive(Default)]
struct InFlight(Option<JoinHandle<()>>);

impl InFlight {
    /// Abort the previous request if it has not finished; true if aborted
    async fn abort_pending(&mut self) -> bool {
        match self.0.take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                let _ = handle.await;
                true
            }
            _ => false,
        }
    }

    fn start(&mut self, handle: JoinHandle<()>) {
        self.0 = Some(handle);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

struct Poller {
    config: FeedConnectionConfig,
    settings: HttpPollingSettings,
    client: reqwest::Client,
    transform: Option<Transform>,
    counters: Arc<PollCounters>,
    channel_capacity: usize,
}

/// Adapter for `http-polling` feeds
#[derive(Clone)]
pub struct HttpPollAdapter {
    inner: Arc<Poller>,
}

impl HttpPollAdapter {
    pub fn new(
        config: FeedConnectionConfig,
        settings: HttpPollingSettings,
        options: &AdapterOptions,
    ) -> Result<Self, ConnectorError> {
        let transform = if settings.transform.enabled {
            Some(
                Transform::compile(&settings.transform.script, options.transform_limits)
                    .map_err(FeedConfigError::from)?,
            )
        } else {
            None
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;

        Ok(Self {
            inner: Arc::new(Poller {
                config,
                settings,
                client,
                transform,
                counters: Arc::new(PollCounters::default()),
                channel_capacity: options.channel_capacity,
            }),
        })
    }

    pub fn counters(&self) -> Arc<PollCounters> {
        Arc::clone(&self.inner.counters)
    }

    /// Issue a single request and extract its payload.
    ///
    /// `handshake` is filled in as far as the request got, so callers can
    /// report diagnostics for failures too.
    pub async fn poll_once(&self, handshake: &mut Handshake) -> Result<Value, ConnectorError> {
        self.inner.poll_once(handshake).await
    }

    /// Parse a response body, apply `dataPath`, then the transform
    pub fn extract(&self, body: &str) -> Result<Value, ConnectorError> {
        self.inner.extract(body)
    }
}

impl Poller {
    fn build_request(&self, handshake: &mut Handshake) -> Result<reqwest::RequestBuilder, ConnectorError> {
        let url = self.config.request_url()?;
        *handshake = Handshake::new(url.as_str(), self.config.protocol_name());

        let mut request = self.client.request(self.settings.method.as_reqwest(), url);
        let mut has_content_type = false;

        for header in self.config.enabled_headers() {
            let name = HeaderName::from_bytes(header.key.as_bytes())
                .map_err(|_| FeedConfigError::InvalidHeader(header.key.clone()))?;
            let value = HeaderValue::from_str(&header.value)
                .map_err(|_| FeedConfigError::InvalidHeader(header.key.clone()))?;
            has_content_type |= name == CONTENT_TYPE;
            request = request.header(name, value);
            handshake.record_header(&header.key, &header.value);
        }

        request = match &self.settings.authentication {
            Authentication::None => request,
            Authentication::Bearer { token } => {
                handshake.record_header("Authorization", token);
                request.bearer_auth(token)
            }
            Authentication::ApiKey { header_name, key } => {
                let name = HeaderName::from_bytes(header_name.as_bytes())
                    .map_err(|_| FeedConfigError::InvalidHeader(header_name.clone()))?;
                handshake.record_header(header_name, key);
                request.header(name, key.as_str())
            }
            Authentication::Basic { username, password } => {
                handshake.record_header("Authorization", username);
                request.basic_auth(username, Some(password))
            }
        };

        if self.settings.method != HttpMethod::Get {
            if let Some(body) = &self.settings.request_body {
                if !has_content_type && serde_json::from_str::<Value>(body).is_ok() {
                    request = request.header(CONTENT_TYPE, "application/json");
                    handshake.record_header("Content-Type", "application/json");
                }
                request = request.body(body.clone());
            }
        }

        Ok(request)
    }

    async fn poll_once(&self, handshake: &mut Handshake) -> Result<Value, ConnectorError> {
        let request = self.build_request(handshake)?;

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ConnectorError::Timeout(self.settings.timeout_ms)
            } else {
                ConnectorError::Request(e)
            }
        })?;

        let status = response.status();
        handshake.record_response(
            status.as_u16(),
            response.headers().iter().map(|(name, value)| (name.as_str(), value.as_bytes())),
        );
        if !status.is_success() {
            return Err(ConnectorError::HttpStatus(status.as_u16()));
        }

        let body = response.text().await?;
        self.extract(&body)
    }

    fn extract(&self, body: &str) -> Result<Value, ConnectorError> {
        let parsed = decode_text(body, self.settings.response_format.into())?;

        let extracted = match self.settings.data_path.as_deref().filter(|p| !p.is_empty()) {
            Some(path) => {
                let found = resolve_path(&parsed, path).cloned();
                match found {
                    Some(value) => value,
                    None => {
                        debug!(data_path = %path, "dataPath not found, using whole body");
                        parsed
                    }
                }
            }
            None => parsed,
        };

        match &self.transform {
            Some(transform) => Ok(transform.apply(extracted)?),
            None => Ok(extracted),
        }
    }

    async fn run(self: Arc<Self>, tx: mpsc::Sender<AdapterEvent>) {
        let period = Duration::from_millis(self.settings.polling_interval_ms);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight = InFlight::default();

        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }

            if in_flight.abort_pending().await {
                self.counters.aborted.fetch_add(1, Ordering::Relaxed);
                warn!(url = %self.config.url, "Poll still in flight at next tick, aborted");
                let _ = tx.try_send(AdapterEvent::Error(
                    "previous request still in flight, aborted".into(),
                ));
            }
            self.counters.ticks.fetch_add(1, Ordering::Relaxed);

            let poller = Arc::clone(&self);
            let tx = tx.clone();
            in_flight.start(tokio::spawn(async move {
                let _guard = poller.counters.enter();
                let mut handshake = Handshake::default();
                let event = match poller.poll_once(&mut handshake).await {
                    Ok(value) => AdapterEvent::Data(RawPayload::Structured(value)),
                    Err(e) => AdapterEvent::Error(e.to_string()),
                };
                let _ = tx.send(event).await;
            }));
        }
    }
}

#[async_trait]
impl ProtocolAdapter for HttpPollAdapter {
    fn protocol(&self) -> &'static str {
        "http-polling"
    }

    fn payload_format(&self) -> PayloadFormat {
        self.inner.settings.response_format.into()
    }

    fn event_name(&self) -> &str {
        self.inner.config.event_name()
    }

    async fn open(&self) -> Result<AdapterSession, ConnectorError> {
        let mut handshake = Handshake::default();
        self.inner.build_request(&mut handshake)?;

        let (tx, rx) = mpsc::channel(self.inner.channel_capacity);
        let task = tokio::spawn(Arc::clone(&self.inner).run(tx));

        Ok(AdapterSession::new(rx, task, handshake))
    }
}

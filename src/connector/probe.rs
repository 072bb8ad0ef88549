//! Connection-Test Probe
//!
//! Runs one connection attempt for a candidate config and reports what
//! happened. The probe never touches the hub or the store, and the timeout is
//! a hard boundary: when it fires, the attempt is dropped along with its
//! socket or request.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{build_adapter, AdapterEvent, AdapterOptions, ConnectorError, DecoderRegistry, Handshake, HttpPollAdapter};
use crate::feed::{FeedConnectionConfig, ProtocolConfig};
use crate::normalize::normalize;

/// What the probe observed on the wire
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub url: String,
    pub protocol: String,
    pub headers: BTreeMap<String, String>,
    pub status_code: Option<u16>,
    pub response_headers: BTreeMap<String, String>,
    /// Time until the socket was open (stream protocols)
    pub open_ms: Option<u64>,
    /// Time until the first payload arrived
    pub first_frame_ms: Option<u64>,
}

impl Diagnostics {
    fn absorb(&mut self, handshake: &Handshake) {
        if !handshake.url.is_empty() {
            self.url = handshake.url.clone();
        }
        self.headers = handshake.headers.clone();
        self.status_code = handshake.status_code;
        self.response_headers = handshake.response_headers.clone();
    }
}

/// Structured probe outcome; the probe never fails to produce one
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    /// The connection was established
    pub success: bool,
    /// Milliseconds to first data, or to open if no data arrived
    pub connection_time: Option<u64>,
    pub data_received: bool,
    pub sample_data: Option<Value>,
    pub error: Option<String>,
    pub diagnostics: Diagnostics,
}

/// Probe a config with a hard deadline
pub async fn test_connection(
    config: &FeedConnectionConfig,
    decoders: &DecoderRegistry,
    options: &AdapterOptions,
    timeout: Duration,
) -> TestResult {
    let started = Instant::now();
    let mut diagnostics = Diagnostics {
        url: config.url.clone(),
        protocol: config.protocol_name().to_string(),
        ..Default::default()
    };

    // Filled in as the attempt progresses, so a deadline still reports it
    let mut handshake = Handshake::default();
    let outcome = tokio::time::timeout(
        timeout,
        attempt(config, decoders, options, started, &mut diagnostics, &mut handshake),
    )
    .await;
    diagnostics.absorb(&handshake);

    let connection_time = diagnostics.first_frame_ms.or(diagnostics.open_ms);

    match outcome {
        Ok(Ok(sample)) => TestResult {
            success: true,
            connection_time,
            data_received: true,
            sample_data: Some(sample),
            error: None,
            diagnostics,
        },
        Ok(Err(e)) => {
            debug!(url = %config.url, error = %e, "Connection test failed");
            TestResult {
                success: false,
                connection_time,
                data_received: false,
                sample_data: None,
                error: Some(e.to_string()),
                diagnostics,
            }
        }
        // Opened but quiet: the connection works, there is just no sample
        Err(_) if diagnostics.open_ms.is_some() => TestResult {
            success: true,
            connection_time,
            data_received: false,
            sample_data: None,
            error: None,
            diagnostics,
        },
        Err(_) => TestResult {
            success: false,
            connection_time: None,
            data_received: false,
            sample_data: None,
            error: Some(ConnectorError::Timeout(timeout.as_millis() as u64).to_string()),
            diagnostics,
        },
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

async fn attempt(
    config: &FeedConnectionConfig,
    decoders: &DecoderRegistry,
    options: &AdapterOptions,
    started: Instant,
    diagnostics: &mut Diagnostics,
    handshake: &mut Handshake,
) -> Result<Value, ConnectorError> {
    if let ProtocolConfig::HttpPolling(settings) = &config.protocol {
        config.validate()?;
        let adapter = HttpPollAdapter::new(config.clone(), settings.clone(), options)?;

        let value = adapter.poll_once(handshake).await?;
        diagnostics.first_frame_ms = Some(elapsed_ms(started));
        return Ok(value);
    }

    let adapter = build_adapter(config, decoders, options)?;
    let mut session = adapter.open().await?;
    diagnostics.open_ms = Some(elapsed_ms(started));
    *handshake = session.handshake().clone();

    loop {
        match session.next().await {
            Some(AdapterEvent::Data(raw)) => {
                diagnostics.first_frame_ms = Some(elapsed_ms(started));
                let event = normalize("probe", adapter.event_name(), raw, adapter.payload_format())?;
                return Ok(event.payload);
            }
            Some(AdapterEvent::Error(e)) => {
                debug!(error = %e, "Probe skipped frame");
            }
            Some(AdapterEvent::Closed(reason)) => {
                return Err(ConnectorError::Disconnected(
                    reason.unwrap_or_else(|| "closed before any data".to_string()),
                ));
            }
            None => {
                return Err(ConnectorError::Disconnected("closed before any data".to_string()));
            }
        }
    }
}

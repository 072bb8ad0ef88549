//! Outbound Message Types
//!
//! The JSON envelope delivered to subscribers, and the small control protocol
//! spoken on the subscriber stream socket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::filter::{CompiledFilter, FilterOutcome};
use crate::normalize::NormalizedEvent;

/// Filter statistics attached when a filter shaped the delivery
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSummary {
    pub filter_applied: bool,
    pub filter_name: String,
    pub match_count: usize,
    pub total_count: usize,
}

/// One delivered event, the same shape for every source protocol
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEvent {
    pub feed_id: String,
    pub event_name: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    #[serde(flatten)]
    pub filter: Option<FilterSummary>,
}

impl OutboundEvent {
    /// Unfiltered delivery
    pub fn passthrough(event: &NormalizedEvent) -> Self {
        Self {
            feed_id: event.feed_id.clone(),
            event_name: event.event_name.clone(),
            timestamp: event.timestamp,
            data: event.payload.clone(),
            filter: None,
        }
    }

    /// Run `filter` over the event; `None` when a scalar payload did not match
    pub fn filtered(event: &NormalizedEvent, filter: &CompiledFilter) -> Option<Self> {
        let outcome: FilterOutcome = filter.evaluate(&event.payload);
        let summary = FilterSummary {
            filter_applied: true,
            filter_name: filter.name().to_string(),
            match_count: outcome.match_count(),
            total_count: outcome.total_count(),
        };

        outcome.into_data().map(|data| Self {
            feed_id: event.feed_id.clone(),
            event_name: event.event_name.clone(),
            timestamp: event.timestamp,
            data,
            filter: Some(summary),
        })
    }
}

/// Messages sent from a subscriber to the server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Attach this stream to a feed
    Subscribe {
        #[serde(rename = "feedId")]
        feed_id: String,
    },
    /// Detach this stream from a feed
    Unsubscribe {
        #[serde(rename = "feedId")]
        feed_id: String,
    },
    /// Keepalive
    Ping,
}

/// Control messages sent from the server to a subscriber
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        #[serde(rename = "subscriberId")]
        subscriber_id: String,
    },
    Subscribed {
        #[serde(rename = "feedId")]
        feed_id: String,
    },
    Unsubscribed {
        #[serde(rename = "feedId")]
        feed_id: String,
    },
    Pong,
    Error {
        message: String,
    },
}

//! Subscription Fan-out Hub
//!
//! Per feed, the set of subscribers and the filter each one has bound. All of
//! it lives behind one `RwLock`: subscription changes take the write side and
//! delivery the read side, so an event is never delivered to a subscriber
//! mid-removal. Each connected subscriber has a bounded channel; delivery uses
//! `try_send`, so one slow subscriber loses its own events instead of stalling
//! the feed.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::messages::OutboundEvent;
use crate::connector::EventSink;
use crate::feed::FeedId;
use crate::filter::CompiledFilter;
use crate::normalize::NormalizedEvent;

/// Opaque subscriber identifier, chosen by the client
pub type SubscriberId = String;

/// Identifies one stream connection of a subscriber
pub type ConnectionId = String;

/// Configuration for the fan-out hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of concurrently connected subscriber streams
    pub max_connections: usize,
    /// Capacity of each subscriber's delivery channel
    pub channel_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            channel_capacity: 256,
        }
    }
}

struct Channel {
    connection_id: ConnectionId,
    sender: mpsc::Sender<OutboundEvent>,
}

#[derive(Default)]
struct Registry {
    /// feed -> subscriber -> bound filter
    feeds: HashMap<FeedId, HashMap<SubscriberId, Option<Arc<CompiledFilter>>>>,
    /// Connected delivery channels
    channels: HashMap<SubscriberId, Channel>,
}

/// Hub counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub feeds: usize,
    pub subscriptions: usize,
    pub connected_subscribers: usize,
    pub delivered: u64,
    /// Events lost to full subscriber channels
    pub dropped: u64,
    /// Scalar events a subscriber's filter rejected
    pub filtered_out: u64,
}

/// Routes normalized events to subscribers through their filters
pub struct FanoutHub {
    registry: RwLock<Registry>,
    config: HubConfig,
    delivered: AtomicU64,
    dropped: AtomicU64,
    filtered_out: AtomicU64,
}

impl FanoutHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            config,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            filtered_out: AtomicU64::new(0),
        }
    }

    /// Attach a delivery channel for `subscriber_id`.
    ///
    /// A newer connection replaces an older one for the same subscriber.
    pub async fn connect(
        &self,
        subscriber_id: &str,
    ) -> Result<(ConnectionId, mpsc::Receiver<OutboundEvent>), HubError> {
        let mut registry = self.registry.write().await;
        if !registry.channels.contains_key(subscriber_id)
            && registry.channels.len() >= self.config.max_connections
        {
            return Err(HubError::TooManyConnections(self.config.max_connections));
        }

        let (sender, receiver) = mpsc::channel(self.config.channel_capacity);
        let connection_id = Uuid::new_v4().to_string();
        registry.channels.insert(
            subscriber_id.to_string(),
            Channel {
                connection_id: connection_id.clone(),
                sender,
            },
        );

        tracing::info!(subscriber_id = %subscriber_id, connection_id = %connection_id, "Subscriber connected");
        Ok((connection_id, receiver))
    }

    /// Detach a delivery channel, unless a newer connection already replaced it
    pub async fn disconnect(&self, subscriber_id: &str, connection_id: &str) {
        let mut registry = self.registry.write().await;
        let current = registry
            .channels
            .get(subscriber_id)
            .map(|channel| channel.connection_id == connection_id)
            .unwrap_or(false);
        if current {
            registry.channels.remove(subscriber_id);
            tracing::info!(subscriber_id = %subscriber_id, "Subscriber disconnected");
        }
    }

    /// Add a subscription. Returns false if it already existed, in which case
    /// the bound filter is kept.
    pub async fn subscribe(&self, feed_id: &str, subscriber_id: &str) -> bool {
        let mut registry = self.registry.write().await;
        let subscribers = registry.feeds.entry(feed_id.to_string()).or_default();
        if subscribers.contains_key(subscriber_id) {
            return false;
        }
        subscribers.insert(subscriber_id.to_string(), None);

        tracing::debug!(feed_id = %feed_id, subscriber_id = %subscriber_id, "Subscribed");
        true
    }

    /// Remove a subscription and its filter binding
    pub async fn unsubscribe(&self, feed_id: &str, subscriber_id: &str) -> Result<(), HubError> {
        let mut registry = self.registry.write().await;
        let subscribers = registry
            .feeds
            .get_mut(feed_id)
            .ok_or_else(|| HubError::not_found(feed_id, subscriber_id))?;
        subscribers
            .remove(subscriber_id)
            .ok_or_else(|| HubError::not_found(feed_id, subscriber_id))?;
        if subscribers.is_empty() {
            registry.feeds.remove(feed_id);
        }

        tracing::debug!(feed_id = %feed_id, subscriber_id = %subscriber_id, "Unsubscribed");
        Ok(())
    }

    /// Bind a compiled filter to a subscription, replacing any previous one;
    /// `None` unbinds
    pub async fn set_filter(
        &self,
        feed_id: &str,
        subscriber_id: &str,
        filter: Option<Arc<CompiledFilter>>,
    ) -> Result<(), HubError> {
        let mut registry = self.registry.write().await;
        let binding = registry
            .feeds
            .get_mut(feed_id)
            .and_then(|subscribers| subscribers.get_mut(subscriber_id))
            .ok_or_else(|| HubError::not_found(feed_id, subscriber_id))?;

        tracing::debug!(
            feed_id = %feed_id,
            subscriber_id = %subscriber_id,
            filter_id = filter.as_ref().map(|f| f.id()).unwrap_or("none"),
            "Filter bound"
        );
        *binding = filter;
        Ok(())
    }

    /// The filter bound to a subscription, if any
    pub async fn filter_for(&self, feed_id: &str, subscriber_id: &str) -> Option<Arc<CompiledFilter>> {
        self.registry
            .read()
            .await
            .feeds
            .get(feed_id)
            .and_then(|subscribers| subscribers.get(subscriber_id))
            .cloned()
            .flatten()
    }

    pub async fn is_subscribed(&self, feed_id: &str, subscriber_id: &str) -> bool {
        self.registry
            .read()
            .await
            .feeds
            .get(feed_id)
            .is_some_and(|subscribers| subscribers.contains_key(subscriber_id))
    }

    /// Subscribers of a feed, sorted
    pub async fn subscribers(&self, feed_id: &str) -> Vec<SubscriberId> {
        let registry = self.registry.read().await;
        let mut ids: Vec<SubscriberId> = registry
            .feeds
            .get(feed_id)
            .map(|subscribers| subscribers.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub async fn subscription_count(&self, feed_id: &str) -> usize {
        self.registry
            .read()
            .await
            .feeds
            .get(feed_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.channels.len()
    }

    /// Deliver one event to every subscriber of its feed; returns the number
    /// of channels that accepted it
    pub async fn deliver(&self, event: &NormalizedEvent) -> usize {
        let registry = self.registry.read().await;
        let Some(subscribers) = registry.feeds.get(&event.feed_id) else {
            return 0;
        };

        let mut sent = 0;
        for (subscriber_id, filter) in subscribers {
            let Some(channel) = registry.channels.get(subscriber_id) else {
                continue;
            };

            let outbound = match filter {
                Some(filter) if filter.is_enabled() => match OutboundEvent::filtered(event, filter) {
                    Some(outbound) => outbound,
                    None => {
                        self.filtered_out.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                },
                _ => OutboundEvent::passthrough(event),
            };

            match channel.sender.try_send(outbound) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        feed_id = %event.feed_id,
                        subscriber_id = %subscriber_id,
                        "Subscriber channel full, event dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber_id = %subscriber_id, "Subscriber channel closed");
                }
            }
        }

        self.delivered.fetch_add(sent as u64, Ordering::Relaxed);
        if sent > 0 {
            tracing::trace!(feed_id = %event.feed_id, subscribers = sent, "Delivered event");
        }
        sent
    }

    pub async fn stats(&self) -> HubStats {
        let registry = self.registry.read().await;
        HubStats {
            feeds: registry.feeds.len(),
            subscriptions: registry.feeds.values().map(|s| s.len()).sum(),
            connected_subscribers: registry.channels.len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            filtered_out: self.filtered_out.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl EventSink for FanoutHub {
    async fn publish(&self, event: NormalizedEvent) {
        self.deliver(&event).await;
    }
}

/// Errors that can occur in the fan-out hub
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Too many subscriber connections (limit: {0})")]
    TooManyConnections(usize),

    #[error("Subscriber '{subscriber_id}' is not subscribed to feed '{feed_id}'")]
    SubscriptionNotFound {
        feed_id: String,
        subscriber_id: String,
    },
}

impl HubError {
    pub(crate) fn not_found(feed_id: &str, subscriber_id: &str) -> Self {
        Self::SubscriptionNotFound {
            feed_id: feed_id.to_string(),
            subscriber_id: subscriber_id.to_string(),
        }
    }
}

//! Feed Catalog Store
//!
//! The engine reads feed configs, filter sets and subscription bindings through
//! the [`FeedStore`] trait. [`MemoryStore`] keeps them in memory and can be
//! seeded from a JSON catalog file:
//!
//! ```json
//! {
//!   "feeds": [{"id": "btc", "name": "BTC ticker", "active": true,
//!              "config": {"connectionType": "websocket", "url": "wss://..."}}],
//!   "filters": [{"id": "movers", "name": "Big movers", "groups": [...]}],
//!   "subscriptionFilters": [{"feedId": "btc", "subscriberId": "desk", "filterId": "movers"}]
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::feed::{FeedConfigError, FeedConnectionConfig, FeedId};
use crate::filter::{FilterError, FilterSet};

/// A registered feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedRecord {
    pub id: FeedId,
    #[serde(default)]
    pub name: String,
    /// Activated at startup
    #[serde(default)]
    pub active: bool,
    pub config: FeedConnectionConfig,
}

/// A persisted filter binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionFilter {
    pub feed_id: FeedId,
    pub subscriber_id: String,
    pub filter_id: String,
}

/// Catalog file contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    #[serde(default)]
    pub feeds: Vec<FeedRecord>,
    #[serde(default)]
    pub filters: Vec<FilterSet>,
    #[serde(default)]
    pub subscription_filters: Vec<SubscriptionFilter>,
}

/// Persistence consumed by the engine
#[async_trait]
pub trait FeedStore: Send + Sync {
    async fn get_feed(&self, feed_id: &str) -> Result<Option<FeedRecord>, StoreError>;

    async fn get_feed_config(&self, feed_id: &str) -> Result<Option<FeedConnectionConfig>, StoreError> {
        Ok(self.get_feed(feed_id).await?.map(|feed| feed.config))
    }

    /// IDs of feeds to activate at startup
    async fn list_active_feeds(&self) -> Result<Vec<FeedId>, StoreError>;

    async fn list_feeds(&self) -> Result<Vec<FeedRecord>, StoreError>;

    async fn get_filter_set(&self, filter_id: &str) -> Result<Option<FilterSet>, StoreError>;

    /// The filter bound to a subscription, if any
    async fn get_active_filter_for_subscription(
        &self,
        feed_id: &str,
        subscriber_id: &str,
    ) -> Result<Option<FilterSet>, StoreError>;

    /// Persist a binding; `None` removes it
    async fn bind_subscription_filter(
        &self,
        feed_id: &str,
        subscriber_id: &str,
        filter_id: Option<&str>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    feeds: HashMap<FeedId, FeedRecord>,
    filters: HashMap<String, FilterSet>,
    /// (feed, subscriber) -> filter
    bindings: HashMap<(FeedId, String), String>,
}

/// In-memory [`FeedStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a catalog; every entry is validated as if saved
    pub fn from_catalog(catalog: Catalog) -> Result<Self, StoreError> {
        let mut tables = Tables::default();

        for feed in catalog.feeds {
            feed.config.validate().map_err(|source| StoreError::InvalidFeed {
                id: feed.id.clone(),
                source,
            })?;
            tables.feeds.insert(feed.id.clone(), feed);
        }
        for filter in catalog.filters {
            filter.validate().map_err(|source| StoreError::InvalidFilter {
                id: filter.id.clone(),
                source,
            })?;
            tables.filters.insert(filter.id.clone(), filter);
        }
        for binding in catalog.subscription_filters {
            if !tables.filters.contains_key(&binding.filter_id) {
                return Err(StoreError::FilterNotFound(binding.filter_id));
            }
            tables
                .bindings
                .insert((binding.feed_id, binding.subscriber_id), binding.filter_id);
        }

        tracing::info!(
            feeds = tables.feeds.len(),
            filters = tables.filters.len(),
            bindings = tables.bindings.len(),
            "Catalog loaded"
        );
        Ok(Self {
            tables: RwLock::new(tables),
        })
    }

    /// Load a JSON catalog file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let catalog: Catalog = serde_json::from_str(&contents)?;
        Self::from_catalog(catalog)
    }

    /// Insert or replace a feed
    pub async fn put_feed(&self, feed: FeedRecord) -> Result<(), StoreError> {
        feed.config.validate().map_err(|source| StoreError::InvalidFeed {
            id: feed.id.clone(),
            source,
        })?;
        self.tables.write().await.feeds.insert(feed.id.clone(), feed);
        Ok(())
    }

    /// Insert or replace a filter set; rejected if it fails validation
    pub async fn put_filter(&self, filter: FilterSet) -> Result<(), StoreError> {
        filter.validate().map_err(|source| StoreError::InvalidFilter {
            id: filter.id.clone(),
            source,
        })?;
        self.tables.write().await.filters.insert(filter.id.clone(), filter);
        Ok(())
    }

    /// Mark a feed for activation at startup
    pub async fn set_active(&self, feed_id: &str, active: bool) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let feed = tables
            .feeds
            .get_mut(feed_id)
            .ok_or_else(|| StoreError::FeedNotFound(feed_id.to_string()))?;
        feed.active = active;
        Ok(())
    }
}

#[async_trait]
impl FeedStore for MemoryStore {
    async fn get_feed(&self, feed_id: &str) -> Result<Option<FeedRecord>, StoreError> {
        Ok(self.tables.read().await.feeds.get(feed_id).cloned())
    }

    async fn list_active_feeds(&self) -> Result<Vec<FeedId>, StoreError> {
        let tables = self.tables.read().await;
        let mut ids: Vec<FeedId> = tables
            .feeds
            .values()
            .filter(|feed| feed.active)
            .map(|feed| feed.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_feeds(&self) -> Result<Vec<FeedRecord>, StoreError> {
        let mut feeds: Vec<FeedRecord> = self.tables.read().await.feeds.values().cloned().collect();
        feeds.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(feeds)
    }

    async fn get_filter_set(&self, filter_id: &str) -> Result<Option<FilterSet>, StoreError> {
        Ok(self.tables.read().await.filters.get(filter_id).cloned())
    }

    async fn get_active_filter_for_subscription(
        &self,
        feed_id: &str,
        subscriber_id: &str,
    ) -> Result<Option<FilterSet>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .bindings
            .get(&(feed_id.to_string(), subscriber_id.to_string()))
            .and_then(|filter_id| tables.filters.get(filter_id))
            .cloned())
    }

    async fn bind_subscription_filter(
        &self,
        feed_id: &str,
        subscriber_id: &str,
        filter_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let key = (feed_id.to_string(), subscriber_id.to_string());
        match filter_id {
            Some(filter_id) => {
                if !tables.filters.contains_key(filter_id) {
                    return Err(StoreError::FilterNotFound(filter_id.to_string()));
                }
                tables.bindings.insert(key, filter_id.to_string());
            }
            None => {
                tables.bindings.remove(&key);
            }
        }
        Ok(())
    }
}

/// Catalog store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid feed '{id}': {source}")]
    InvalidFeed { id: String, source: FeedConfigError },

    #[error("Invalid filter '{id}': {source}")]
    InvalidFilter { id: String, source: FilterError },

    #[error("Feed not found: {0}")]
    FeedNotFound(String),

    #[error("Filter not found: {0}")]
    FilterNotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Condition, FilterGroup, FilterRule, Operator, RuleValue};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CATALOG: &str = r#"{
        "feeds": [
            {"id": "btc", "name": "BTC", "active": true,
             "config": {"connectionType": "websocket", "url": "wss://stream.example.com/ws", "eventName": "tick"}},
            {"id": "rates", "config": {"connectionType": "http-polling", "url": "https://api.example.com/rates"}}
        ],
        "filters": [
            {"id": "movers", "name": "Big movers", "groups": [
                {"condition": "and", "rules": [
                    {"field": "changePercent24h", "operator": "greater_than", "value": 3}
                ]}
            ]}
        ],
        "subscriptionFilters": [
            {"feedId": "btc", "subscriberId": "desk", "filterId": "movers"}
        ]
    }"#;

    #[tokio::test]
    async fn test_load_catalog_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(CATALOG.as_bytes()).unwrap();

        let store = MemoryStore::load(file.path()).unwrap();
        assert_eq!(store.list_active_feeds().await.unwrap(), vec!["btc"]);
        assert_eq!(store.list_feeds().await.unwrap().len(), 2);

        let config = store.get_feed_config("btc").await.unwrap().unwrap();
        assert_eq!(config.event_name(), "tick");

        let bound = store
            .get_active_filter_for_subscription("btc", "desk")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bound.name, "Big movers");
        assert!(store
            .get_active_filter_for_subscription("btc", "other")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_catalog_rejects_inverted_range() {
        let catalog = r#"{"filters": [{"id": "bad", "groups": [{"rules": [
            {"field": "price", "operator": "in_range", "value": {"min": 10, "max": 1}}
        ]}]}]}"#;
        let err = MemoryStore::from_catalog(serde_json::from_str(catalog).unwrap()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidFilter { .. }));
    }

    #[test]
    fn test_catalog_rejects_dangling_binding() {
        let catalog = r#"{"subscriptionFilters": [{"feedId": "a", "subscriberId": "b", "filterId": "nope"}]}"#;
        let err = MemoryStore::from_catalog(serde_json::from_str(catalog).unwrap()).unwrap_err();
        assert!(matches!(err, StoreError::FilterNotFound(_)));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            MemoryStore::load("/nonexistent/catalog.json"),
            Err(StoreError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_put_and_bind() {
        let store = MemoryStore::new();
        store
            .put_feed(FeedRecord {
                id: "btc".into(),
                name: String::new(),
                active: false,
                config: FeedConnectionConfig::websocket("wss://x.example.com", None),
            })
            .await
            .unwrap();
        store.set_active("btc", true).await.unwrap();
        assert_eq!(store.list_active_feeds().await.unwrap(), vec!["btc"]);

        let filter = FilterSet::new("f1", "Cheap").with_group(FilterGroup::new(
            Condition::And,
            vec![FilterRule::new("price", Operator::LessThan, RuleValue::scalar(10))],
        ));
        store.put_filter(filter).await.unwrap();

        assert!(store.bind_subscription_filter("btc", "s1", Some("missing")).await.is_err());
        store.bind_subscription_filter("btc", "s1", Some("f1")).await.unwrap();
        assert!(store.get_active_filter_for_subscription("btc", "s1").await.unwrap().is_some());
        store.bind_subscription_filter("btc", "s1", None).await.unwrap();
        assert!(store.get_active_filter_for_subscription("btc", "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_feed_validates() {
        let store = MemoryStore::new();
        let err = store
            .put_feed(FeedRecord {
                id: "bad".into(),
                name: String::new(),
                active: false,
                config: FeedConnectionConfig::websocket("ftp://nope", None),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidFeed { .. }));
    }
}

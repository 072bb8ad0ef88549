//! Data Transfer Objects
//!
//! Request and response types for the API endpoints.
//! These types are serialized/deserialized to/from JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connector::ConnectionState;
use crate::engine::{EngineSummary, FeedStatus};
use crate::filter::{FieldInfo, FilterSet};
use crate::hub::HubStats;

// ============================================
// FEED DTOs
// ============================================

/// Feed list response
#[derive(Debug, Serialize)]
pub struct FeedListResponse {
    pub feeds: Vec<FeedStatus>,
    pub total: usize,
}

/// Activation or deactivation result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStateResponse {
    pub feed_id: String,
    pub state: ConnectionState,
}

// ============================================
// SUBSCRIPTION DTOs
// ============================================

/// Subscription change result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub feed_id: String,
    pub subscriber_id: String,
    pub subscribed: bool,
}

/// Filter binding request; `null` unbinds
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterAssignmentRequest {
    #[serde(default)]
    pub filter_id: Option<String>,
}

/// Filter binding result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterAssignmentResponse {
    pub feed_id: String,
    pub subscriber_id: String,
    pub filter_id: Option<String>,
    pub filter_name: Option<String>,
}

// ============================================
// FILTER DTOs
// ============================================

/// Filter validation result
#[derive(Debug, Serialize)]
pub struct FilterValidationResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Evaluate a filter against sample data
#[derive(Debug, Deserialize)]
pub struct FilterPreviewRequest {
    pub filter: FilterSet,
    pub data: Value,
}

/// Preview result; `data` is absent when a scalar payload did not match
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterPreviewResponse {
    pub passed: bool,
    pub match_count: usize,
    pub total_count: usize,
    pub data: Option<Value>,
}

/// Field discovery request
#[derive(Debug, Deserialize)]
pub struct FieldsRequest {
    pub data: Value,
}

/// Discovered fields
#[derive(Debug, Serialize)]
pub struct FieldsResponse {
    pub fields: Vec<FieldInfo>,
}

// ============================================
// HEALTH DTOs
// ============================================

/// Full health response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// "healthy" or "degraded" (some feeds failed)
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub feeds: EngineSummary,
    pub hub: HubStats,
}

//! Subscription Routes
//!
//! - PUT /api/v1/feeds/:id/subscribers/:sid - Subscribe
//! - DELETE /api/v1/feeds/:id/subscribers/:sid - Unsubscribe
//! - PUT /api/v1/feeds/:id/subscribers/:sid/filter - Bind or unbind a filter

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::api::dto::{FilterAssignmentRequest, FilterAssignmentResponse, SubscriptionResponse};
use crate::api::error::ApiResult;
use crate::api::state::AppState;

/// PUT /api/v1/feeds/:id/subscribers/:sid
pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Path((feed_id, subscriber_id)): Path<(String, String)>,
) -> ApiResult<Json<SubscriptionResponse>> {
    state.engine.subscribe(&feed_id, &subscriber_id).await?;
    Ok(Json(SubscriptionResponse {
        feed_id,
        subscriber_id,
        subscribed: true,
    }))
}

/// DELETE /api/v1/feeds/:id/subscribers/:sid
pub async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Path((feed_id, subscriber_id)): Path<(String, String)>,
) -> ApiResult<Json<SubscriptionResponse>> {
    state.engine.unsubscribe(&feed_id, &subscriber_id).await?;
    Ok(Json(SubscriptionResponse {
        feed_id,
        subscriber_id,
        subscribed: false,
    }))
}

/// PUT /api/v1/feeds/:id/subscribers/:sid/filter
pub async fn set_filter(
    State(state): State<Arc<AppState>>,
    Path((feed_id, subscriber_id)): Path<(String, String)>,
    Json(request): Json<FilterAssignmentRequest>,
) -> ApiResult<Json<FilterAssignmentResponse>> {
    let bound = state
        .engine
        .set_subscription_filter(&feed_id, &subscriber_id, request.filter_id.as_deref())
        .await?;

    Ok(Json(FilterAssignmentResponse {
        feed_id,
        subscriber_id,
        filter_id: bound.as_ref().map(|set| set.id.clone()),
        filter_name: bound.map(|set| set.name),
    }))
}

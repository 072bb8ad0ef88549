//! Feed Routes
//!
//! - POST /api/v1/feeds/test - Probe an unsaved connection config
//! - GET /api/v1/feeds - List feeds with status
//! - GET /api/v1/feeds/:id/status - Status of one feed
//! - GET /api/v1/feeds/:id/fields - Fields of the last event seen
//! - POST /api/v1/feeds/:id/activate - Start (or restart) a feed
//! - POST /api/v1/feeds/:id/deactivate - Stop a feed

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::api::dto::{FeedListResponse, FeedStateResponse, FieldsResponse};
use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::connector::TestResult;
use crate::engine::FeedStatus;
use crate::feed::FeedConnectionConfig;

/// POST /api/v1/feeds/test
///
/// Always 200: failures are reported inside the `TestResult`.
pub async fn test_feed(
    State(state): State<Arc<AppState>>,
    Json(config): Json<FeedConnectionConfig>,
) -> Json<TestResult> {
    tracing::info!(url = %config.url, protocol = config.protocol_name(), "Testing connection");
    Json(state.engine.test_connection(&config).await)
}

/// GET /api/v1/feeds
pub async fn list_feeds(State(state): State<Arc<AppState>>) -> ApiResult<Json<FeedListResponse>> {
    let feeds = state.engine.list_feeds().await?;
    Ok(Json(FeedListResponse {
        total: feeds.len(),
        feeds,
    }))
}

/// GET /api/v1/feeds/:id/status
pub async fn feed_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<FeedStatus>> {
    Ok(Json(state.engine.feed_status(&id).await?))
}

/// GET /api/v1/feeds/:id/fields
pub async fn feed_fields(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<FieldsResponse>> {
    let fields = state.engine.feed_fields(&id).await?;
    Ok(Json(FieldsResponse { fields }))
}

/// POST /api/v1/feeds/:id/activate
pub async fn activate_feed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<FeedStateResponse>> {
    state.engine.activate_feed(&id).await?;
    Ok(Json(FeedStateResponse {
        state: state.engine.feed_state(&id).await,
        feed_id: id,
    }))
}

/// POST /api/v1/feeds/:id/deactivate
pub async fn deactivate_feed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<FeedStateResponse>> {
    state.engine.deactivate_feed(&id).await?;
    Ok(Json(FeedStateResponse {
        state: state.engine.feed_state(&id).await,
        feed_id: id,
    }))
}

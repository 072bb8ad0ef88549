//! Filter Editor Routes
//!
//! Stateless helpers for building filters against live data shapes.
//!
//! - POST /api/v1/filters/validate - Save-time checks
//! - POST /api/v1/filters/preview - Evaluate a filter against sample data
//! - POST /api/v1/fields - Discover field paths in sample data

use axum::Json;

use crate::api::dto::{
    FieldsRequest, FieldsResponse, FilterPreviewRequest, FilterPreviewResponse,
    FilterValidationResponse,
};
use crate::api::error::ApiResult;
use crate::filter::{available_fields, evaluate, FilterSet};

/// POST /api/v1/filters/validate
pub async fn validate_filter(Json(filter): Json<FilterSet>) -> Json<FilterValidationResponse> {
    let errors = match filter.validate() {
        Ok(()) => Vec::new(),
        Err(e) => vec![e.to_string()],
    };
    Json(FilterValidationResponse {
        valid: errors.is_empty(),
        errors,
    })
}

/// POST /api/v1/filters/preview
///
/// Invalid filters are rejected the same way a save would reject them.
pub async fn preview_filter(
    Json(request): Json<FilterPreviewRequest>,
) -> ApiResult<Json<FilterPreviewResponse>> {
    request.filter.validate()?;

    let outcome = evaluate(&request.filter, &request.data);
    let match_count = outcome.match_count();
    let total_count = outcome.total_count();
    let data = outcome.into_data();

    Ok(Json(FilterPreviewResponse {
        passed: data.is_some(),
        match_count,
        total_count,
        data,
    }))
}

/// POST /api/v1/fields
pub async fn discover_fields(Json(request): Json<FieldsRequest>) -> Json<FieldsResponse> {
    Json(FieldsResponse {
        fields: available_fields(&request.data),
    })
}

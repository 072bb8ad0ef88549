//! Feedhub REST API
//!
//! HTTP API layer for Feedhub, built with Axum.
//!
//! # Endpoints
//!
//! ## Feeds
//! - `POST /api/v1/feeds/test` - Probe an unsaved connection config
//! - `GET /api/v1/feeds` - List feeds with status
//! - `GET /api/v1/feeds/:id/status` - Feed status and statistics
//! - `GET /api/v1/feeds/:id/fields` - Fields of the last event seen
//! - `POST /api/v1/feeds/:id/activate` - Start a feed
//! - `POST /api/v1/feeds/:id/deactivate` - Stop a feed
//!
//! ## Subscriptions
//! - `PUT /api/v1/feeds/:id/subscribers/:sid` - Subscribe
//! - `DELETE /api/v1/feeds/:id/subscribers/:sid` - Unsubscribe
//! - `PUT /api/v1/feeds/:id/subscribers/:sid/filter` - Bind a filter (`{"filterId": ...}`)
//!
//! ## Filter editing
//! - `POST /api/v1/filters/validate` - Validate a filter set
//! - `POST /api/v1/filters/preview` - Evaluate a filter set against sample data
//! - `POST /api/v1/fields` - Discover field paths in sample data
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status
//!
//! ## WebSocket
//! - `GET /api/v1/stream/:sid` - Event stream for subscriber `sid`
//!
//! # Example
//!
//! ```rust,ignore
//! use feedhub::api::{serve, ApiConfig, AppState};
//! use feedhub::engine::FeedEngine;
//! use feedhub::hub::{FanoutHub, HubConfig};
//! use feedhub::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::load("catalog.json")?);
//!     let hub = Arc::new(FanoutHub::new(HubConfig::default()));
//!     let engine = Arc::new(FeedEngine::new(store, hub));
//!     engine.activate_all().await?;
//!
//!     let config = ApiConfig::default();
//!     serve(AppState::new(engine, config.clone()), &config).await?;
//!     Ok(())
//! }
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::{ApiConfig, AppState};

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::hub::stream_handler;

/// Build the API router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Feed routes
        .route("/feeds", get(routes::feeds::list_feeds))
        .route("/feeds/test", post(routes::feeds::test_feed))
        .route("/feeds/:id/status", get(routes::feeds::feed_status))
        .route("/feeds/:id/fields", get(routes::feeds::feed_fields))
        .route("/feeds/:id/activate", post(routes::feeds::activate_feed))
        .route("/feeds/:id/deactivate", post(routes::feeds::deactivate_feed))
        // Subscription routes
        .route(
            "/feeds/:id/subscribers/:sid",
            put(routes::subscriptions::subscribe).delete(routes::subscriptions::unsubscribe),
        )
        .route(
            "/feeds/:id/subscribers/:sid/filter",
            put(routes::subscriptions::set_filter),
        )
        // Filter editor routes
        .route("/filters/validate", post(routes::filters::validate_filter))
        .route("/filters/preview", post(routes::filters::preview_filter))
        .route("/fields", post(routes::filters::discover_fields))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        // WebSocket route
        .route("/stream/:sid", get(stream_handler));

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    let cors = cors_layer(&state.config.cors_origins);
    let shared_state = Arc::new(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(shared_state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::permissive().allow_origin(AllowOrigin::list(allowed))
}

/// Start the API server
pub async fn serve(state: AppState, config: &ApiConfig) -> Result<(), ApiError> {
    let router = build_router(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to bind {}: {}", addr, e)))?;

    tracing::info!("Feedhub API listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    tracing::info!("Feedhub API shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FeedEngine;
    use crate::feed::FeedConnectionConfig;
    use crate::filter::{Condition, FilterGroup, FilterRule, FilterSet, Operator, RuleValue};
    use crate::hub::{FanoutHub, HubConfig};
    use crate::normalize::NormalizedEvent;
    use crate::store::{FeedRecord, MemoryStore};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::util::ServiceExt;

    async fn create_test_state() -> AppState {
        let store = MemoryStore::new();
        store
            .put_feed(FeedRecord {
                id: "btc".into(),
                name: "BTC ticker".into(),
                active: false,
                config: FeedConnectionConfig::websocket("ws://127.0.0.1:9/", Some("tick")),
            })
            .await
            .unwrap();
        store
            .put_filter(FilterSet::new("movers", "Big movers").with_group(FilterGroup::new(
                Condition::And,
                vec![FilterRule::new("changePercent24h", Operator::GreaterThan, RuleValue::scalar(3))],
            )))
            .await
            .unwrap();

        let hub = Arc::new(FanoutHub::new(HubConfig::default()));
        let engine = FeedEngine::new(Arc::new(store), hub).with_probe_timeout(Duration::from_millis(500));
        AppState::new(Arc::new(engine), ApiConfig::default())
    }

    async fn create_test_app() -> Router {
        build_router(create_test_state().await)
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let app = create_test_app().await;
        let (status, _) = send(app.clone(), "GET", "/health/live", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(app.clone(), "GET", "/health/ready", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["feeds"]["activeFeeds"], 0);
    }

    #[tokio::test]
    async fn test_list_and_status() {
        let app = create_test_app().await;

        let (status, body) = send(app.clone(), "GET", "/api/v1/feeds", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["feeds"][0]["name"], "BTC ticker");
        assert_eq!(body["feeds"][0]["state"]["phase"], "disconnected");

        let (status, body) = send(app.clone(), "GET", "/api/v1/feeds/missing/status", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
        assert!(body["request_id"].is_string());

        let (status, _) = send(app, "GET", "/api/v1/feeds/btc/fields", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_activate_and_deactivate() {
        let app = create_test_app().await;

        let (status, body) = send(app.clone(), "POST", "/api/v1/feeds/btc/activate", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["feedId"], "btc");

        let (status, body) = send(app.clone(), "POST", "/api/v1/feeds/btc/deactivate", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["phase"], "disconnected");

        let (status, _) = send(app.clone(), "POST", "/api/v1/feeds/btc/deactivate", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(app, "POST", "/api/v1/feeds/nope/activate", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_probe_always_answers() {
        let app = create_test_app().await;
        let (status, body) = send(
            app,
            "POST",
            "/api/v1/feeds/test",
            Some(json!({"connectionType": "websocket", "url": "ftp://nowhere"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());
        assert_eq!(body["diagnostics"]["protocol"], "websocket");
    }

    #[tokio::test]
    async fn test_subscription_and_filter_binding() {
        let app = create_test_app().await;

        let (status, body) = send(app.clone(), "PUT", "/api/v1/feeds/btc/subscribers/desk", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["subscribed"], true);

        let (status, body) = send(
            app.clone(),
            "PUT",
            "/api/v1/feeds/btc/subscribers/desk/filter",
            Some(json!({"filterId": "movers"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["filterName"], "Big movers");

        let (status, body) = send(
            app.clone(),
            "PUT",
            "/api/v1/feeds/btc/subscribers/desk/filter",
            Some(json!({"filterId": null})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["filterId"].is_null());

        let (status, _) = send(
            app.clone(),
            "PUT",
            "/api/v1/feeds/btc/subscribers/desk/filter",
            Some(json!({"filterId": "ghost"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(app.clone(), "DELETE", "/api/v1/feeds/btc/subscribers/desk", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(app, "DELETE", "/api/v1/feeds/btc/subscribers/desk", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_filter_editor_endpoints() {
        let app = create_test_app().await;
        let inverted = json!({"groups": [{"rules": [
            {"field": "price", "operator": "in_range", "value": {"min": 10, "max": 1}}
        ]}]});

        let (status, body) = send(app.clone(), "POST", "/api/v1/filters/validate", Some(inverted.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], false);
        assert_eq!(body["errors"].as_array().unwrap().len(), 1);

        let (status, _) = send(
            app.clone(),
            "POST",
            "/api/v1/filters/preview",
            Some(json!({"filter": inverted, "data": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let preview = json!({
            "filter": {"groups": [{"rules": [{"field": "price", "operator": "greater_than", "value": 100}]}]},
            "data": [{"price": 50}, {"price": 150}, {"price": 200}]
        });
        let (status, body) = send(app.clone(), "POST", "/api/v1/filters/preview", Some(preview)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["matchCount"], 2);
        assert_eq!(body["totalCount"], 3);
        assert_eq!(body["data"], json!([{"price": 150}, {"price": 200}]));

        let (status, body) = send(
            app,
            "POST",
            "/api/v1/fields",
            Some(json!({"data": {"symbol": "BTC", "quote": {"bid": 1.5}}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let paths: Vec<&str> = body["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["path"].as_str().unwrap())
            .collect();
        assert_eq!(paths, vec!["quote", "quote.bid", "symbol"]);
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let app = create_test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/filters/validate")
                    .header("Content-Type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    type ClientStream =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn next_json(ws: &mut ClientStream) -> Value {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), ws.next()).await.unwrap() {
                Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("stream ended: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_subscriber_stream() {
        let state = create_test_state().await;
        let engine = Arc::clone(&state.engine);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/v1/stream/desk", addr))
            .await
            .unwrap();

        assert_eq!(next_json(&mut ws).await["type"], "connected");

        ws.send(WsMessage::Text(r#"{"type":"subscribe","feedId":"btc"}"#.into()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "subscribed");

        engine
            .hub()
            .deliver(&NormalizedEvent {
                feed_id: "btc".into(),
                event_name: "tick".into(),
                timestamp: chrono::Utc::now(),
                payload: json!({"symbol": "BTC", "changePercent24h": 4}),
            })
            .await;

        let event = next_json(&mut ws).await;
        assert_eq!(event["feedId"], "btc");
        assert_eq!(event["eventName"], "tick");
        assert_eq!(event["data"]["symbol"], "BTC");
    }
}

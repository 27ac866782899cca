//! # pulse-api
//!
//! Streaming server for pulse. Clients open `GET /events/:organization_id`
//! and receive every event of that organization as a Server-Sent Event
//! until they disconnect.

pub mod auth;
pub mod broker;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod services;
pub mod state;
pub mod stream;

use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub use auth::{CallerIdentity, CallerResolver, GatewayHeaderResolver};
pub use error::ApiError;
pub use state::AppState;
pub use stream::{CloseReason, ConnectionState, EventStream, StreamItem, StreamSettings};

/// Routes with request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/events/:organization_id", get(handlers::stream_events))
        .route(
            "/events/:organization_id/subscribers",
            get(handlers::subscriber_count),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Routes plus the CORS policy for `allowed_origins`.
pub fn app(state: AppState, allowed_origins: &str) -> Router {
    router(state).layer(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parse_allowed_origins(allowed_origins)))
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers([header::AUTHORIZATION, header::ACCEPT, header::CACHE_CONTROL])
            .allow_credentials(true)
            .max_age(Duration::from_secs(3600)),
    )
}

/// Parse a comma-separated origin list, skipping invalid entries.
pub fn parse_allowed_origins(origins: &str) -> Vec<HeaderValue> {
    origins
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("Invalid CORS origin '{}': {}", trimmed, e);
                    None
                }
            }
        })
        .collect()
}

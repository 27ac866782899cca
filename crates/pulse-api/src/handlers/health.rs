use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::state::AppState;

/// `GET /health`
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "backend": state.broker.backend().as_str(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

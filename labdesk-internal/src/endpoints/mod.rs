use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::gateway_util::AppStateData;

pub mod limits;
pub mod status;

/// Every route the gateway serves, with state attached
pub fn router(app_state: AppStateData) -> Router {
    Router::new()
        .route(
            "/v1/tenants/{tenant_id}/limits",
            get(limits::get_limits_handler),
        )
        .route(
            "/v1/tenants/{tenant_id}/notifications/check",
            post(limits::check_notifications_handler),
        )
        .route(
            "/v1/tenants/{tenant_id}/usage/{resource}/authorize",
            post(limits::authorize_handler),
        )
        .route(
            "/v1/tenants/{tenant_id}/subscription/refresh",
            post(limits::refresh_subscription_handler),
        )
        .route("/internal/metrics", get(limits::metrics_handler))
        .route("/status", get(status::status_handler))
        .route("/health", get(status::health_handler))
        .fallback(handle_404)
        .with_state(app_state)
}

pub async fn handle_404() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Route not found" })),
    )
}

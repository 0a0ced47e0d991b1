use axum::debug_handler;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

pub const LABDESK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A handler for a simple liveness check
#[debug_handler]
pub async fn status_handler() -> Json<Value> {
    Json(json!({ "status": "ok", "version": LABDESK_VERSION }))
}

#[debug_handler]
pub async fn health_handler() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_handler() {
        let Json(body) = status_handler().await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], LABDESK_VERSION);
    }
}

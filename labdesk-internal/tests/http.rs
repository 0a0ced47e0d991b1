use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use reqwest::StatusCode;
use serde_json::Value;
use uuid::Uuid;

use labdesk_internal::backend::InMemoryBackend;
use labdesk_internal::config_parser::Config;
use labdesk_internal::endpoints;
use labdesk_internal::gateway_util::AppStateData;
use labdesk_internal::notification::{MemoryNotificationStore, NotifierSet};
use labdesk_internal::usage_limit::{
    FreemiumLimiter, FreemiumLimiterConfig, ResourceKind, SubscriptionRecord, SubscriptionStatus,
};

async fn start_gateway(backend: Arc<InMemoryBackend>) -> SocketAddr {
    let limiter = FreemiumLimiter::new(
        backend.clone(),
        backend,
        Arc::new(MemoryNotificationStore::new()),
        NotifierSet::default(),
        FreemiumLimiterConfig::default(),
    );
    let app_state =
        AppStateData::new_with_limiter(Arc::new(Config::default()), Arc::new(limiter));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, endpoints::router(app_state))
            .await
            .unwrap();
    });
    addr
}

#[tokio::test]
async fn test_status_and_health() {
    let addr = start_gateway(Arc::new(InMemoryBackend::new())).await;
    let client = reqwest::Client::new();

    let status: Value = client
        .get(format!("http://{addr}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "ok");

    let health = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let missing = client
        .get(format!("http://{addr}/v2/nothing"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_limits_for_free_laboratory() {
    let backend = Arc::new(InMemoryBackend::new());
    let tenant = Uuid::now_v7();
    backend.set_role(tenant, "laboratory");
    backend.record(tenant, ResourceKind::Orders, 36, Utc::now());
    let addr = start_gateway(backend).await;

    let response = reqwest::get(format!("http://{addr}/v1/tenants/{tenant}/limits"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["plan"], "free");
    assert_eq!(body["is_subscribed"], false);
    assert_eq!(body["can_create_order"], true);
    assert_eq!(body["resources"]["orders"]["current"], 36);
    assert_eq!(body["resources"]["orders"]["limit"], 50);
    assert_eq!(body["resources"]["orders"]["percentage"], 72.0);
}

#[tokio::test]
async fn test_check_notifications_fires_once() {
    let backend = Arc::new(InMemoryBackend::new());
    let tenant = Uuid::now_v7();
    backend.set_role(tenant, "clinic");
    backend.record(tenant, ResourceKind::PdfGenerations, 28, Utc::now());
    let addr = start_gateway(backend).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/v1/tenants/{tenant}/notifications/check");

    let first: Value = client
        .post(&url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let notifications = first["notifications"].as_array().unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0]["resource"], "pdf_generations");
    assert_eq!(notifications[0]["threshold"], 90);
    assert_eq!(notifications[0]["severity"], "critical");

    let second: Value = client
        .post(&url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(second["notifications"].as_array().unwrap().is_empty());

    let metrics: Value = client
        .get(format!("http://{addr}/internal/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["notifications_fired"], 1);
}

#[tokio::test]
async fn test_authorize_at_limit_is_payment_required() {
    let backend = Arc::new(InMemoryBackend::new());
    let tenant = Uuid::now_v7();
    backend.set_role(tenant, "laboratory");
    backend.record(tenant, ResourceKind::PriceTables, 1, Utc::now());
    let addr = start_gateway(backend.clone()).await;
    let client = reqwest::Client::new();

    let denied = client
        .post(format!(
            "http://{addr}/v1/tenants/{tenant}/usage/price_tables/authorize"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::PAYMENT_REQUIRED);
    let body: Value = denied.json().await.unwrap();
    assert_eq!(body["error"]["type"], "insufficient_quota");
    assert_eq!(body["error"]["resource"], "price_tables");

    let allowed = client
        .post(format!(
            "http://{addr}/v1/tenants/{tenant}/usage/orders/authorize"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
    let body: Value = allowed.json().await.unwrap();
    assert_eq!(body["allowed"], true);
    assert_eq!(body["limit"], 50);

    // upgrading only takes effect once the cached plan is refreshed
    backend.set_subscription(
        tenant,
        SubscriptionRecord::new(SubscriptionStatus::Active, "Basic"),
    );
    let refreshed = client
        .post(format!(
            "http://{addr}/v1/tenants/{tenant}/subscription/refresh"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(refreshed.status(), StatusCode::NO_CONTENT);

    let upgraded = client
        .post(format!(
            "http://{addr}/v1/tenants/{tenant}/usage/price_tables/authorize"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(upgraded.status(), StatusCode::OK);
    let body: Value = upgraded.json().await.unwrap();
    assert_eq!(body["limit"], "unlimited");
}

#[tokio::test]
async fn test_rejects_malformed_paths() {
    let addr = start_gateway(Arc::new(InMemoryBackend::new())).await;
    let client = reqwest::Client::new();

    let bad_tenant = client
        .get(format!("http://{addr}/v1/tenants/lab-42/limits"))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_tenant.status(), StatusCode::BAD_REQUEST);

    let tenant = Uuid::now_v7();
    let unknown_resource = client
        .post(format!(
            "http://{addr}/v1/tenants/{tenant}/usage/invoices/authorize"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_resource.status(), StatusCode::NOT_FOUND);
}

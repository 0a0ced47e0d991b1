//! Tenant-scoped limit endpoints.

use std::str::FromStr;

use axum::debug_handler;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData};
use crate::notification::NotificationEvent;
use crate::usage_limit::{
    EvaluatedLimits, Limit, MetricsSnapshot, ResourceKind, TenantId, UsageLimitDecision,
};

fn parse_tenant_id(raw: &str) -> Result<TenantId, Error> {
    TenantId::parse_str(raw).map_err(|_| {
        Error::new(ErrorDetails::InvalidTenantId {
            raw_tenant_id: raw.to_string(),
        })
    })
}

fn parse_resource(raw: &str) -> Result<ResourceKind, Error> {
    ResourceKind::from_str(raw).map_err(|_| {
        Error::new(ErrorDetails::UnknownResource {
            name: raw.to_string(),
        })
    })
}

#[debug_handler(state = AppStateData)]
pub async fn get_limits_handler(
    State(AppStateData { limiter, .. }): AppState,
    Path(tenant_id): Path<String>,
) -> Result<Json<EvaluatedLimits>, Error> {
    let tenant_id = parse_tenant_id(&tenant_id)?;
    Ok(Json(limiter.get_limits(tenant_id).await))
}

#[derive(Debug, Serialize)]
pub struct CheckNotificationsResponse {
    pub notifications: Vec<NotificationEvent>,
}

#[debug_handler(state = AppStateData)]
pub async fn check_notifications_handler(
    State(AppStateData { limiter, .. }): AppState,
    Path(tenant_id): Path<String>,
) -> Result<Json<CheckNotificationsResponse>, Error> {
    let tenant_id = parse_tenant_id(&tenant_id)?;
    let notifications = limiter.check_and_notify(tenant_id).await;
    Ok(Json(CheckNotificationsResponse { notifications }))
}

#[derive(Debug, Serialize)]
pub struct AuthorizeResponse {
    pub allowed: bool,
    pub resource: ResourceKind,
    pub current: u64,
    pub limit: Limit,
    pub percentage: f64,
}

/// 200 when the tenant may create one more `resource`, 402 otherwise
#[debug_handler(state = AppStateData)]
pub async fn authorize_handler(
    State(AppStateData { limiter, .. }): AppState,
    Path((tenant_id, resource)): Path<(String, String)>,
) -> Result<Json<AuthorizeResponse>, Error> {
    let tenant_id = parse_tenant_id(&tenant_id)?;
    let resource = parse_resource(&resource)?;
    let limits = limiter.get_limits(tenant_id).await;
    let usage = limits.resource(resource);
    match limiter.authorize_evaluated(tenant_id, &limits, resource) {
        UsageLimitDecision::Allow => Ok(Json(AuthorizeResponse {
            allowed: true,
            resource,
            current: usage.current,
            limit: usage.limit,
            percentage: usage.percentage,
        })),
        UsageLimitDecision::Deny {
            resource,
            current,
            limit,
            ..
        } => Err(Error::new(ErrorDetails::UsageLimitExceeded {
            resource,
            current,
            limit,
        })),
    }
}

/// Called by the billing webhook after a tenant's subscription changed
#[debug_handler(state = AppStateData)]
pub async fn refresh_subscription_handler(
    State(AppStateData { limiter, .. }): AppState,
    Path(tenant_id): Path<String>,
) -> Result<StatusCode, Error> {
    let tenant_id = parse_tenant_id(&tenant_id)?;
    limiter.invalidate_subscription(tenant_id).await;
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler(state = AppStateData)]
pub async fn metrics_handler(
    State(AppStateData { limiter, .. }): AppState,
) -> Json<MetricsSnapshot> {
    Json(limiter.metrics())
}

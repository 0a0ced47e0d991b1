use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::limiter::FreemiumMetrics;
use super::{PlanId, TenantId};
use crate::backend::SubscriptionSource;

/// The role a tenant signed up with. Only laboratories and clinics are metered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TenantRole {
    Laboratory,
    Clinic,
    Other(String),
}

impl TenantRole {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_lowercase();
        match normalized.as_str() {
            "laboratory" => TenantRole::Laboratory,
            "clinic" => TenantRole::Clinic,
            _ => TenantRole::Other(normalized),
        }
    }

    pub fn is_metered(&self) -> bool {
        matches!(self, TenantRole::Laboratory | TenantRole::Clinic)
    }
}

impl From<String> for TenantRole {
    fn from(raw: String) -> Self {
        TenantRole::parse(&raw)
    }
}

impl From<TenantRole> for String {
    fn from(role: TenantRole) -> Self {
        match role {
            TenantRole::Laboratory => "laboratory".to_string(),
            TenantRole::Clinic => "clinic".to_string(),
            TenantRole::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Other(String),
}

impl From<String> for SubscriptionStatus {
    fn from(raw: String) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "active" => SubscriptionStatus::Active,
            "inactive" => SubscriptionStatus::Inactive,
            _ => SubscriptionStatus::Other(raw),
        }
    }
}

impl From<SubscriptionStatus> for String {
    fn from(status: SubscriptionStatus) -> Self {
        match status {
            SubscriptionStatus::Active => "active".to_string(),
            SubscriptionStatus::Inactive => "inactive".to_string(),
            SubscriptionStatus::Other(other) => other,
        }
    }
}

/// A tenant's subscription as written by the billing webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub status: SubscriptionStatus,
    pub plan_name: String,
}

impl SubscriptionRecord {
    pub fn new(status: SubscriptionStatus, plan_name: impl Into<String>) -> Self {
        Self {
            status,
            plan_name: plan_name.into(),
        }
    }

    /// Paid iff active with a plan name other than exactly `free`.
    /// Other spellings still bucket to the free plan in [`Self::plan`].
    pub fn is_paid(&self) -> bool {
        self.status == SubscriptionStatus::Active && self.plan_name != "free"
    }

    pub fn plan(&self) -> PlanId {
        if self.is_paid() {
            PlanId::from_plan_name(&self.plan_name)
        } else {
            PlanId::Free
        }
    }
}

/// Which plan applies to a tenant and whether limits apply at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanResolution {
    pub plan: PlanId,
    pub is_subscribed: bool,
    pub metered: bool,
}

impl PlanResolution {
    /// Roles outside the freemium program get premium-equivalent access
    pub const EXEMPT: PlanResolution = PlanResolution {
        plan: PlanId::Premium,
        is_subscribed: true,
        metered: false,
    };

    pub const FREE: PlanResolution = PlanResolution {
        plan: PlanId::Free,
        is_subscribed: false,
        metered: true,
    };

    pub fn from_subscription(subscription: Option<&SubscriptionRecord>) -> Self {
        match subscription {
            Some(subscription) => PlanResolution {
                plan: subscription.plan(),
                is_subscribed: subscription.is_paid(),
                metered: true,
            },
            None => PlanResolution::FREE,
        }
    }
}

/// Resolves tenants to plans, caching successful lookups.
pub struct SubscriptionResolver {
    source: Arc<dyn SubscriptionSource>,
    cache: Cache<TenantId, PlanResolution>,
    metrics: Arc<FreemiumMetrics>,
}

impl SubscriptionResolver {
    pub fn new(
        source: Arc<dyn SubscriptionSource>,
        cache_ttl: Duration,
        max_cache_size: u64,
        metrics: Arc<FreemiumMetrics>,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_cache_size)
            .time_to_live(cache_ttl)
            .build();
        Self {
            source,
            cache,
            metrics,
        }
    }

    pub async fn resolve(&self, tenant_id: TenantId) -> PlanResolution {
        if let Some(resolution) = self.cache.get(&tenant_id).await {
            self.metrics.record_cache_hit();
            return resolution;
        }
        self.metrics.record_cache_miss();

        let (resolution, cacheable) = self.lookup(tenant_id).await;
        if cacheable {
            self.cache.insert(tenant_id, resolution).await;
        }
        resolution
    }

    /// Drop the cached plan, e.g. after the billing webhook changed the subscription
    pub async fn invalidate(&self, tenant_id: TenantId) {
        self.cache.invalidate(&tenant_id).await;
    }

    async fn lookup(&self, tenant_id: TenantId) -> (PlanResolution, bool) {
        let role = match self.source.fetch_role(tenant_id).await {
            Ok(Some(raw)) => Some(TenantRole::parse(&raw)),
            Ok(None) => {
                debug!(%tenant_id, "No role on record, applying freemium limits");
                None
            }
            Err(e) => {
                warn!(%tenant_id, "Role lookup failed, applying freemium limits: {e}");
                return (PlanResolution::FREE, false);
            }
        };

        // Exempt roles never touch subscription data
        if let Some(role) = &role {
            if !role.is_metered() {
                debug!(%tenant_id, ?role, "Role is exempt from freemium limits");
                return (PlanResolution::EXEMPT, true);
            }
        }

        match self.source.fetch_subscription(tenant_id).await {
            Ok(subscription) => (
                PlanResolution::from_subscription(subscription.as_ref()),
                true,
            ),
            Err(e) => {
                warn!(%tenant_id, "Subscription lookup failed, using the free plan: {e}");
                (PlanResolution::FREE, false)
            }
        }
    }
}

//! Inbound collaborators: the hosted backend the limit engine reads counts,
//! roles and subscriptions from.

pub mod memory;
pub mod postgrest;

pub use memory::InMemoryBackend;
pub use postgrest::PostgrestBackend;

use async_trait::async_trait;

use crate::error::Error;
use crate::usage_limit::{BillingPeriod, ResourceKind, SubscriptionRecord, TenantId};

/// Which records a count covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountWindow {
    AllTime,
    Month(BillingPeriod),
}

#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    /// Raw role string from the tenant's profile, `None` when the tenant has no profile
    async fn fetch_role(&self, tenant_id: TenantId) -> Result<Option<String>, Error>;

    /// `None` when the tenant never subscribed
    async fn fetch_subscription(
        &self,
        tenant_id: TenantId,
    ) -> Result<Option<SubscriptionRecord>, Error>;
}

#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn count(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
        window: CountWindow,
    ) -> Result<u64, Error>;
}

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};

use super::{CountWindow, SubscriptionSource, UsageSource};
use crate::error::{Error, ErrorDetails};
use crate::usage_limit::{ResourceKind, SubscriptionRecord, TenantId};

/// Process-local backend. Used by `type = "memory"` deployments and throughout the tests,
/// where failure injection and the lookup counters stand in for a misbehaving database.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    roles: DashMap<TenantId, String>,
    subscriptions: DashMap<TenantId, SubscriptionRecord>,
    records: DashMap<(TenantId, ResourceKind), Vec<DateTime<Utc>>>,
    failing_resources: DashSet<ResourceKind>,
    fail_directory_lookups: AtomicBool,
    role_lookups: AtomicU64,
    subscription_lookups: AtomicU64,
    count_queries: AtomicU64,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_role(&self, tenant_id: TenantId, role: impl Into<String>) {
        self.roles.insert(tenant_id, role.into());
    }

    pub fn set_subscription(&self, tenant_id: TenantId, subscription: SubscriptionRecord) {
        self.subscriptions.insert(tenant_id, subscription);
    }

    pub fn remove_subscription(&self, tenant_id: TenantId) {
        self.subscriptions.remove(&tenant_id);
    }

    /// Record `count` resources created at `created_at`
    pub fn record(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
        count: u64,
        created_at: DateTime<Utc>,
    ) {
        let mut entry = self.records.entry((tenant_id, resource)).or_default();
        for _ in 0..count {
            entry.push(created_at);
        }
    }

    /// Delete the `count` most recently recorded resources (e.g. cancelled orders)
    pub fn remove_latest(&self, tenant_id: TenantId, resource: ResourceKind, count: u64) {
        if let Some(mut entry) = self.records.get_mut(&(tenant_id, resource)) {
            for _ in 0..count {
                entry.pop();
            }
        }
    }

    pub fn fail_counts_for(&self, resource: ResourceKind) {
        self.failing_resources.insert(resource);
    }

    pub fn restore_counts_for(&self, resource: ResourceKind) {
        self.failing_resources.remove(&resource);
    }

    pub fn fail_directory_lookups(&self, fail: bool) {
        self.fail_directory_lookups.store(fail, Ordering::Relaxed);
    }

    pub fn role_lookups(&self) -> u64 {
        self.role_lookups.load(Ordering::Relaxed)
    }

    pub fn subscription_lookups(&self) -> u64 {
        self.subscription_lookups.load(Ordering::Relaxed)
    }

    pub fn count_queries(&self) -> u64 {
        self.count_queries.load(Ordering::Relaxed)
    }

    fn directory_failure(&self, target: &str) -> Result<(), Error> {
        if self.fail_directory_lookups.load(Ordering::Relaxed) {
            return Err(Error::new(ErrorDetails::BackendQuery {
                target: target.to_string(),
                status_code: None,
                message: "in-memory backend configured to fail".to_string(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionSource for InMemoryBackend {
    async fn fetch_role(&self, tenant_id: TenantId) -> Result<Option<String>, Error> {
        self.role_lookups.fetch_add(1, Ordering::Relaxed);
        self.directory_failure("profiles")?;
        Ok(self.roles.get(&tenant_id).map(|role| role.value().clone()))
    }

    async fn fetch_subscription(
        &self,
        tenant_id: TenantId,
    ) -> Result<Option<SubscriptionRecord>, Error> {
        self.subscription_lookups.fetch_add(1, Ordering::Relaxed);
        self.directory_failure("subscriptions")?;
        Ok(self
            .subscriptions
            .get(&tenant_id)
            .map(|subscription| subscription.value().clone()))
    }
}

#[async_trait]
impl UsageSource for InMemoryBackend {
    async fn count(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
        window: CountWindow,
    ) -> Result<u64, Error> {
        self.count_queries.fetch_add(1, Ordering::Relaxed);
        if self.failing_resources.contains(&resource) {
            return Err(Error::new(ErrorDetails::BackendQuery {
                target: resource.to_string(),
                status_code: None,
                message: "in-memory backend configured to fail".to_string(),
            }));
        }
        let Some(records) = self.records.get(&(tenant_id, resource)) else {
            return Ok(0);
        };
        let count = match window {
            CountWindow::AllTime => records.len(),
            CountWindow::Month(period) => {
                let (start, end) = (period.start(), period.end());
                records
                    .iter()
                    .filter(|created_at| **created_at >= start && **created_at < end)
                    .count()
            }
        };
        Ok(count as u64)
    }
}

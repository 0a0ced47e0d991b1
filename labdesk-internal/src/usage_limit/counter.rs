use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::warn;

use super::limiter::FreemiumMetrics;
use super::{BillingPeriod, ResetPolicy, ResourceKind, TenantId};
use crate::backend::{CountWindow, UsageSource};

/// Result of one count query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageCount {
    Known(u64),
    /// The query failed and the limiter is configured to fail closed
    Unavailable,
}

impl UsageCount {
    pub fn value(&self) -> u64 {
        match self {
            UsageCount::Known(n) => *n,
            UsageCount::Unavailable => 0,
        }
    }
}

/// Counts for every metered resource, all read within the same pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub period: BillingPeriod,
    pub counts: BTreeMap<ResourceKind, UsageCount>,
}

impl UsageSnapshot {
    pub fn new(period: BillingPeriod) -> Self {
        Self {
            period,
            counts: BTreeMap::new(),
        }
    }

    pub fn with_count(mut self, resource: ResourceKind, count: u64) -> Self {
        self.counts.insert(resource, UsageCount::Known(count));
        self
    }

    /// Missing resources read as zero
    pub fn count(&self, resource: ResourceKind) -> UsageCount {
        self.counts
            .get(&resource)
            .copied()
            .unwrap_or(UsageCount::Known(0))
    }
}

pub struct UsageCounter {
    source: Arc<dyn UsageSource>,
    fail_open: bool,
    metrics: Arc<FreemiumMetrics>,
}

impl UsageCounter {
    pub fn new(
        source: Arc<dyn UsageSource>,
        fail_open: bool,
        metrics: Arc<FreemiumMetrics>,
    ) -> Self {
        Self {
            source,
            fail_open,
            metrics,
        }
    }

    pub async fn count(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
        period: BillingPeriod,
    ) -> UsageCount {
        let window = match resource.reset_policy() {
            ResetPolicy::Monthly => CountWindow::Month(period),
            ResetPolicy::Cumulative => CountWindow::AllTime,
        };
        match self.source.count(tenant_id, resource, window).await {
            Ok(count) => UsageCount::Known(count),
            Err(e) => {
                self.metrics.record_count_failure();
                if self.fail_open {
                    warn!(%tenant_id, %resource, "Usage count failed, treating as 0: {e}");
                    UsageCount::Known(0)
                } else {
                    warn!(%tenant_id, %resource, "Usage count failed, blocking resource: {e}");
                    UsageCount::Unavailable
                }
            }
        }
    }

    /// Reads all six counts concurrently and returns only once every read resolved.
    pub async fn snapshot(&self, tenant_id: TenantId, period: BillingPeriod) -> UsageSnapshot {
        let reads = ResourceKind::ALL.map(|resource| async move {
            (resource, self.count(tenant_id, resource, period).await)
        });
        let counts = join_all(reads).await;
        UsageSnapshot {
            period,
            counts: counts.into_iter().collect(),
        }
    }
}

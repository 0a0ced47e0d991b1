use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    evaluate, BillingPeriod, Clock, EvaluatedLimits, Limit, ResetPolicy, ResourceKind,
    SubscriptionResolver, SystemClock, TenantId, UsageCounter, UsageLimitDecision,
};
use crate::backend::{SubscriptionSource, UsageSource};
use crate::notification::{NotificationEvent, NotificationGate, NotificationStore, NotifierSet};

/// Configuration for the freemium limiter
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FreemiumLimiterConfig {
    /// Whether a failed count reads as 0 (open) or blocks the resource (closed)
    pub fail_open: bool,
    /// TTL for cached plan resolutions (in milliseconds)
    pub subscription_cache_ttl_ms: u64,
    /// Maximum number of tenants in the plan cache
    pub max_cache_size: u64,
}

impl Default for FreemiumLimiterConfig {
    fn default() -> Self {
        Self {
            fail_open: true,
            subscription_cache_ttl_ms: 30_000,
            max_cache_size: 10_000,
        }
    }
}

#[derive(Debug, Default)]
pub struct FreemiumMetrics {
    pub evaluations: AtomicU64,
    pub exempt_evaluations: AtomicU64,
    pub count_failures: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub notifications_fired: AtomicU64,
    pub delivery_failures: AtomicU64,
    pub store_failures: AtomicU64,
    pub allowed_requests: AtomicU64,
    pub denied_requests: AtomicU64,
}

impl FreemiumMetrics {
    pub fn record_evaluation(&self) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exempt_evaluation(&self) {
        self.exempt_evaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_count_failure(&self) {
        self.count_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notifications(&self, count: u64) {
        self.notifications_fired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_delivery_failures(&self, count: u64) {
        self.delivery_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allowed(&self) {
        self.allowed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            exempt_evaluations: self.exempt_evaluations.load(Ordering::Relaxed),
            count_failures: self.count_failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            notifications_fired: self.notifications_fired.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            allowed_requests: self.allowed_requests.load(Ordering::Relaxed),
            denied_requests: self.denied_requests.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub evaluations: u64,
    pub exempt_evaluations: u64,
    pub count_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub notifications_fired: u64,
    pub delivery_failures: u64,
    pub store_failures: u64,
    pub allowed_requests: u64,
    pub denied_requests: u64,
}

/// Plan resolution, usage counting, limit evaluation and tiered notifications for tenants.
pub struct FreemiumLimiter {
    resolver: SubscriptionResolver,
    counter: UsageCounter,
    gate: NotificationGate,
    notifiers: NotifierSet,
    clock: Arc<dyn Clock>,
    metrics: Arc<FreemiumMetrics>,
}

impl FreemiumLimiter {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionSource>,
        usage: Arc<dyn UsageSource>,
        store: Arc<dyn NotificationStore>,
        notifiers: NotifierSet,
        config: FreemiumLimiterConfig,
    ) -> Self {
        let metrics = Arc::new(FreemiumMetrics::default());
        Self {
            resolver: SubscriptionResolver::new(
                subscriptions,
                Duration::from_millis(config.subscription_cache_ttl_ms),
                config.max_cache_size,
                metrics.clone(),
            ),
            counter: UsageCounter::new(usage, config.fail_open, metrics.clone()),
            gate: NotificationGate::new(store, metrics.clone()),
            notifiers,
            clock: Arc::new(SystemClock),
            metrics,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Read-only and safe to poll.
    pub async fn get_limits(&self, tenant_id: TenantId) -> EvaluatedLimits {
        self.evaluate_for(tenant_id, self.clock.current_period())
            .await
    }

    /// Runs one evaluation pass through the notification gate and delivers whatever fired.
    pub async fn check_and_notify(&self, tenant_id: TenantId) -> Vec<NotificationEvent> {
        let period = self.clock.current_period();
        let limits = self.evaluate_for(tenant_id, period).await;
        let events = self.gate.evaluate(tenant_id, &limits).await;
        if events.is_empty() {
            return events;
        }

        self.metrics.record_notifications(events.len() as u64);
        // Flags are already saved, so delivery must finish even if the caller goes away
        let notifiers = self.notifiers.clone();
        let metrics = self.metrics.clone();
        let delivered = events.clone();
        let delivery = tokio::spawn(async move {
            let failures = notifiers.deliver(&delivered).await;
            if failures > 0 {
                metrics.record_delivery_failures(failures);
            }
        });
        if let Err(e) = delivery.await {
            warn!(%tenant_id, "Usage notification delivery task failed: {e}");
        }
        events
    }

    /// Whether the tenant may create one more `resource` right now.
    pub async fn authorize(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
    ) -> UsageLimitDecision {
        let limits = self.get_limits(tenant_id).await;
        self.authorize_evaluated(tenant_id, &limits, resource)
    }

    /// Same decision as [`Self::authorize`], against limits the caller already evaluated
    pub fn authorize_evaluated(
        &self,
        tenant_id: TenantId,
        limits: &EvaluatedLimits,
        resource: ResourceKind,
    ) -> UsageLimitDecision {
        let usage = limits.resource(resource);
        if usage.allowed {
            self.metrics.record_allowed();
            debug!(%tenant_id, %resource, "Usage limit check passed");
            return UsageLimitDecision::Allow;
        }

        self.metrics.record_denied();
        let limit = match usage.limit {
            Limit::Bounded(n) => n,
            Limit::Unlimited => 0,
        };
        let reason = if usage.degraded {
            format!("current {} usage could not be verified", resource.label())
        } else {
            let window = match resource.reset_policy() {
                ResetPolicy::Monthly => " this month",
                ResetPolicy::Cumulative => "",
            };
            format!(
                "the {} plan allows {limit} {}{window}",
                limits.plan,
                resource.label()
            )
        };
        info!(
            %tenant_id,
            %resource,
            current = usage.current,
            limit,
            "Usage limit reached: {reason}"
        );
        UsageLimitDecision::Deny {
            resource,
            current: usage.current,
            limit,
            reason,
        }
    }

    /// Forget the cached plan so the next pass re-reads the subscription
    pub async fn invalidate_subscription(&self, tenant_id: TenantId) {
        self.resolver.invalidate(tenant_id).await;
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn current_period(&self) -> BillingPeriod {
        self.clock.current_period()
    }

    async fn evaluate_for(&self, tenant_id: TenantId, period: BillingPeriod) -> EvaluatedLimits {
        self.metrics.record_evaluation();
        let resolution = self.resolver.resolve(tenant_id).await;
        if !resolution.metered {
            self.metrics.record_exempt_evaluation();
            return EvaluatedLimits::exempt(period);
        }
        let snapshot = self.counter.snapshot(tenant_id, period).await;
        evaluate(&snapshot, resolution)
    }
}

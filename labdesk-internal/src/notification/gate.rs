use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::{NotificationEvent, NotificationStore, PersistedNotifications, Threshold};
use crate::usage_limit::{
    BillingPeriod, EvaluatedLimits, FreemiumMetrics, Limit, ResourceKind, TenantId,
};

/// Which (resource, threshold) alerts already fired in `period`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationState {
    period: BillingPeriod,
    fired: BTreeSet<(ResourceKind, Threshold)>,
}

impl NotificationState {
    pub fn fresh(period: BillingPeriod) -> Self {
        Self {
            period,
            fired: BTreeSet::new(),
        }
    }

    /// Decodes stored state for `period`.
    ///
    /// Returns the state and whether it differs from what is stored: a missing,
    /// stale or corrupt record is replaced by a fresh state that must be written back.
    pub fn restore(persisted: &PersistedNotifications, period: BillingPeriod) -> (Self, bool) {
        if persisted.last_check.as_deref() != Some(period.key().as_str()) {
            if let Some(previous) = &persisted.last_check {
                debug!(%period, %previous, "Notification period rolled over");
            }
            return (Self::fresh(period), true);
        }
        let Some(raw_flags) = &persisted.flags else {
            return (Self::fresh(period), true);
        };
        match serde_json::from_str::<BTreeMap<String, bool>>(raw_flags) {
            Ok(flags) => {
                let fired = ResourceKind::ALL
                    .into_iter()
                    .flat_map(|resource| {
                        Threshold::ALL
                            .into_iter()
                            .map(move |threshold| (resource, threshold))
                    })
                    .filter(|(resource, threshold)| {
                        flags.get(&threshold.flag_key(*resource)) == Some(&true)
                    })
                    .collect();
                (Self { period, fired }, false)
            }
            Err(e) => {
                warn!("Resetting corrupt notification flags: {e}");
                (Self::fresh(period), true)
            }
        }
    }

    pub fn persist(&self) -> PersistedNotifications {
        let flags: BTreeMap<String, bool> = ResourceKind::ALL
            .into_iter()
            .flat_map(|resource| {
                Threshold::ALL.into_iter().map(move |threshold| {
                    (
                        threshold.flag_key(resource),
                        self.is_fired(resource, threshold),
                    )
                })
            })
            .collect();
        PersistedNotifications {
            // a map of strings to bools always serializes
            flags: serde_json::to_string(&flags).ok(),
            last_check: Some(self.period.key()),
        }
    }

    pub fn period(&self) -> BillingPeriod {
        self.period
    }

    pub fn is_fired(&self, resource: ResourceKind, threshold: Threshold) -> bool {
        self.fired.contains(&(resource, threshold))
    }

    /// Applies one evaluation pass and returns the alerts to emit, in resource order.
    /// At most one alert per resource per pass; 90% takes priority and also sets the 70% flag.
    pub fn advance(&mut self, limits: &EvaluatedLimits) -> Vec<(ResourceKind, Threshold)> {
        let mut fired = Vec::new();
        for (resource, usage) in &limits.resources {
            if usage.degraded || matches!(usage.limit, Limit::Unlimited) {
                continue;
            }
            let resource = *resource;
            if usage.percentage >= 90.0 && !self.is_fired(resource, Threshold::Ninety) {
                self.fired.insert((resource, Threshold::Seventy));
                self.fired.insert((resource, Threshold::Ninety));
                fired.push((resource, Threshold::Ninety));
            } else if usage.percentage >= 70.0 && !self.is_fired(resource, Threshold::Seventy) {
                self.fired.insert((resource, Threshold::Seventy));
                fired.push((resource, Threshold::Seventy));
            }
        }
        fired
    }
}

/// Holds a tenant's pass lock and drops the map entry once no other pass holds or awaits it.
struct TenantGuard<'a> {
    locks: &'a DashMap<TenantId, Arc<Mutex<()>>>,
    tenant_id: TenantId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TenantGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.tenant_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Runs the notification state machine for each tenant against its stored flags.
pub struct NotificationGate {
    store: Arc<dyn NotificationStore>,
    tenant_locks: DashMap<TenantId, Arc<Mutex<()>>>,
    metrics: Arc<FreemiumMetrics>,
}

impl NotificationGate {
    pub fn new(store: Arc<dyn NotificationStore>, metrics: Arc<FreemiumMetrics>) -> Self {
        Self {
            store,
            tenant_locks: DashMap::new(),
            metrics,
        }
    }

    async fn lock_tenant(&self, tenant_id: TenantId) -> TenantGuard<'_> {
        let lock = self
            .tenant_locks
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        TenantGuard {
            locks: &self.tenant_locks,
            tenant_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Tenants with a pass running or waiting
    pub fn active_tenants(&self) -> usize {
        self.tenant_locks.len()
    }

    /// Returns the newly fired events. Flags are written back once, before returning.
    pub async fn evaluate(
        &self,
        tenant_id: TenantId,
        limits: &EvaluatedLimits,
    ) -> Vec<NotificationEvent> {
        if !limits.metered || limits.is_subscribed {
            return Vec::new();
        }
        let _guard = self.lock_tenant(tenant_id).await;

        let persisted = match self.store.load(tenant_id).await {
            Ok(persisted) => persisted,
            Err(e) => {
                self.metrics.record_store_failure();
                warn!(%tenant_id, "Failed to load notification state, starting fresh: {e}");
                PersistedNotifications::default()
            }
        };
        let (mut state, changed) = NotificationState::restore(&persisted, limits.billing_period);
        let fired = state.advance(limits);

        if changed || !fired.is_empty() {
            if let Err(e) = self.store.save(tenant_id, &state.persist()).await {
                self.metrics.record_store_failure();
                warn!(%tenant_id, "Failed to save notification state: {e}");
            }
        }

        fired
            .into_iter()
            .map(|(resource, threshold)| {
                debug!(%tenant_id, %resource, %threshold, "Usage threshold crossed");
                NotificationEvent::new(
                    tenant_id,
                    limits.plan,
                    &limits.resource(resource),
                    threshold,
                    limits.period.clone(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorDetails};
    use crate::notification::MemoryNotificationStore;
    use crate::usage_limit::{evaluate, PlanResolution, UsageCount, UsageSnapshot};
    use async_trait::async_trait;
    use tracing_test::traced_test;
    use uuid::Uuid;

    struct UnavailableStore;

    #[async_trait]
    impl NotificationStore for UnavailableStore {
        async fn load(&self, _tenant_id: TenantId) -> Result<PersistedNotifications, Error> {
            Err(Error::new(ErrorDetails::NotificationStore {
                message: "store offline".to_string(),
            }))
        }

        async fn save(
            &self,
            _tenant_id: TenantId,
            _persisted: &PersistedNotifications,
        ) -> Result<(), Error> {
            Err(Error::new(ErrorDetails::NotificationStore {
                message: "store offline".to_string(),
            }))
        }
    }

    const JANUARY: BillingPeriod = BillingPeriod {
        year: 2025,
        month: 1,
    };
    const FEBRUARY: BillingPeriod = BillingPeriod {
        year: 2025,
        month: 2,
    };

    fn orders(period: BillingPeriod, count: u64) -> EvaluatedLimits {
        evaluate(
            &UsageSnapshot::new(period).with_count(ResourceKind::Orders, count),
            PlanResolution::FREE,
        )
    }

    #[test]
    fn test_advance_fires_each_threshold_once() {
        let mut state = NotificationState::fresh(JANUARY);
        let mut fired = Vec::new();
        for count in [0, 10, 30, 35, 36, 40, 44, 45, 46, 48, 50] {
            fired.extend(state.advance(&orders(JANUARY, count)));
        }
        assert_eq!(
            fired,
            vec![
                (ResourceKind::Orders, Threshold::Seventy),
                (ResourceKind::Orders, Threshold::Ninety)
            ]
        );
    }

    #[test]
    fn test_jump_past_ninety_fires_only_critical() {
        let mut state = NotificationState::fresh(JANUARY);
        assert_eq!(
            state.advance(&orders(JANUARY, 47)),
            vec![(ResourceKind::Orders, Threshold::Ninety)]
        );
        assert!(state.is_fired(ResourceKind::Orders, Threshold::Seventy));
        assert!(state.advance(&orders(JANUARY, 40)).is_empty());
    }

    #[test]
    fn test_decrease_does_not_rearm() {
        let mut state = NotificationState::fresh(JANUARY);
        state.advance(&orders(JANUARY, 48));
        assert!(state.advance(&orders(JANUARY, 25)).is_empty());
        assert!(state.advance(&orders(JANUARY, 48)).is_empty());
        assert!(state.is_fired(ResourceKind::Orders, Threshold::Ninety));
    }

    #[test]
    fn test_unlimited_and_degraded_resources_never_fire() {
        let snapshot = UsageSnapshot::new(JANUARY).with_count(ResourceKind::Orders, 500);
        let professional = PlanResolution {
            plan: crate::usage_limit::PlanId::Professional,
            is_subscribed: false,
            metered: true,
        };
        let mut state = NotificationState::fresh(JANUARY);
        assert!(state.advance(&evaluate(&snapshot, professional)).is_empty());

        let mut degraded = UsageSnapshot::new(JANUARY);
        degraded
            .counts
            .insert(ResourceKind::Orders, UsageCount::Unavailable);
        assert!(state
            .advance(&evaluate(&degraded, PlanResolution::FREE))
            .is_empty());
    }

    #[test]
    fn test_restore_round_trip_and_rollover() {
        let mut state = NotificationState::fresh(JANUARY);
        state.advance(&orders(JANUARY, 36));
        let persisted = state.persist();
        assert_eq!(persisted.last_check.as_deref(), Some("2025-1"));

        let (restored, changed) = NotificationState::restore(&persisted, JANUARY);
        assert_eq!(restored, state);
        assert!(!changed);

        let (rolled, changed) = NotificationState::restore(&persisted, FEBRUARY);
        assert_eq!(rolled, NotificationState::fresh(FEBRUARY));
        assert!(changed);
    }

    #[test]
    #[traced_test]
    fn test_restore_corrupt_flags() {
        let persisted = PersistedNotifications {
            flags: Some("{orders70: yes".to_string()),
            last_check: Some("2025-1".to_string()),
        };
        let (state, changed) = NotificationState::restore(&persisted, JANUARY);
        assert_eq!(state, NotificationState::fresh(JANUARY));
        assert!(changed);
        assert!(logs_contain("Resetting corrupt notification flags"));
    }

    #[test]
    fn test_restore_ignores_unknown_and_false_flags() {
        let flags = r#"{"orders70": true, "orders90": false, "invoices70": true}"#;
        let persisted = PersistedNotifications {
            flags: Some(flags.to_string()),
            last_check: Some("2025-1".to_string()),
        };
        let (state, _) = NotificationState::restore(&persisted, JANUARY);
        assert!(state.is_fired(ResourceKind::Orders, Threshold::Seventy));
        assert!(!state.is_fired(ResourceKind::Orders, Threshold::Ninety));
    }

    #[tokio::test]
    async fn test_gate_skips_subscribed_tenants_without_touching_store() {
        let store = Arc::new(MemoryNotificationStore::new());
        let gate = NotificationGate::new(store.clone(), Arc::new(FreemiumMetrics::default()));
        let tenant = Uuid::now_v7();
        let mut limits = orders(JANUARY, 49);
        limits.is_subscribed = true;

        assert!(gate.evaluate(tenant, &limits).await.is_empty());
        assert!(store.get(tenant).is_none());
    }

    #[tokio::test]
    async fn test_gate_persists_flags_between_passes() {
        let store = Arc::new(MemoryNotificationStore::new());
        let gate = NotificationGate::new(store.clone(), Arc::new(FreemiumMetrics::default()));
        let tenant = Uuid::now_v7();

        let events = gate.evaluate(tenant, &orders(JANUARY, 36)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].threshold, Threshold::Seventy);
        assert_eq!(events[0].period, "2025-1");

        let raw_flags = store.get(tenant).unwrap().flags.unwrap();
        let flags: BTreeMap<String, bool> = serde_json::from_str(&raw_flags).unwrap();
        assert_eq!(flags.get("orders70"), Some(&true));
        assert_eq!(flags.get("orders90"), Some(&false));

        assert!(gate.evaluate(tenant, &orders(JANUARY, 40)).await.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_gate_survives_unavailable_store() {
        let metrics = Arc::new(FreemiumMetrics::default());
        let gate = NotificationGate::new(Arc::new(UnavailableStore), metrics.clone());
        let tenant = Uuid::now_v7();

        let events = gate.evaluate(tenant, &orders(JANUARY, 46)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].threshold, Threshold::Ninety);
        assert_eq!(metrics.snapshot().store_failures, 2);
        assert!(logs_contain(
            "Failed to load notification state, starting fresh"
        ));
        assert!(logs_contain("Failed to save notification state"));

        // nothing was persisted, so the next pass starts unarmed again
        let events = gate.evaluate(tenant, &orders(JANUARY, 46)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(metrics.snapshot().store_failures, 4);
    }

    #[tokio::test]
    async fn test_tenant_locks_are_released_after_each_pass() {
        let gate = NotificationGate::new(
            Arc::new(MemoryNotificationStore::new()),
            Arc::new(FreemiumMetrics::default()),
        );
        for _ in 0..1_000 {
            gate.evaluate(Uuid::now_v7(), &orders(JANUARY, 36)).await;
        }
        assert_eq!(gate.active_tenants(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_passes_fire_once() {
        let gate = NotificationGate::new(
            Arc::new(MemoryNotificationStore::new()),
            Arc::new(FreemiumMetrics::default()),
        );
        let tenant = Uuid::now_v7();
        let limits = orders(JANUARY, 36);

        let passes =
            futures::future::join_all((0..64).map(|_| gate.evaluate(tenant, &limits))).await;
        let fired: usize = passes.iter().map(Vec::len).sum();
        assert_eq!(fired, 1);
        assert_eq!(gate.active_tenants(), 0);
    }
}

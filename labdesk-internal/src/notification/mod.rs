//! Tiered usage notifications.
//!
//! Each bounded resource alerts once at 70% and once at 90% of its limit per
//! billing period. Flags are sticky until the period key changes.

pub mod gate;
pub mod notifier;
pub mod store;

pub use gate::{NotificationGate, NotificationState};
pub use notifier::{LogNotifier, Notifier, NotifierSet, WebhookNotifier};
pub use store::{
    FileNotificationStore, MemoryNotificationStore, NotificationStore, PersistedNotifications,
    RedisNotificationStore,
};

use serde::{Serialize, Serializer};
use strum::{AsRefStr, Display};

use crate::usage_limit::{Limit, PlanId, ResourceKind, ResourceLimit, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Threshold {
    Seventy,
    Ninety,
}

impl Threshold {
    pub const ALL: [Threshold; 2] = [Threshold::Seventy, Threshold::Ninety];

    pub fn percent(&self) -> u8 {
        match self {
            Threshold::Seventy => 70,
            Threshold::Ninety => 90,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Threshold::Seventy => Severity::Alert,
            Threshold::Ninety => Severity::Critical,
        }
    }

    /// Persisted flag name, e.g. `orders70`
    pub fn flag_key(&self, resource: ResourceKind) -> String {
        format!("{}{}", resource.as_ref(), self.percent())
    }
}

impl Serialize for Threshold {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.percent())
    }
}

impl std::fmt::Display for Threshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%", self.percent())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Alert,
    Critical,
}

/// One user-facing usage notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    pub tenant_id: TenantId,
    pub resource: ResourceKind,
    pub threshold: Threshold,
    pub severity: Severity,
    pub current: u64,
    pub limit: u64,
    pub percentage: f64,
    pub period: String,
    pub title: String,
    pub message: String,
}

impl NotificationEvent {
    pub fn new(
        tenant_id: TenantId,
        plan: PlanId,
        usage: &ResourceLimit,
        threshold: Threshold,
        period: String,
    ) -> Self {
        let limit = match usage.limit {
            Limit::Bounded(n) => n,
            Limit::Unlimited => 0,
        };
        let label = usage.resource.label();
        let percentage = usage.percentage;
        let (title, message) = match threshold.severity() {
            Severity::Alert => (
                format!("You are approaching your {label} limit"),
                format!(
                    "You have used {current} of {limit} {label} ({percentage:.0}%) on the {plan} plan. \
                     Upgrade your plan to keep working without interruption.",
                    current = usage.current,
                ),
            ),
            Severity::Critical => (
                format!("You are about to run out of {label}"),
                format!(
                    "You have used {current} of {limit} {label} ({percentage:.0}%) on the {plan} plan. \
                     Upgrade now to avoid being blocked.",
                    current = usage.current,
                ),
            ),
        };
        Self {
            tenant_id,
            resource: usage.resource,
            threshold,
            severity: threshold.severity(),
            current: usage.current,
            limit,
            percentage,
            period,
            title,
            message,
        }
    }
}

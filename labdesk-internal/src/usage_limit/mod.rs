pub mod counter;
pub mod evaluator;
pub mod limiter;
pub mod period;
pub mod plan;
pub mod subscription;

pub use counter::{UsageCount, UsageCounter, UsageSnapshot};
pub use evaluator::{evaluate, CreatePermissions, EvaluatedLimits, ResourceLimit};
pub use limiter::{FreemiumLimiter, FreemiumLimiterConfig, FreemiumMetrics, MetricsSnapshot};
pub use period::{BillingPeriod, Clock, SystemClock};
pub use plan::{PlanId, PlanLimits};
pub use subscription::{
    PlanResolution, SubscriptionRecord, SubscriptionResolver, SubscriptionStatus, TenantRole,
};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

pub type TenantId = Uuid;

/// A resource whose creation is metered against the tenant's plan
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
    Orders,
    Patients,
    ImageGenerations,
    PdfGenerations,
    PriceTables,
    MonthlyReports,
}

/// How a resource's count is windowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Only records from the current calendar month count
    Monthly,
    /// Every record the tenant ever created counts
    Cumulative,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Orders,
        ResourceKind::Patients,
        ResourceKind::ImageGenerations,
        ResourceKind::PdfGenerations,
        ResourceKind::PriceTables,
        ResourceKind::MonthlyReports,
    ];

    pub fn reset_policy(&self) -> ResetPolicy {
        match self {
            ResourceKind::Orders
            | ResourceKind::ImageGenerations
            | ResourceKind::PdfGenerations
            | ResourceKind::MonthlyReports => ResetPolicy::Monthly,
            ResourceKind::Patients | ResourceKind::PriceTables => ResetPolicy::Cumulative,
        }
    }

    /// Human-readable name used in notification copy
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Orders => "orders",
            ResourceKind::Patients => "patients",
            ResourceKind::ImageGenerations => "image generations",
            ResourceKind::PdfGenerations => "PDF generations",
            ResourceKind::PriceTables => "price tables",
            ResourceKind::MonthlyReports => "monthly reports",
        }
    }
}

/// A plan's cap on one resource.
///
/// Serialized as the bare number for bounded limits and as `"unlimited"` otherwise.
/// The legacy `-1` sentinel is accepted when deserializing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Limit {
    Bounded(u64),
    Unlimited,
}

impl Limit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Limit::Unlimited)
    }
}

impl Serialize for Limit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Limit::Bounded(n) => serializer.serialize_u64(*n),
            Limit::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_untagged::UntaggedEnumVisitor::new()
            .u64(|n| Ok(Limit::Bounded(n)))
            .i64(|n| match n {
                -1 => Ok(Limit::Unlimited),
                n if n >= 0 => Ok(Limit::Bounded(n.unsigned_abs())),
                n => Err(serde_untagged::de::Error::custom(format!(
                    "invalid limit `{n}`"
                ))),
            })
            .string(|s| match s {
                "unlimited" => Ok(Limit::Unlimited),
                other => Err(serde_untagged::de::Error::custom(format!(
                    "invalid limit `{other}`"
                ))),
            })
            .deserialize(deserializer)
    }
}

/// Outcome of asking whether a tenant may create one more of a resource
#[derive(Debug, PartialEq)]
pub enum UsageLimitDecision {
    Allow,
    Deny {
        resource: ResourceKind,
        current: u64,
        limit: u64,
        reason: String,
    },
}

impl UsageLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, UsageLimitDecision::Allow)
    }
}

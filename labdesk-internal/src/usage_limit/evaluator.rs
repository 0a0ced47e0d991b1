use std::collections::BTreeMap;

use serde::Serialize;

use super::{BillingPeriod, Limit, PlanId, PlanResolution, ResourceKind, UsageCount, UsageSnapshot};

/// Where one resource stands against its plan limit
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceLimit {
    pub resource: ResourceKind,
    pub current: u64,
    pub limit: Limit,
    /// 0 to 100, always 0 for unlimited resources
    pub percentage: f64,
    pub allowed: bool,
    /// The count could not be read and the resource is blocked until it can
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl ResourceLimit {
    fn evaluate(resource: ResourceKind, count: UsageCount, limit: Limit) -> Self {
        match (limit, count) {
            (Limit::Unlimited, count) => Self {
                resource,
                current: count.value(),
                limit,
                percentage: 0.0,
                allowed: true,
                degraded: false,
            },
            (Limit::Bounded(_), UsageCount::Unavailable) => Self {
                resource,
                current: 0,
                limit,
                percentage: 0.0,
                allowed: false,
                degraded: true,
            },
            (Limit::Bounded(max), UsageCount::Known(current)) => Self {
                resource,
                current,
                limit,
                percentage: percentage_of(current, max),
                allowed: current < max,
                degraded: false,
            },
        }
    }
}

fn percentage_of(current: u64, max: u64) -> f64 {
    if max == 0 {
        return 100.0;
    }
    (current as f64 / max as f64 * 100.0).clamp(0.0, 100.0)
}

/// Named create/generate permissions, one per resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreatePermissions {
    pub can_create_order: bool,
    pub can_create_patient: bool,
    pub can_generate_image: bool,
    pub can_generate_pdf: bool,
    pub can_create_price_table: bool,
    pub can_create_monthly_report: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluatedLimits {
    pub plan: PlanId,
    pub is_subscribed: bool,
    pub metered: bool,
    pub period: String,
    pub resources: BTreeMap<ResourceKind, ResourceLimit>,
    #[serde(flatten)]
    pub permissions: CreatePermissions,
    #[serde(skip)]
    pub billing_period: BillingPeriod,
}

impl EvaluatedLimits {
    /// Limits for a tenant outside the freemium program. No counts are read.
    pub fn exempt(period: BillingPeriod) -> Self {
        evaluate(&UsageSnapshot::new(period), PlanResolution::EXEMPT)
    }

    pub fn resource(&self, resource: ResourceKind) -> ResourceLimit {
        let untracked = ResourceLimit {
            resource,
            current: 0,
            limit: Limit::Unlimited,
            percentage: 0.0,
            allowed: true,
            degraded: false,
        };
        self.resources.get(&resource).copied().unwrap_or(untracked)
    }

    pub fn allows(&self, resource: ResourceKind) -> bool {
        self.resource(resource).allowed
    }

    pub fn can_create_order(&self) -> bool {
        self.permissions.can_create_order
    }

    pub fn can_create_patient(&self) -> bool {
        self.permissions.can_create_patient
    }

    pub fn can_generate_image(&self) -> bool {
        self.permissions.can_generate_image
    }

    pub fn can_generate_pdf(&self) -> bool {
        self.permissions.can_generate_pdf
    }

    pub fn can_create_price_table(&self) -> bool {
        self.permissions.can_create_price_table
    }

    pub fn can_create_monthly_report(&self) -> bool {
        self.permissions.can_create_monthly_report
    }
}

/// Pure: the same snapshot and resolution always give the same result.
pub fn evaluate(snapshot: &UsageSnapshot, resolution: PlanResolution) -> EvaluatedLimits {
    let plan_limits = resolution.plan.limits();
    let resources: BTreeMap<ResourceKind, ResourceLimit> = ResourceKind::ALL
        .into_iter()
        .map(|resource| {
            let limit = if resolution.metered {
                plan_limits.limit_for(resource)
            } else {
                Limit::Unlimited
            };
            (
                resource,
                ResourceLimit::evaluate(resource, snapshot.count(resource), limit),
            )
        })
        .collect();
    let allowed = |resource| resources.get(&resource).is_none_or(|r| r.allowed);
    let permissions = CreatePermissions {
        can_create_order: allowed(ResourceKind::Orders),
        can_create_patient: allowed(ResourceKind::Patients),
        can_generate_image: allowed(ResourceKind::ImageGenerations),
        can_generate_pdf: allowed(ResourceKind::PdfGenerations),
        can_create_price_table: allowed(ResourceKind::PriceTables),
        can_create_monthly_report: allowed(ResourceKind::MonthlyReports),
    };

    EvaluatedLimits {
        plan: resolution.plan,
        is_subscribed: resolution.is_subscribed,
        metered: resolution.metered,
        period: snapshot.period.key(),
        resources,
        permissions,
        billing_period: snapshot.period,
    }
}

//! Static plan catalog.
//!
//! | Resource                | free | basic     | professional | premium   |
//! |-------------------------|------|-----------|--------------|-----------|
//! | orders / month          | 50   | 120       | unlimited    | unlimited |
//! | patients (total)        | 50   | 120       | unlimited    | unlimited |
//! | image generations/month | 20   | 70        | 140          | unlimited |
//! | PDF generations / month | 30   | 150       | 300          | unlimited |
//! | price tables (total)    | 1    | unlimited | unlimited    | unlimited |
//! | monthly reports / month | 3    | 40        | unlimited    | unlimited |

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::{Limit, ResourceKind};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlanId {
    Free,
    Basic,
    Professional,
    Premium,
}

impl PlanId {
    /// Buckets a billing provider's plan name. Matching is a case-insensitive
    /// substring test in the order basic, professional, premium; anything else is free.
    pub fn from_plan_name(plan_name: &str) -> Self {
        let plan_name = plan_name.to_lowercase();
        if plan_name.contains("basic") {
            PlanId::Basic
        } else if plan_name.contains("professional") {
            PlanId::Professional
        } else if plan_name.contains("premium") {
            PlanId::Premium
        } else {
            PlanId::Free
        }
    }

    pub fn limits(&self) -> PlanLimits {
        PlanLimits::for_plan(*self)
    }
}

/// Per-resource caps for one plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanLimits {
    pub orders_per_month: Limit,
    pub patients: Limit,
    pub image_generations_per_month: Limit,
    pub pdf_generations_per_month: Limit,
    pub price_tables: Limit,
    pub monthly_reports_per_month: Limit,
}

impl PlanLimits {
    pub const fn for_plan(plan: PlanId) -> Self {
        use crate::usage_limit::Limit::{Bounded, Unlimited};
        match plan {
            PlanId::Free => Self {
                orders_per_month: Bounded(50),
                patients: Bounded(50),
                image_generations_per_month: Bounded(20),
                pdf_generations_per_month: Bounded(30),
                price_tables: Bounded(1),
                monthly_reports_per_month: Bounded(3),
            },
            PlanId::Basic => Self {
                orders_per_month: Bounded(120),
                patients: Bounded(120),
                image_generations_per_month: Bounded(70),
                pdf_generations_per_month: Bounded(150),
                price_tables: Unlimited,
                monthly_reports_per_month: Bounded(40),
            },
            PlanId::Professional => Self {
                orders_per_month: Unlimited,
                patients: Unlimited,
                image_generations_per_month: Bounded(140),
                pdf_generations_per_month: Bounded(300),
                price_tables: Unlimited,
                monthly_reports_per_month: Unlimited,
            },
            PlanId::Premium => Self {
                orders_per_month: Unlimited,
                patients: Unlimited,
                image_generations_per_month: Unlimited,
                pdf_generations_per_month: Unlimited,
                price_tables: Unlimited,
                monthly_reports_per_month: Unlimited,
            },
        }
    }

    pub fn limit_for(&self, resource: ResourceKind) -> Limit {
        match resource {
            ResourceKind::Orders => self.orders_per_month,
            ResourceKind::Patients => self.patients,
            ResourceKind::ImageGenerations => self.image_generations_per_month,
            ResourceKind::PdfGenerations => self.pdf_generations_per_month,
            ResourceKind::PriceTables => self.price_tables,
            ResourceKind::MonthlyReports => self.monthly_reports_per_month,
        }
    }
}

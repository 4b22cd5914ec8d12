//! Plan catalog model.
//!
//! A plan names the features a subscriber may use, their limits, and an
//! optional pricing configuration with tiered rates.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, Time};

use tally_shared::{FeatureId, Money, PlanId, PriceId};

/// Plan catalog status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Active,
    Archived,
}

/// How a feature's consumption is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    /// Summed quantity against a limit per period.
    Metered,
    /// On/off: enabled when `limit > 0`.
    Boolean,
    /// Headcount.
    Seat,
}

/// The window over which metered usage is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Monthly,
    Yearly,
    None,
}

impl Period {
    /// The first instant of the current window: first of the month, first
    /// of the year, or the epoch for [`Period::None`]. Events stamped
    /// exactly at this instant belong to the previous window.
    pub fn start_of(self, now: OffsetDateTime) -> OffsetDateTime {
        let start = match self {
            Period::Monthly => Date::from_calendar_date(now.year(), now.month(), 1),
            Period::Yearly => Date::from_calendar_date(now.year(), time::Month::January, 1),
            Period::None => return OffsetDateTime::UNIX_EPOCH,
        };
        start
            .expect("first day of a real month")
            .with_time(Time::MIDNIGHT)
            .assume_offset(now.offset())
    }
}

/// A billing plan: the unit of the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    /// Unique per app; the human-facing handle ("pro", "team").
    pub slug: String,
    #[serde(default)]
    pub description: String,
    pub currency: String,
    pub status: PlanStatus,
    #[serde(default)]
    pub trial_days: i32,
    pub features: Vec<Feature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<Pricing>,
    pub app_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A quota dimension on a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    /// Stable key, unique within the plan ("api_calls").
    pub key: String,
    pub name: String,
    #[serde(rename = "type")]
    pub feature_type: FeatureType,
    /// `-1` means unlimited; for boolean features `> 0` means enabled.
    pub limit: i64,
    pub period: Period,
    /// Usage above the limit is permitted but reported.
    #[serde(default)]
    pub soft_limit: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Pricing configuration owned by a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pricing {
    pub id: PriceId,
    pub plan_id: PlanId,
    pub base_amount: Money,
    pub billing_period: Period,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tiers: Vec<PriceTier>,
}

/// Tier shape for usage pricing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierType {
    Graduated,
    Volume,
    Flat,
}

/// One rate band of a feature's tiered price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTier {
    pub feature_key: String,
    #[serde(rename = "type")]
    pub tier_type: TierType,
    /// Upper bound of the band; `-1` marks the unlimited top tier.
    pub up_to: i64,
    pub unit_amount: Money,
    pub flat_amount: Money,
    /// Tiebreak when bands overlap; lower wins.
    pub priority: i32,
}

/// Filters for listing plans.
#[derive(Debug, Clone, Default)]
pub struct PlanListOpts {
    pub status: Option<PlanStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Plan {
    /// Finds a feature by key.
    pub fn find_feature(&self, key: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.key == key)
    }

    /// Whether usage at `current_usage` is still permitted for `feature_key`.
    pub fn allows(&self, feature_key: &str, current_usage: i64) -> bool {
        let Some(f) = self.find_feature(feature_key) else {
            return false;
        };
        if f.feature_type == FeatureType::Boolean {
            return f.limit > 0;
        }
        if f.limit == -1 {
            return true;
        }
        current_usage < f.limit || f.soft_limit
    }
}

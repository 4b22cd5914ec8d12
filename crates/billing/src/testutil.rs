//! Fixture builders shared by unit tests.

use std::collections::HashMap;

use time::{Duration, OffsetDateTime};

use tally_shared::{usd, Id, Prefix};

use crate::meter::UsageEvent;
use crate::plan::{Feature, FeatureType, Period, Plan, PlanStatus, Pricing};
use crate::subscription::{Subscription, SubscriptionStatus};

pub fn plan_with_feature(key: &str, feature_type: FeatureType, limit: i64) -> Plan {
    let now = OffsetDateTime::now_utc();
    Plan {
        id: Id::new(Prefix::Plan),
        name: "Pro".into(),
        slug: "pro".into(),
        description: String::new(),
        currency: "usd".into(),
        status: PlanStatus::Active,
        trial_days: 0,
        features: vec![Feature {
            id: Id::new(Prefix::Feature),
            key: key.into(),
            name: key.into(),
            feature_type,
            limit,
            period: Period::Monthly,
            soft_limit: false,
            metadata: HashMap::new(),
        }],
        pricing: None,
        app_id: "a1".into(),
        metadata: HashMap::new(),
        created_at: now,
        updated_at: now,
    }
}

pub fn plan_with_base_fee(key: &str, limit: i64, base_cents: i64) -> Plan {
    let mut plan = plan_with_feature(key, FeatureType::Metered, limit);
    plan.pricing = Some(Pricing {
        id: Id::new(Prefix::Price),
        plan_id: plan.id,
        base_amount: usd(base_cents),
        billing_period: Period::Monthly,
        tiers: Vec::new(),
    });
    plan
}

pub fn active_subscription(tenant_id: &str, app_id: &str, plan: &Plan) -> Subscription {
    let now = OffsetDateTime::now_utc();
    Subscription {
        id: Id::new(Prefix::Subscription),
        tenant_id: tenant_id.into(),
        app_id: app_id.into(),
        plan_id: plan.id,
        status: SubscriptionStatus::Active,
        current_period_start: now,
        current_period_end: now + Duration::days(30),
        trial_start: None,
        trial_end: None,
        canceled_at: None,
        cancel_at: None,
        ended_at: None,
        provider_id: String::new(),
        provider_name: String::new(),
        metadata: HashMap::new(),
        created_at: now,
        updated_at: now,
    }
}

pub fn usage_event(
    tenant_id: &str,
    app_id: &str,
    feature_key: &str,
    quantity: i64,
    timestamp: OffsetDateTime,
) -> UsageEvent {
    UsageEvent {
        id: Id::new(Prefix::UsageEvent),
        tenant_id: tenant_id.into(),
        app_id: app_id.into(),
        feature_key: feature_key.into(),
        quantity,
        timestamp,
        idempotency_key: String::new(),
        metadata: HashMap::new(),
    }
}

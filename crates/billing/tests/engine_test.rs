//! End-to-end engine scenarios over the in-memory store.
//!
//! These exercise the full billing path: catalog setup, subscription
//! creation, metering through the buffered pipeline, entitlement
//! decisions, quota events, and invoice generation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use tally_billing::{
    BillingError, BillingResult, Context, Coupon, CouponType, CouponValidator, EventKind, Feature,
    FeatureType, InvoiceStatus, LineItemType, MemoryStore, Period, Plan, PlanStatus, Plugin,
    Pricing, QuotaBreach, Store, Subscription, SubscriptionStatus, Tally, TallyConfig,
};
use tally_shared::{usd, Id, Money, Prefix};
use time::OffsetDateTime;

// ============================================================================
// Test Utilities
// ============================================================================

fn test_config() -> TallyConfig {
    TallyConfig {
        // Zero TTL keeps every entitlement check fresh so consecutive
        // checks observe metered usage immediately.
        entitlement_cache_ttl: Duration::ZERO,
        ..TallyConfig::default()
    }
}

async fn engine_with(config: TallyConfig) -> (Tally, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = Tally::with_config(store.clone(), config);
    engine.start(&Context::new()).await.expect("engine start");
    (engine, store)
}

fn pro_plan(limit: i64, soft_limit: bool, base_cents: i64) -> Plan {
    let now = OffsetDateTime::now_utc();
    let plan_id = Id::new(Prefix::Plan);
    Plan {
        id: plan_id,
        name: "Pro".into(),
        slug: "pro".into(),
        description: "Professional tier".into(),
        currency: "usd".into(),
        status: PlanStatus::Active,
        trial_days: 0,
        features: vec![Feature {
            id: Id::new(Prefix::Feature),
            key: "api_calls".into(),
            name: "API calls".into(),
            feature_type: FeatureType::Metered,
            limit,
            period: Period::Monthly,
            soft_limit,
            metadata: HashMap::new(),
        }],
        pricing: Some(Pricing {
            id: Id::new(Prefix::Price),
            plan_id,
            base_amount: usd(base_cents),
            billing_period: Period::Monthly,
            tiers: Vec::new(),
        }),
        app_id: "a1".into(),
        metadata: HashMap::new(),
        created_at: now,
        updated_at: now,
    }
}

fn subscription_for(plan: &Plan) -> Subscription {
    let now = OffsetDateTime::now_utc();
    Subscription {
        id: Id::NIL,
        tenant_id: "t1".into(),
        app_id: "a1".into(),
        plan_id: plan.id,
        status: SubscriptionStatus::Active,
        current_period_start: now,
        current_period_end: now,
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

/// Creates the plan + subscription pair every scenario starts from.
async fn provision(engine: &Tally, plan: Plan) -> Subscription {
    let ctx = Context::new();
    let plan = engine.create_plan(&ctx, plan).await.expect("create plan");
    engine
        .create_subscription(&ctx, subscription_for(&plan))
        .await
        .expect("create subscription")
}

/// Meters `total` units in chunks the buffer can absorb, flushing along
/// the way.
async fn meter_units(engine: &Tally, ctx: &Context, total: i64) {
    let mut remaining = total;
    while remaining > 0 {
        let chunk = remaining.min(5_000);
        for _ in 0..chunk {
            engine.meter(ctx, "api_calls", 1).await.expect("meter");
        }
        engine.flush_meter().await.expect("flush");
        remaining -= chunk;
    }
}

struct QuotaWatcher {
    breaches: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

#[async_trait]
impl Plugin for QuotaWatcher {
    fn name(&self) -> &str {
        "quota-watcher"
    }

    fn capabilities(&self) -> &[EventKind] {
        &[EventKind::QuotaExceeded]
    }

    async fn on_quota_exceeded(&self, breach: QuotaBreach) -> BillingResult<()> {
        assert_eq!(breach.tenant_id, "t1");
        assert_eq!(breach.feature_key, "api_calls");
        self.breaches.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
        Ok(())
    }
}

struct FlushWatcher {
    flushes: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

#[async_trait]
impl Plugin for FlushWatcher {
    fn name(&self) -> &str {
        "flush-watcher"
    }

    fn capabilities(&self) -> &[EventKind] {
        &[EventKind::UsageFlushed]
    }

    async fn on_usage_flushed(&self, count: usize, _elapsed: Duration) -> BillingResult<()> {
        assert!(count > 0);
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
        Ok(())
    }
}

// ============================================================================
// Entitlement scenarios
// ============================================================================

#[tokio::test]
async fn fresh_subscription_has_full_quota() {
    let (engine, _) = engine_with(test_config()).await;
    provision(&engine, pro_plan(10_000, false, 4_900)).await;

    let ctx = Context::for_tenant("t1", "a1");
    let decision = engine.entitled(&ctx, "api_calls").await.expect("entitled");

    assert!(decision.allowed);
    assert_eq!(decision.used, 0);
    assert_eq!(decision.limit, 10_000);
    assert_eq!(decision.remaining, 10_000);

    engine.stop().await.expect("stop");
}

#[tokio::test]
async fn hard_limit_denies_and_fires_quota_exceeded() {
    let (engine, _) = engine_with(test_config()).await;
    let breaches = Arc::new(AtomicUsize::new(0));
    let notify = Arc::new(Notify::new());
    engine
        .register_plugin(Arc::new(QuotaWatcher { breaches: breaches.clone(), notify: notify.clone() }))
        .expect("register");
    provision(&engine, pro_plan(10_000, false, 4_900)).await;

    let ctx = Context::for_tenant("t1", "a1");

    meter_units(&engine, &ctx, 9_999).await;
    let decision = engine.entitled(&ctx, "api_calls").await.expect("entitled");
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 1);

    engine.meter(&ctx, "api_calls", 1).await.expect("meter");
    engine.flush_meter().await.expect("flush");

    let decision = engine.entitled(&ctx, "api_calls").await.expect("entitled");
    assert!(!decision.allowed);
    assert_eq!(decision.used, 10_000);
    assert_eq!(decision.remaining, 0);
    assert_eq!(decision.reason, "quota exceeded");

    notify.notified().await;
    assert_eq!(breaches.load(Ordering::SeqCst), 1);

    engine.stop().await.expect("stop");
}

#[tokio::test]
async fn soft_limit_allows_overage_with_reason() {
    let (engine, _) = engine_with(test_config()).await;
    provision(&engine, pro_plan(10_000, true, 4_900)).await;

    let ctx = Context::for_tenant("t1", "a1");
    meter_units(&engine, &ctx, 10_001).await;

    let decision = engine.entitled(&ctx, "api_calls").await.expect("entitled");
    assert!(decision.allowed);
    assert_eq!(decision.used, 10_001);
    assert_eq!(decision.remaining, 0);
    assert_eq!(decision.reason, "over soft limit");

    engine.stop().await.expect("stop");
}

#[tokio::test]
async fn unlimited_features_always_allow() {
    let (engine, _) = engine_with(test_config()).await;
    provision(&engine, pro_plan(-1, false, 0)).await;

    let ctx = Context::for_tenant("t1", "a1");
    meter_units(&engine, &ctx, 500).await;

    let decision = engine.entitled(&ctx, "api_calls").await.expect("entitled");
    assert!(decision.allowed);
    assert_eq!(decision.remaining, -1);
    assert_eq!(engine.remaining(&ctx, "api_calls").await.expect("remaining"), -1);

    engine.stop().await.expect("stop");
}

#[tokio::test]
async fn missing_context_denies_without_error() {
    let (engine, _) = engine_with(test_config()).await;

    let decision = engine.entitled(&Context::new(), "api_calls").await.expect("entitled");
    assert!(!decision.allowed);
    assert_eq!(decision.reason, "missing tenant or app context");

    let decision = engine
        .entitled(&Context::for_tenant("t-unknown", "a1"), "api_calls")
        .await
        .expect("entitled");
    assert!(!decision.allowed);
    assert_eq!(decision.reason, "no active subscription");

    engine.stop().await.expect("stop");
}

#[tokio::test]
async fn cached_decisions_are_invalidated_by_subscription_writes() {
    // Real 30 s TTL: the second check must come from the cache.
    let (engine, _) = engine_with(TallyConfig::default()).await;
    let sub = provision(&engine, pro_plan(10_000, false, 4_900)).await;

    let ctx = Context::for_tenant("t1", "a1");
    let first = engine.entitled(&ctx, "api_calls").await.expect("entitled");
    assert!(first.allowed);

    // Usage lands, but the cached decision still answers.
    meter_units(&engine, &ctx, 42).await;
    let cached = engine.entitled(&ctx, "api_calls").await.expect("entitled");
    assert_eq!(cached.used, 0);

    // A subscription write invalidates the pair; the next check reflects
    // the post-write state.
    engine.cancel_subscription(&ctx, sub.id, true).await.expect("cancel");
    let fresh = engine.entitled(&ctx, "api_calls").await.expect("entitled");
    assert!(!fresh.allowed);
    assert_eq!(fresh.reason, "no active subscription");

    engine.stop().await.expect("stop");
}

#[tokio::test]
async fn boolean_features_gate_on_limit() {
    let (engine, _) = engine_with(test_config()).await;
    let mut plan = pro_plan(10_000, false, 0);
    plan.features.push(Feature {
        id: Id::new(Prefix::Feature),
        key: "sso".into(),
        name: "Single sign-on".into(),
        feature_type: FeatureType::Boolean,
        limit: 1,
        period: Period::None,
        soft_limit: false,
        metadata: HashMap::new(),
    });
    provision(&engine, plan).await;

    let ctx = Context::for_tenant("t1", "a1");
    assert!(engine.entitled(&ctx, "sso").await.expect("entitled").allowed);

    let missing = engine.entitled(&ctx, "webhooks").await.expect("entitled");
    assert!(!missing.allowed);
    assert_eq!(missing.reason, "feature not in plan");

    engine.stop().await.expect("stop");
}

// ============================================================================
// Metering pipeline
// ============================================================================

#[tokio::test]
async fn idempotency_keys_deduplicate_across_submissions() {
    let (engine, _) = engine_with(test_config()).await;
    provision(&engine, pro_plan(10_000, false, 0)).await;

    let ctx = Context::for_tenant("t1", "a1");
    engine.meter_with_key(&ctx, "api_calls", 5, "req-42").await.expect("meter");
    engine.meter_with_key(&ctx, "api_calls", 5, "req-42").await.expect("meter retry");
    engine.flush_meter().await.expect("flush");

    let decision = engine.entitled(&ctx, "api_calls").await.expect("entitled");
    assert_eq!(decision.used, 5);

    engine.stop().await.expect("stop");
}

#[tokio::test]
async fn metered_quantities_survive_the_pipeline() {
    let (engine, store) = engine_with(test_config()).await;
    provision(&engine, pro_plan(10_000, false, 0)).await;

    let ctx = Context::for_tenant("t1", "a1");
    engine.meter(&ctx, "api_calls", 3).await.expect("meter");
    engine.meter(&ctx, "api_calls", 4).await.expect("meter");
    engine.flush_meter().await.expect("flush");

    let total = store.aggregate("t1", "a1", "api_calls", Period::Monthly).await.expect("sum");
    assert_eq!(total, 7);

    engine.stop().await.expect("stop");
}

#[tokio::test]
async fn a_full_batch_flushes_without_waiting_for_the_tick() {
    let flushes = Arc::new(AtomicUsize::new(0));
    let notify = Arc::new(Notify::new());
    let config = TallyConfig {
        meter_batch_size: 3,
        meter_flush_interval: Duration::from_secs(3_600),
        ..test_config()
    };
    let (engine, store) = engine_with(config).await;
    engine
        .register_plugin(Arc::new(FlushWatcher { flushes: flushes.clone(), notify: notify.clone() }))
        .expect("register");
    provision(&engine, pro_plan(10_000, false, 0)).await;

    let ctx = Context::for_tenant("t1", "a1");
    for _ in 0..3 {
        engine.meter(&ctx, "api_calls", 1).await.expect("meter");
    }

    // The third event fills the batch; the worker flushes immediately.
    tokio::time::timeout(Duration::from_secs(2), notify.notified())
        .await
        .expect("flush before the interval tick");
    assert_eq!(flushes.load(Ordering::SeqCst), 1);
    let total = store.aggregate("t1", "a1", "api_calls", Period::Monthly).await.expect("sum");
    assert_eq!(total, 3);

    // One event short of the batch size stays buffered.
    for _ in 0..2 {
        engine.meter(&ctx, "api_calls", 1).await.expect("meter");
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(200), notify.notified()).await.is_err(),
        "an underfull batch must wait for the tick"
    );

    engine.stop().await.expect("stop");
}

#[tokio::test]
async fn a_full_buffer_is_a_synchronous_error() {
    let store = Arc::new(MemoryStore::new());
    let config = TallyConfig { meter_buffer_capacity: 4, ..test_config() };
    // Deliberately not started: nothing drains the channel.
    let engine = Tally::with_config(store, config);

    let ctx = Context::for_tenant("t1", "a1");
    for _ in 0..4 {
        engine.meter(&ctx, "api_calls", 1).await.expect("buffer accepts up to capacity");
    }
    let err = engine.meter(&ctx, "api_calls", 1).await.expect_err("buffer full");
    assert!(matches!(err, BillingError::BufferFull));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn stop_flushes_whatever_is_buffered() {
    let config = TallyConfig {
        meter_batch_size: 1_000,
        meter_flush_interval: Duration::from_secs(3_600),
        ..test_config()
    };
    let (engine, store) = engine_with(config).await;
    provision(&engine, pro_plan(10_000, false, 0)).await;

    let ctx = Context::for_tenant("t1", "a1");
    engine.meter(&ctx, "api_calls", 2).await.expect("meter");
    engine.meter(&ctx, "api_calls", 3).await.expect("meter");

    engine.stop().await.expect("stop");

    let total = store.aggregate("t1", "a1", "api_calls", Period::Monthly).await.expect("sum");
    assert_eq!(total, 5);
}

#[tokio::test]
async fn metering_without_tenancy_is_invalid_input() {
    let (engine, _) = engine_with(test_config()).await;
    let err = engine.meter(&Context::new(), "api_calls", 1).await.expect_err("no context");
    assert!(matches!(err, BillingError::InvalidInput(_)));
    engine.stop().await.expect("stop");
}

// ============================================================================
// Invoicing
// ============================================================================

#[tokio::test]
async fn draft_invoice_carries_base_fee_and_overage_lines() {
    let (engine, _) = engine_with(test_config()).await;
    let sub = provision(&engine, pro_plan(10_000, false, 4_900)).await;

    let ctx = Context::for_tenant("t1", "a1");
    meter_units(&engine, &ctx, 10_001).await;

    let invoice = engine.generate_invoice(&ctx, sub.id).await.expect("generate");

    assert_eq!(invoice.status, InvoiceStatus::Draft);
    assert_eq!(invoice.currency, "usd");
    assert_eq!(invoice.line_items.len(), 2);

    let base = &invoice.line_items[0];
    assert_eq!(base.item_type, LineItemType::Base);
    assert_eq!(base.quantity, 1);
    assert_eq!(base.amount, usd(4_900));

    let overage = &invoice.line_items[1];
    assert_eq!(overage.item_type, LineItemType::Overage);
    assert_eq!(overage.feature_key, "api_calls");
    assert_eq!(overage.quantity, 1);
    assert_eq!(overage.amount, Money::zero("usd"));

    assert_eq!(invoice.subtotal, usd(4_900));
    assert_eq!(invoice.total, usd(4_900));

    engine.stop().await.expect("stop");
}

#[tokio::test]
async fn invoice_lifecycle_guards_hold() {
    let (engine, _) = engine_with(test_config()).await;
    let sub = provision(&engine, pro_plan(10_000, false, 4_900)).await;

    let ctx = Context::for_tenant("t1", "a1");
    let invoice = engine.generate_invoice(&ctx, sub.id).await.expect("generate");

    let finalized = engine.finalize_invoice(&ctx, invoice.id).await.expect("finalize");
    assert_eq!(finalized.status, InvoiceStatus::Pending);
    assert!(finalized.due_date.is_some());
    assert!(matches!(
        engine.finalize_invoice(&ctx, invoice.id).await,
        Err(BillingError::InvoiceFinalized)
    ));

    let paid = engine.pay_invoice(&ctx, invoice.id, "pay_abc").await.expect("pay");
    assert_eq!(paid.status, InvoiceStatus::Paid);
    assert_eq!(paid.payment_ref, "pay_abc");
    assert!(matches!(
        engine.void_invoice(&ctx, invoice.id, "mistake").await,
        Err(BillingError::InvoicePaid)
    ));

    // A separate draft can be voided, after which payment is refused.
    let second = engine.generate_invoice(&ctx, sub.id).await.expect("generate");
    engine.void_invoice(&ctx, second.id, "duplicate").await.expect("void");
    assert!(matches!(
        engine.pay_invoice(&ctx, second.id, "pay_def").await,
        Err(BillingError::InvoiceVoided)
    ));

    engine.stop().await.expect("stop");
}

// ============================================================================
// Plugin isolation
// ============================================================================

struct Erroring;

#[async_trait]
impl Plugin for Erroring {
    fn name(&self) -> &str {
        "erroring"
    }

    fn capabilities(&self) -> &[EventKind] {
        &[EventKind::PlanCreated]
    }

    async fn on_plan_created(&self, _plan: Arc<Plan>) -> BillingResult<()> {
        Err(BillingError::ProviderSync("sync exploded".into()))
    }
}

struct SlowSleeper;

#[async_trait]
impl Plugin for SlowSleeper {
    fn name(&self) -> &str {
        "slow-sleeper"
    }

    fn capabilities(&self) -> &[EventKind] {
        &[EventKind::PlanCreated]
    }

    async fn on_plan_created(&self, _plan: Arc<Plan>) -> BillingResult<()> {
        tokio::time::sleep(Duration::from_secs(6)).await;
        Ok(())
    }
}

#[tokio::test]
async fn plugin_failures_never_stall_the_billing_path() {
    let (engine, _) = engine_with(test_config()).await;
    engine.register_plugin(Arc::new(Erroring)).expect("register");
    engine.register_plugin(Arc::new(SlowSleeper)).expect("register");

    let started = std::time::Instant::now();
    let plan = engine
        .create_plan(&Context::new(), pro_plan(10_000, false, 4_900))
        .await
        .expect("create plan succeeds despite both observers failing");
    assert!(started.elapsed() < Duration::from_secs(2), "dispatch must not block the caller");

    // The engine keeps serving.
    let fetched = engine.get_plan(&Context::new(), plan.id).await.expect("get plan");
    assert_eq!(fetched.slug, "pro");

    engine.stop().await.expect("stop");
}

// ============================================================================
// Coupons
// ============================================================================

struct MinimumSubtotal;

#[async_trait]
impl Plugin for MinimumSubtotal {
    fn name(&self) -> &str {
        "minimum-subtotal"
    }

    fn as_coupon_validator(&self) -> Option<&dyn CouponValidator> {
        Some(self)
    }
}

#[async_trait]
impl CouponValidator for MinimumSubtotal {
    async fn validate_coupon(
        &self,
        coupon: &Coupon,
        _sub: Option<&Subscription>,
    ) -> BillingResult<()> {
        if coupon.code == "BLOCKED" {
            return Err(BillingError::InvalidInput("coupon blocked by policy".into()));
        }
        Ok(())
    }
}

fn launch_coupon(code: &str) -> Coupon {
    let now = OffsetDateTime::now_utc();
    Coupon {
        id: Id::NIL,
        code: code.into(),
        name: "Launch".into(),
        coupon_type: CouponType::Percentage,
        amount: Money::zero("usd"),
        percentage: 20,
        max_redemptions: 1,
        times_redeemed: 0,
        valid_from: None,
        valid_until: None,
        app_id: "a1".into(),
        metadata: HashMap::new(),
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn coupon_redemption_burns_the_budget_and_respects_validators() {
    let (engine, _) = engine_with(test_config()).await;
    engine.register_plugin(Arc::new(MinimumSubtotal)).expect("register");

    let ctx = Context::for_tenant("t1", "a1");
    engine.create_coupon(&ctx, launch_coupon("LAUNCH20")).await.expect("create");
    engine.create_coupon(&ctx, launch_coupon("BLOCKED")).await.expect("create");

    let redeemed = engine.redeem_coupon(&ctx, "LAUNCH20", "a1").await.expect("redeem");
    assert_eq!(redeemed.times_redeemed, 1);

    // max_redemptions = 1: the budget is spent.
    assert!(matches!(
        engine.redeem_coupon(&ctx, "LAUNCH20", "a1").await,
        Err(BillingError::CouponExhausted)
    ));

    // A validator veto propagates to the caller.
    assert!(matches!(
        engine.redeem_coupon(&ctx, "BLOCKED", "a1").await,
        Err(BillingError::InvalidInput(_))
    ));

    assert!(matches!(
        engine.redeem_coupon(&ctx, "MISSING", "a1").await,
        Err(BillingError::CouponNotFound)
    ));

    engine.stop().await.expect("stop");
}

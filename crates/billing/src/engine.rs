//! The billing engine.
//!
//! [`Tally`] wires the store, the plugin registry, and the metering
//! pipeline behind one public surface. Reads go through the entitlement
//! cache; writes enter a bounded in-memory channel drained by a single
//! background worker. The engine owns no other process-wide state, so
//! several instances can coexist in one process (one per test, say).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tally_shared::{Id, InvoiceId, Money, PlanId, Prefix, SubscriptionId};

use crate::context::Context;
use crate::coupon::Coupon;
use crate::entitlement::Decision;
use crate::error::{BillingError, BillingResult};
use crate::invoice::{Invoice, InvoiceListOpts, InvoiceStatus, LineItem, LineItemType};
use crate::meter::{UsageEvent, UsageQueryOpts};
use crate::plan::{FeatureType, Plan, PlanListOpts};
use crate::plugin::{Plugin, QuotaBreach};
use crate::registry::PluginRegistry;
use crate::store::Store;
use crate::subscription::{Subscription, SubscriptionListOpts};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct TallyConfig {
    /// Usage events per store flush.
    pub meter_batch_size: usize,
    /// Flush cadence when the batch stays under the size trigger.
    pub meter_flush_interval: Duration,
    /// Bounded meter channel capacity; a full channel is a caller-visible
    /// back-pressure error, never a silent drop.
    pub meter_buffer_capacity: usize,
    /// Absolute expiry for cached entitlement decisions.
    pub entitlement_cache_ttl: Duration,
    /// Wall-clock budget per plugin handler call.
    pub plugin_dispatch_timeout: Duration,
}

impl Default for TallyConfig {
    fn default() -> Self {
        TallyConfig {
            meter_batch_size: 100,
            meter_flush_interval: Duration::from_secs(5),
            meter_buffer_capacity: 10_000,
            entitlement_cache_ttl: Duration::from_secs(30),
            plugin_dispatch_timeout: Duration::from_secs(5),
        }
    }
}

enum WorkerMessage {
    Event(UsageEvent),
    Flush(oneshot::Sender<()>),
}

/// The billing engine.
pub struct Tally {
    store: Arc<dyn Store>,
    plugins: Arc<PluginRegistry>,
    config: TallyConfig,
    worker_tx: mpsc::Sender<WorkerMessage>,
    worker_rx: Mutex<Option<mpsc::Receiver<WorkerMessage>>>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Tally {
    /// An engine with default configuration.
    pub fn new(store: Arc<dyn Store>) -> Tally {
        Tally::with_config(store, TallyConfig::default())
    }

    pub fn with_config(store: Arc<dyn Store>, config: TallyConfig) -> Tally {
        let (worker_tx, worker_rx) = mpsc::channel(config.meter_buffer_capacity);
        let plugins =
            Arc::new(PluginRegistry::new().with_dispatch_timeout(config.plugin_dispatch_timeout));
        Tally {
            store,
            plugins,
            config,
            worker_tx,
            worker_rx: Mutex::new(Some(worker_rx)),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Registers a plugin. Callable before or after `start`.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> BillingResult<()> {
        self.plugins.register(plugin)
    }

    /// The plugin registry, for role resolution (pricing strategies,
    /// invoice formatters, payment providers).
    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    // Lifecycle

    /// Migrates the store, announces `init` to plugins, and launches the
    /// meter flush worker.
    pub async fn start(&self, _ctx: &Context) -> BillingResult<()> {
        let rx = self
            .worker_rx
            .lock()
            .take()
            .ok_or_else(|| BillingError::AlreadyExists("engine already started".into()))?;

        self.store.migrate().await?;
        self.plugins.emit_init();

        let worker = MeterWorker {
            store: self.store.clone(),
            plugins: self.plugins.clone(),
            batch_size: self.config.meter_batch_size,
            flush_interval: self.config.meter_flush_interval,
            shutdown: self.shutdown.clone(),
        };
        *self.worker.lock() = Some(tokio::spawn(worker.run(rx)));

        info!(
            batch_size = self.config.meter_batch_size,
            flush_interval_ms = self.config.meter_flush_interval.as_millis() as u64,
            cache_ttl_ms = self.config.entitlement_cache_ttl.as_millis() as u64,
            "billing engine started"
        );
        Ok(())
    }

    /// Stops the worker (after a final flush of everything buffered),
    /// announces `shutdown` to plugins, and closes the store.
    pub async fn stop(&self) -> BillingResult<()> {
        self.shutdown.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "meter worker did not shut down cleanly");
            }
        }

        self.plugins.emit_shutdown();
        self.store.close().await
    }

    // Catalog

    /// Creates a plan, assigning an id and timestamps when absent.
    pub async fn create_plan(&self, _ctx: &Context, mut plan: Plan) -> BillingResult<Plan> {
        if plan.app_id.is_empty() || plan.slug.is_empty() {
            return Err(BillingError::InvalidInput("plan requires app_id and slug".into()));
        }
        for (i, feature) in plan.features.iter().enumerate() {
            if plan.features[..i].iter().any(|f| f.key == feature.key) {
                return Err(BillingError::InvalidInput(format!(
                    "duplicate feature key {:?}",
                    feature.key
                )));
            }
        }

        if plan.id.is_nil() {
            plan.id = Id::new(Prefix::Plan);
        }
        let now = OffsetDateTime::now_utc();
        plan.created_at = now;
        plan.updated_at = now;

        self.store.create_plan(&plan).await?;
        self.plugins.emit_plan_created(&plan);
        Ok(plan)
    }

    pub async fn get_plan(&self, _ctx: &Context, plan_id: PlanId) -> BillingResult<Plan> {
        self.store.get_plan(plan_id).await
    }

    pub async fn get_plan_by_slug(
        &self,
        _ctx: &Context,
        slug: &str,
        app_id: &str,
    ) -> BillingResult<Plan> {
        self.store.get_plan_by_slug(slug, app_id).await
    }

    /// Persists plan changes.
    ///
    /// Does not invalidate cached entitlement decisions; callers that
    /// mutate feature limits live should call
    /// [`Store::invalidate_feature`] for the affected pairs.
    pub async fn update_plan(&self, _ctx: &Context, mut plan: Plan) -> BillingResult<Plan> {
        let old = self.store.get_plan(plan.id).await?;
        plan.updated_at = OffsetDateTime::now_utc();
        self.store.update_plan(&plan).await?;
        self.plugins.emit_plan_updated(&old, &plan);
        Ok(plan)
    }

    pub async fn archive_plan(&self, _ctx: &Context, plan_id: PlanId) -> BillingResult<()> {
        self.store.archive_plan(plan_id).await?;
        self.plugins.emit_plan_archived(plan_id);
        Ok(())
    }

    pub async fn list_plans(
        &self,
        _ctx: &Context,
        app_id: &str,
        opts: PlanListOpts,
    ) -> BillingResult<Vec<Plan>> {
        self.store.list_plans(app_id, opts).await
    }

    // Subscriptions

    /// Creates a subscription. An unset period window defaults to one
    /// month starting now.
    pub async fn create_subscription(
        &self,
        _ctx: &Context,
        mut sub: Subscription,
    ) -> BillingResult<Subscription> {
        if sub.tenant_id.is_empty() || sub.app_id.is_empty() {
            return Err(BillingError::InvalidInput(
                "subscription requires tenant_id and app_id".into(),
            ));
        }

        if sub.id.is_nil() {
            sub.id = Id::new(Prefix::Subscription);
        }
        let now = OffsetDateTime::now_utc();
        sub.created_at = now;
        sub.updated_at = now;
        if sub.current_period_end <= sub.current_period_start {
            sub.current_period_start = now;
            sub.current_period_end = one_month_later(now);
        }

        self.store.create_subscription(&sub).await?;

        // Any subscription write invalidates the tenant's cached decisions.
        let _ = self.store.invalidate(&sub.tenant_id, &sub.app_id).await;

        self.plugins.emit_subscription_created(&sub);
        Ok(sub)
    }

    pub async fn get_subscription(
        &self,
        _ctx: &Context,
        sub_id: SubscriptionId,
    ) -> BillingResult<Subscription> {
        self.store.get_subscription(sub_id).await
    }

    pub async fn get_active_subscription(
        &self,
        _ctx: &Context,
        tenant_id: &str,
        app_id: &str,
    ) -> BillingResult<Subscription> {
        self.store.get_active_subscription(tenant_id, app_id).await
    }

    pub async fn list_subscriptions(
        &self,
        _ctx: &Context,
        tenant_id: &str,
        app_id: &str,
        opts: SubscriptionListOpts,
    ) -> BillingResult<Vec<Subscription>> {
        self.store.list_subscriptions(tenant_id, app_id, opts).await
    }

    /// Cancels a subscription, either immediately or at period end.
    pub async fn cancel_subscription(
        &self,
        _ctx: &Context,
        sub_id: SubscriptionId,
        immediately: bool,
    ) -> BillingResult<()> {
        let sub = self.store.get_subscription(sub_id).await?;

        let cancel_at =
            if immediately { OffsetDateTime::now_utc() } else { sub.current_period_end };
        self.store.cancel_subscription(sub_id, cancel_at).await?;

        let _ = self.store.invalidate(&sub.tenant_id, &sub.app_id).await;

        self.plugins.emit_subscription_canceled(&sub);
        Ok(())
    }

    // Usage metering

    /// Records a usage event without blocking.
    ///
    /// The event is queued on the in-memory buffer and flushed in batches
    /// by the background worker. A full buffer returns
    /// [`BillingError::BufferFull`]: back off and retry.
    pub async fn meter(&self, ctx: &Context, feature_key: &str, quantity: i64) -> BillingResult<()> {
        self.meter_with_key(ctx, feature_key, quantity, "").await
    }

    /// Like [`Tally::meter`], stamping an idempotency key so retried
    /// submissions of the same event count once.
    pub async fn meter_with_key(
        &self,
        ctx: &Context,
        feature_key: &str,
        quantity: i64,
        idempotency_key: &str,
    ) -> BillingResult<()> {
        let Some((tenant_id, app_id)) = ctx.tenancy() else {
            return Err(BillingError::InvalidInput("missing tenant or app context".into()));
        };
        if feature_key.is_empty() {
            return Err(BillingError::InvalidInput("missing feature key".into()));
        }

        let event = UsageEvent {
            id: Id::new(Prefix::UsageEvent),
            tenant_id: tenant_id.to_string(),
            app_id: app_id.to_string(),
            feature_key: feature_key.to_string(),
            quantity,
            timestamp: OffsetDateTime::now_utc(),
            idempotency_key: idempotency_key.to_string(),
            metadata: Default::default(),
        };

        match self.worker_tx.try_send(WorkerMessage::Event(event)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(BillingError::BufferFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BillingError::StoreNotReady),
        }
    }

    /// Forces the worker to persist everything buffered right now and
    /// waits for that flush to finish.
    pub async fn flush_meter(&self) -> BillingResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.worker_tx
            .try_send(WorkerMessage::Flush(ack_tx))
            .map_err(|_| BillingError::StoreNotReady)?;
        ack_rx.await.map_err(|_| BillingError::StoreNotReady)
    }

    /// Raw usage events for the context tenant, newest filters applied.
    pub async fn query_usage(
        &self,
        ctx: &Context,
        opts: UsageQueryOpts,
    ) -> BillingResult<Vec<UsageEvent>> {
        let Some((tenant_id, app_id)) = ctx.tenancy() else {
            return Err(BillingError::InvalidInput("missing tenant or app context".into()));
        };
        self.store.query_usage(tenant_id, app_id, opts).await
    }

    /// Deletes usage events older than `before` (the only permitted
    /// deletion of usage data). Returns how many were removed.
    pub async fn purge_usage(
        &self,
        _ctx: &Context,
        before: OffsetDateTime,
    ) -> BillingResult<i64> {
        self.store.purge_usage(before).await
    }

    // Entitlements

    /// Decides whether the context tenant may consume `feature_key` now.
    ///
    /// Missing tenancy, a missing subscription, plan, or feature all come
    /// back as `allowed = false` decisions rather than errors, so callers
    /// treat authorization uniformly; only store failures are errors.
    pub async fn entitled(&self, ctx: &Context, feature_key: &str) -> BillingResult<Decision> {
        let Some((tenant_id, app_id)) = ctx.tenancy() else {
            return Ok(Decision::deny(feature_key, "missing tenant or app context"));
        };

        if let Ok(cached) = self.store.get_cached(tenant_id, app_id, feature_key).await {
            return Ok(cached);
        }

        // Negative resolution outcomes are not cached: a subscription or
        // plan created a moment later must take effect immediately.
        let sub = match self.store.get_active_subscription(tenant_id, app_id).await {
            Ok(sub) => sub,
            Err(BillingError::NoActiveSubscription) => {
                return Ok(Decision::deny(feature_key, "no active subscription"));
            }
            Err(e) => return Err(e),
        };

        let plan = match self.store.get_plan(sub.plan_id).await {
            Ok(plan) => plan,
            Err(BillingError::PlanNotFound) => {
                return Ok(Decision::deny(feature_key, "plan not found"));
            }
            Err(e) => return Err(e),
        };

        let Some(feature) = plan.find_feature(feature_key) else {
            return Ok(Decision::deny(feature_key, "feature not in plan"));
        };

        if feature.feature_type == FeatureType::Boolean {
            let decision = Decision {
                allowed: feature.limit > 0,
                feature: feature_key.to_string(),
                used: 0,
                limit: feature.limit,
                remaining: 0,
                soft_limit: false,
                reason: String::new(),
            };
            self.cache_decision(tenant_id, app_id, feature_key, &decision).await;
            return Ok(decision);
        }

        let used = self.store.aggregate(tenant_id, app_id, feature_key, feature.period).await?;

        let mut decision = Decision {
            allowed: false,
            feature: feature_key.to_string(),
            used,
            limit: feature.limit,
            remaining: (feature.limit - used).max(0),
            soft_limit: feature.soft_limit,
            reason: String::new(),
        };

        if feature.limit == -1 {
            decision.allowed = true;
            decision.remaining = -1;
        } else if used < feature.limit {
            decision.allowed = true;
        } else if feature.soft_limit {
            decision.allowed = true;
            decision.reason = "over soft limit".to_string();
            self.plugins.emit_soft_limit_reached(QuotaBreach {
                tenant_id: tenant_id.to_string(),
                feature_key: feature_key.to_string(),
                used,
                limit: feature.limit,
            });
        } else {
            decision.reason = "quota exceeded".to_string();
            self.plugins.emit_quota_exceeded(QuotaBreach {
                tenant_id: tenant_id.to_string(),
                feature_key: feature_key.to_string(),
                used,
                limit: feature.limit,
            });
        }

        self.cache_decision(tenant_id, app_id, feature_key, &decision).await;
        self.plugins.emit_entitlement_checked(&decision);
        Ok(decision)
    }

    /// The remaining quota for a feature (`-1` when unlimited).
    pub async fn remaining(&self, ctx: &Context, feature_key: &str) -> BillingResult<i64> {
        Ok(self.entitled(ctx, feature_key).await?.remaining)
    }

    async fn cache_decision(
        &self,
        tenant_id: &str,
        app_id: &str,
        feature_key: &str,
        decision: &Decision,
    ) {
        if let Err(e) = self
            .store
            .set_cached(tenant_id, app_id, feature_key, decision, self.config.entitlement_cache_ttl)
            .await
        {
            debug!(error = %e, feature = feature_key, "entitlement cache set failed");
        }
    }

    // Invoicing

    /// Builds and persists a draft invoice for the subscription's current
    /// period: the base fee when the plan prices one, plus a zero-amount
    /// overage line per metered feature over its limit (overage pricing
    /// is delegated to pricing-strategy plugins).
    pub async fn generate_invoice(
        &self,
        _ctx: &Context,
        sub_id: SubscriptionId,
    ) -> BillingResult<Invoice> {
        let sub = self.store.get_subscription(sub_id).await?;
        let plan = self.store.get_plan(sub.plan_id).await?;

        let now = OffsetDateTime::now_utc();
        let mut invoice = Invoice {
            id: Id::new(Prefix::Invoice),
            tenant_id: sub.tenant_id.clone(),
            subscription_id: sub.id,
            app_id: sub.app_id.clone(),
            status: InvoiceStatus::Draft,
            currency: plan.currency.clone(),
            subtotal: Money::zero(&plan.currency),
            tax_amount: Money::zero(&plan.currency),
            discount_amount: Money::zero(&plan.currency),
            total: Money::zero(&plan.currency),
            line_items: Vec::new(),
            period_start: sub.current_period_start,
            period_end: sub.current_period_end,
            due_date: None,
            paid_at: None,
            voided_at: None,
            void_reason: String::new(),
            payment_ref: String::new(),
            provider_id: String::new(),
            metadata: Default::default(),
            created_at: now,
            updated_at: now,
        };

        if let Some(pricing) = &plan.pricing {
            if pricing.base_amount.is_positive() {
                invoice.line_items.push(LineItem {
                    id: Id::new(Prefix::LineItem),
                    invoice_id: invoice.id,
                    feature_key: String::new(),
                    description: "Base subscription fee".to_string(),
                    quantity: 1,
                    unit_amount: pricing.base_amount.clone(),
                    amount: pricing.base_amount.clone(),
                    item_type: LineItemType::Base,
                    metadata: Default::default(),
                });
                invoice.subtotal = invoice.subtotal.add(&pricing.base_amount);
            }
        }

        for feature in &plan.features {
            if feature.feature_type != FeatureType::Metered {
                continue;
            }
            let used = self
                .store
                .aggregate(&sub.tenant_id, &sub.app_id, &feature.key, feature.period)
                .await?;
            if used > feature.limit && feature.limit > 0 {
                invoice.line_items.push(LineItem {
                    id: Id::new(Prefix::LineItem),
                    invoice_id: invoice.id,
                    feature_key: feature.key.clone(),
                    description: format!("{} overage", feature.name),
                    quantity: used - feature.limit,
                    unit_amount: Money::zero(&plan.currency),
                    amount: Money::zero(&plan.currency),
                    item_type: LineItemType::Overage,
                    metadata: Default::default(),
                });
            }
        }

        invoice.recompute_total();

        self.store.create_invoice(&invoice).await?;
        self.plugins.emit_invoice_generated(&invoice);
        Ok(invoice)
    }

    pub async fn get_invoice(&self, _ctx: &Context, invoice_id: InvoiceId) -> BillingResult<Invoice> {
        self.store.get_invoice(invoice_id).await
    }

    pub async fn list_invoices(
        &self,
        _ctx: &Context,
        tenant_id: &str,
        app_id: &str,
        opts: InvoiceListOpts,
    ) -> BillingResult<Vec<Invoice>> {
        self.store.list_invoices(tenant_id, app_id, opts).await
    }

    /// Moves a draft invoice to pending and stamps its due date.
    pub async fn finalize_invoice(
        &self,
        _ctx: &Context,
        invoice_id: InvoiceId,
    ) -> BillingResult<Invoice> {
        let mut invoice = self.store.get_invoice(invoice_id).await?;
        if invoice.status != InvoiceStatus::Draft {
            return Err(BillingError::InvoiceFinalized);
        }

        let now = OffsetDateTime::now_utc();
        invoice.status = InvoiceStatus::Pending;
        invoice.due_date = Some(now + Duration::from_secs(30 * 24 * 60 * 60));
        invoice.updated_at = now;
        self.store.update_invoice(&invoice).await?;

        self.plugins.emit_invoice_finalized(&invoice);
        Ok(invoice)
    }

    /// Records payment of an invoice. The store rejects paying a voided
    /// or already-paid invoice.
    pub async fn pay_invoice(
        &self,
        _ctx: &Context,
        invoice_id: InvoiceId,
        payment_ref: &str,
    ) -> BillingResult<Invoice> {
        self.store.mark_invoice_paid(invoice_id, OffsetDateTime::now_utc(), payment_ref).await?;
        let invoice = self.store.get_invoice(invoice_id).await?;
        self.plugins.emit_invoice_paid(&invoice);
        Ok(invoice)
    }

    /// Voids an invoice. The store rejects voiding a paid invoice.
    pub async fn void_invoice(
        &self,
        _ctx: &Context,
        invoice_id: InvoiceId,
        reason: &str,
    ) -> BillingResult<Invoice> {
        self.store.mark_invoice_voided(invoice_id, reason).await?;
        let invoice = self.store.get_invoice(invoice_id).await?;
        self.plugins.emit_invoice_voided(&invoice, reason);
        Ok(invoice)
    }

    // Coupons

    pub async fn create_coupon(&self, _ctx: &Context, mut coupon: Coupon) -> BillingResult<Coupon> {
        if coupon.code.is_empty() || coupon.app_id.is_empty() {
            return Err(BillingError::InvalidInput("coupon requires code and app_id".into()));
        }
        if coupon.coupon_type == crate::coupon::CouponType::Percentage
            && !(0..=100).contains(&coupon.percentage)
        {
            return Err(BillingError::InvalidInput("percentage must be 0..=100".into()));
        }

        if coupon.id.is_nil() {
            coupon.id = Id::new(Prefix::Coupon);
        }
        let now = OffsetDateTime::now_utc();
        coupon.created_at = now;
        coupon.updated_at = now;

        self.store.create_coupon(&coupon).await?;
        Ok(coupon)
    }

    pub async fn get_coupon(
        &self,
        _ctx: &Context,
        code: &str,
        app_id: &str,
    ) -> BillingResult<Coupon> {
        self.store.get_coupon(code, app_id).await
    }

    /// Redeems a coupon: checks its validity window and redemption
    /// budget, lets registered coupon validators veto, then burns one
    /// redemption.
    pub async fn redeem_coupon(&self, ctx: &Context, code: &str, app_id: &str) -> BillingResult<Coupon> {
        let mut coupon = self.store.get_coupon(code, app_id).await?;
        let now = OffsetDateTime::now_utc();
        coupon.validate(now)?;

        let sub = match ctx.tenancy() {
            Some((tenant_id, app_id)) => {
                self.store.get_active_subscription(tenant_id, app_id).await.ok()
            }
            None => None,
        };
        for plugin in self.plugins.coupon_validators() {
            if let Some(validator) = plugin.as_coupon_validator() {
                validator.validate_coupon(&coupon, sub.as_ref()).await?;
            }
        }

        coupon.times_redeemed += 1;
        coupon.updated_at = now;
        self.store.update_coupon(&coupon).await?;
        Ok(coupon)
    }
}

/// The single background task draining the meter channel.
struct MeterWorker {
    store: Arc<dyn Store>,
    plugins: Arc<PluginRegistry>,
    batch_size: usize,
    flush_interval: Duration,
    shutdown: CancellationToken,
}

impl MeterWorker {
    async fn run(self, mut rx: mpsc::Receiver<WorkerMessage>) {
        let mut batch: Vec<UsageEvent> = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; swallow it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let acks = self.drain(&mut rx, &mut batch);
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                    for ack in acks {
                        let _ = ack.send(());
                    }
                    return;
                }

                message = rx.recv() => match message {
                    Some(WorkerMessage::Event(event)) => {
                        batch.push(event);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    Some(WorkerMessage::Flush(ack)) => {
                        let mut acks = self.drain(&mut rx, &mut batch);
                        acks.push(ack);
                        if !batch.is_empty() {
                            self.flush(&mut batch).await;
                        }
                        for ack in acks {
                            let _ = ack.send(());
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            self.flush(&mut batch).await;
                        }
                        return;
                    }
                },

                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }
    }

    /// Pulls everything already queued into the batch without waiting.
    /// Flush requests found along the way are acknowledged by the caller
    /// once the batch has actually been persisted.
    fn drain(
        &self,
        rx: &mut mpsc::Receiver<WorkerMessage>,
        batch: &mut Vec<UsageEvent>,
    ) -> Vec<oneshot::Sender<()>> {
        let mut acks = Vec::new();
        while let Ok(message) = rx.try_recv() {
            match message {
                WorkerMessage::Event(event) => batch.push(event),
                WorkerMessage::Flush(ack) => acks.push(ack),
            }
        }
        acks
    }

    /// One store call per batch. A failed flush is logged and the batch
    /// dropped: under a sustained store outage the pipeline sheds usage
    /// instead of blocking the hot path.
    async fn flush(&self, batch: &mut Vec<UsageEvent>) {
        let started = Instant::now();

        match self.store.ingest_batch(batch).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                self.plugins.emit_usage_flushed(batch.len(), elapsed);
                debug!(
                    batch_size = batch.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "flushed meter batch"
                );
            }
            Err(e) => {
                error!(error = %e, batch_size = batch.len(), "failed to flush meter batch");
            }
        }

        batch.clear();
    }
}

/// Calendar-month addition with end-of-month clamping.
fn one_month_later(t: OffsetDateTime) -> OffsetDateTime {
    let date = t.date();
    let (year, month) = match date.month() {
        time::Month::December => (date.year() + 1, time::Month::January),
        m => (date.year(), m.next()),
    };
    let day = date.day().min(time::util::days_in_year_month(year, month));
    let next = time::Date::from_calendar_date(year, month, day).expect("clamped day exists");
    t.replace_date(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn one_month_later_clamps_to_month_end() {
        assert_eq!(
            one_month_later(datetime!(2025-01-31 12:00:00 UTC)),
            datetime!(2025-02-28 12:00:00 UTC)
        );
        assert_eq!(
            one_month_later(datetime!(2025-12-05 00:00:00 UTC)),
            datetime!(2026-01-05 00:00:00 UTC)
        );
    }
}

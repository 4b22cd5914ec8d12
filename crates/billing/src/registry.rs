//! Plugin registry and event dispatch.
//!
//! The registry keeps, per event kind, the cached list of plugins that
//! declared that capability, so emission never scans non-subscribers.
//! Each emission detaches one task per subscriber: the handler runs under
//! the dispatch timeout, and a timeout, an error, or a panic is logged
//! against the plugin name and never reaches the operation that emitted
//! the event. Registration order is invocation order.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use tally_shared::PlanId;

use crate::entitlement::Decision;
use crate::error::{BillingError, BillingResult};
use crate::invoice::Invoice;
use crate::meter::UsageEvent;
use crate::plan::Plan;
use crate::plugin::{EventKind, Plugin, QuotaBreach};
use crate::subscription::Subscription;

/// Wall-clock budget for a single plugin handler call.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

type HandlerFuture = Pin<Box<dyn Future<Output = BillingResult<()>> + Send>>;

#[derive(Default)]
struct Inner {
    plugins: Vec<Arc<dyn Plugin>>,
    by_event: HashMap<EventKind, Vec<Arc<dyn Plugin>>>,

    // Resolved roles, discovered at registration via the as_* accessors.
    payment_providers: Vec<Arc<dyn Plugin>>,
    pricing_strategies: HashMap<String, Arc<dyn Plugin>>,
    usage_aggregators: HashMap<String, Arc<dyn Plugin>>,
    tax_calculators: Vec<Arc<dyn Plugin>>,
    invoice_formatters: HashMap<String, Arc<dyn Plugin>>,
    coupon_validators: Vec<Arc<dyn Plugin>>,
}

/// Thread-safe plugin registry. Registration takes the write lock;
/// dispatch snapshots subscriber lists under the read lock.
pub struct PluginRegistry {
    inner: RwLock<Inner>,
    dispatch_timeout: Duration,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        PluginRegistry::new()
    }
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry { inner: RwLock::new(Inner::default()), dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT }
    }

    /// Overrides the per-handler wall-clock budget.
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> PluginRegistry {
        self.dispatch_timeout = timeout;
        self
    }

    /// Adds a plugin, caching its declared capabilities and roles.
    /// A second plugin with the same name is rejected.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> BillingResult<()> {
        let mut inner = self.inner.write();

        if inner.plugins.iter().any(|p| p.name() == plugin.name()) {
            return Err(BillingError::AlreadyExists(format!("plugin {}", plugin.name())));
        }

        for kind in plugin.capabilities() {
            inner.by_event.entry(*kind).or_default().push(plugin.clone());
        }

        if plugin.as_payment_provider().is_some() {
            inner.payment_providers.push(plugin.clone());
        }
        if let Some(strategy) = plugin.as_pricing_strategy() {
            inner.pricing_strategies.insert(strategy.strategy_name().to_string(), plugin.clone());
        }
        if let Some(aggregator) = plugin.as_usage_aggregator() {
            inner.usage_aggregators.insert(aggregator.aggregator_name().to_string(), plugin.clone());
        }
        if plugin.as_tax_calculator().is_some() {
            inner.tax_calculators.push(plugin.clone());
        }
        if let Some(formatter) = plugin.as_invoice_formatter() {
            inner.invoice_formatters.insert(formatter.format().to_string(), plugin.clone());
        }
        if plugin.as_coupon_validator().is_some() {
            inner.coupon_validators.push(plugin.clone());
        }

        info!(plugin = plugin.name(), capabilities = plugin.capabilities().len(), "plugin registered");
        inner.plugins.push(plugin);
        Ok(())
    }

    /// Looks up a plugin by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.inner.read().plugins.iter().find(|p| p.name() == name).cloned()
    }

    /// All registered plugins, in registration order.
    pub fn list(&self) -> Vec<Arc<dyn Plugin>> {
        self.inner.read().plugins.clone()
    }

    pub fn count(&self) -> usize {
        self.inner.read().plugins.len()
    }

    // Role resolution. Callers reach the role trait through the plugin's
    // own as_* accessor.

    pub fn payment_providers(&self) -> Vec<Arc<dyn Plugin>> {
        self.inner.read().payment_providers.clone()
    }

    pub fn pricing_strategy(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.inner.read().pricing_strategies.get(name).cloned()
    }

    pub fn usage_aggregator(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.inner.read().usage_aggregators.get(name).cloned()
    }

    pub fn tax_calculators(&self) -> Vec<Arc<dyn Plugin>> {
        self.inner.read().tax_calculators.clone()
    }

    pub fn invoice_formatter(&self, format: &str) -> Option<Arc<dyn Plugin>> {
        self.inner.read().invoice_formatters.get(format).cloned()
    }

    pub fn coupon_validators(&self) -> Vec<Arc<dyn Plugin>> {
        self.inner.read().coupon_validators.clone()
    }

    /// Fans an event out to its subscribers, one detached task each.
    ///
    /// The handler itself runs on an inner task so a timeout can abort it
    /// and a panic can be observed and logged without poisoning anything.
    fn fan_out<F>(&self, kind: EventKind, call: F)
    where
        F: Fn(Arc<dyn Plugin>) -> HandlerFuture,
    {
        let subscribers = match self.inner.read().by_event.get(&kind) {
            Some(list) => list.clone(),
            None => return,
        };
        let budget = self.dispatch_timeout;

        for plugin in subscribers {
            let name = plugin.name().to_string();
            let handler = call(plugin);
            tokio::spawn(async move {
                let mut task = tokio::spawn(handler);
                match tokio::time::timeout(budget, &mut task).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(e))) => {
                        warn!(plugin = %name, event = ?kind, error = %e, "plugin handler failed");
                    }
                    Ok(Err(join)) if join.is_panic() => {
                        warn!(plugin = %name, event = ?kind, "plugin handler panicked");
                    }
                    Ok(Err(_)) => {}
                    Err(_) => {
                        task.abort();
                        warn!(
                            plugin = %name,
                            event = ?kind,
                            timeout_ms = budget.as_millis() as u64,
                            "plugin handler timed out"
                        );
                    }
                }
            });
        }
    }

    // Emission entry points, one per event kind.

    pub fn emit_init(&self) {
        self.fan_out(EventKind::Init, |p| Box::pin(async move { p.on_init().await }));
    }

    pub fn emit_shutdown(&self) {
        self.fan_out(EventKind::Shutdown, |p| Box::pin(async move { p.on_shutdown().await }));
    }

    pub fn emit_plan_created(&self, plan: &Plan) {
        let plan = Arc::new(plan.clone());
        self.fan_out(EventKind::PlanCreated, move |p| {
            let plan = plan.clone();
            Box::pin(async move { p.on_plan_created(plan).await })
        });
    }

    pub fn emit_plan_updated(&self, old: &Plan, new: &Plan) {
        let old = Arc::new(old.clone());
        let new = Arc::new(new.clone());
        self.fan_out(EventKind::PlanUpdated, move |p| {
            let old = old.clone();
            let new = new.clone();
            Box::pin(async move { p.on_plan_updated(old, new).await })
        });
    }

    pub fn emit_plan_archived(&self, plan_id: PlanId) {
        self.fan_out(EventKind::PlanArchived, move |p| {
            Box::pin(async move { p.on_plan_archived(plan_id).await })
        });
    }

    pub fn emit_subscription_created(&self, sub: &Subscription) {
        let sub = Arc::new(sub.clone());
        self.fan_out(EventKind::SubscriptionCreated, move |p| {
            let sub = sub.clone();
            Box::pin(async move { p.on_subscription_created(sub).await })
        });
    }

    pub fn emit_subscription_changed(&self, sub: &Subscription, old_plan: &Plan, new_plan: &Plan) {
        let sub = Arc::new(sub.clone());
        let old_plan = Arc::new(old_plan.clone());
        let new_plan = Arc::new(new_plan.clone());
        self.fan_out(EventKind::SubscriptionChanged, move |p| {
            let sub = sub.clone();
            let old_plan = old_plan.clone();
            let new_plan = new_plan.clone();
            Box::pin(async move { p.on_subscription_changed(sub, old_plan, new_plan).await })
        });
    }

    pub fn emit_subscription_canceled(&self, sub: &Subscription) {
        let sub = Arc::new(sub.clone());
        self.fan_out(EventKind::SubscriptionCanceled, move |p| {
            let sub = sub.clone();
            Box::pin(async move { p.on_subscription_canceled(sub).await })
        });
    }

    pub fn emit_subscription_expired(&self, sub: &Subscription) {
        let sub = Arc::new(sub.clone());
        self.fan_out(EventKind::SubscriptionExpired, move |p| {
            let sub = sub.clone();
            Box::pin(async move { p.on_subscription_expired(sub).await })
        });
    }

    pub fn emit_usage_ingested(&self, events: &[UsageEvent]) {
        let events = Arc::new(events.to_vec());
        self.fan_out(EventKind::UsageIngested, move |p| {
            let events = events.clone();
            Box::pin(async move { p.on_usage_ingested(events).await })
        });
    }

    pub fn emit_usage_flushed(&self, count: usize, elapsed: Duration) {
        self.fan_out(EventKind::UsageFlushed, move |p| {
            Box::pin(async move { p.on_usage_flushed(count, elapsed).await })
        });
    }

    pub fn emit_entitlement_checked(&self, decision: &Decision) {
        let decision = Arc::new(decision.clone());
        self.fan_out(EventKind::EntitlementChecked, move |p| {
            let decision = decision.clone();
            Box::pin(async move { p.on_entitlement_checked(decision).await })
        });
    }

    pub fn emit_quota_exceeded(&self, breach: QuotaBreach) {
        self.fan_out(EventKind::QuotaExceeded, move |p| {
            let breach = breach.clone();
            Box::pin(async move { p.on_quota_exceeded(breach).await })
        });
    }

    pub fn emit_soft_limit_reached(&self, breach: QuotaBreach) {
        self.fan_out(EventKind::SoftLimitReached, move |p| {
            let breach = breach.clone();
            Box::pin(async move { p.on_soft_limit_reached(breach).await })
        });
    }

    pub fn emit_invoice_generated(&self, invoice: &Invoice) {
        let invoice = Arc::new(invoice.clone());
        self.fan_out(EventKind::InvoiceGenerated, move |p| {
            let invoice = invoice.clone();
            Box::pin(async move { p.on_invoice_generated(invoice).await })
        });
    }

    pub fn emit_invoice_finalized(&self, invoice: &Invoice) {
        let invoice = Arc::new(invoice.clone());
        self.fan_out(EventKind::InvoiceFinalized, move |p| {
            let invoice = invoice.clone();
            Box::pin(async move { p.on_invoice_finalized(invoice).await })
        });
    }

    pub fn emit_invoice_paid(&self, invoice: &Invoice) {
        let invoice = Arc::new(invoice.clone());
        self.fan_out(EventKind::InvoicePaid, move |p| {
            let invoice = invoice.clone();
            Box::pin(async move { p.on_invoice_paid(invoice).await })
        });
    }

    pub fn emit_invoice_failed(&self, invoice: &Invoice, error: &str) {
        let invoice = Arc::new(invoice.clone());
        let error = error.to_string();
        self.fan_out(EventKind::InvoiceFailed, move |p| {
            let invoice = invoice.clone();
            let error = error.clone();
            Box::pin(async move { p.on_invoice_failed(invoice, error).await })
        });
    }

    pub fn emit_invoice_voided(&self, invoice: &Invoice, reason: &str) {
        let invoice = Arc::new(invoice.clone());
        let reason = reason.to_string();
        self.fan_out(EventKind::InvoiceVoided, move |p| {
            let invoice = invoice.clone();
            let reason = reason.clone();
            Box::pin(async move { p.on_invoice_voided(invoice, reason).await })
        });
    }

    pub fn emit_provider_sync(&self, provider: &str, success: bool) {
        let provider = provider.to_string();
        self.fan_out(EventKind::ProviderSync, move |p| {
            let provider = provider.clone();
            Box::pin(async move { p.on_provider_sync(provider, success).await })
        });
    }

    pub fn emit_webhook_received(&self, provider: &str, payload: Vec<u8>) {
        let provider = provider.to_string();
        let payload = Arc::new(payload);
        self.fan_out(EventKind::WebhookReceived, move |p| {
            let provider = provider.clone();
            let payload = payload.clone();
            Box::pin(async move { p.on_webhook_received(provider, payload).await })
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::plan::PriceTier;
    use crate::plugin::PricingStrategy;
    use crate::testutil;
    use tally_shared::Money;

    struct Recorder {
        name: String,
        seen: Arc<AtomicUsize>,
        notify: Arc<Notify>,
    }

    fn recorder(name: &str) -> (Recorder, Arc<AtomicUsize>, Arc<Notify>) {
        let seen = Arc::new(AtomicUsize::new(0));
        let notify = Arc::new(Notify::new());
        let plugin = Recorder { name: name.to_string(), seen: seen.clone(), notify: notify.clone() };
        (plugin, seen, notify)
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> &[EventKind] {
            &[EventKind::PlanCreated]
        }

        async fn on_plan_created(&self, _plan: Arc<Plan>) -> BillingResult<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_one();
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Plugin for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn capabilities(&self) -> &[EventKind] {
            &[EventKind::PlanCreated]
        }

        async fn on_plan_created(&self, _plan: Arc<Plan>) -> BillingResult<()> {
            Err(BillingError::InvalidInput("boom".into()))
        }
    }

    struct Sleeper {
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Plugin for Sleeper {
        fn name(&self) -> &str {
            "sleeper"
        }

        fn capabilities(&self) -> &[EventKind] {
            &[EventKind::PlanCreated]
        }

        async fn on_plan_created(&self, _plan: Arc<Plan>) -> BillingResult<()> {
            tokio::time::sleep(Duration::from_secs(6)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = PluginRegistry::new();
        let (first, _, _) = recorder("audit");
        let (dup, _, _) = recorder("audit");
        registry.register(Arc::new(first)).expect("first registration");
        let err = registry.register(Arc::new(dup)).expect_err("duplicate must fail");
        assert!(matches!(err, BillingError::AlreadyExists(_)));
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn dispatch_reaches_every_subscriber() {
        let registry = PluginRegistry::new();
        let (first, first_seen, first_notify) = recorder("first");
        let (second, second_seen, second_notify) = recorder("second");
        registry.register(Arc::new(first)).expect("register");
        registry.register(Arc::new(second)).expect("register");

        registry.emit_plan_created(&testutil::plan_with_feature(
            "api_calls",
            crate::plan::FeatureType::Metered,
            100,
        ));

        first_notify.notified().await;
        second_notify.notified().await;
        assert_eq!(first_seen.load(Ordering::SeqCst), 1);
        assert_eq!(second_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_failing_plugin_does_not_block_the_next() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(Failing)).expect("register");
        let (observer, seen, notify) = recorder("observer");
        registry.register(Arc::new(observer)).expect("register");

        registry.emit_plan_created(&testutil::plan_with_feature(
            "api_calls",
            crate::plan::FeatureType::Metered,
            100,
        ));

        notify.notified().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_slow_plugin_is_cut_off_at_the_timeout() {
        let finished = Arc::new(AtomicUsize::new(0));
        let registry = PluginRegistry::new();
        registry.register(Arc::new(Sleeper { finished: finished.clone() })).expect("register");
        let (observer, _, notify) = recorder("observer");
        registry.register(Arc::new(observer)).expect("register");

        registry.emit_plan_created(&testutil::plan_with_feature(
            "api_calls",
            crate::plan::FeatureType::Metered,
            100,
        ));

        // The fast observer completes while the sleeper is still pending.
        notify.notified().await;

        // Past the 6 s sleep: the handler was aborted at 5 s and never
        // reached its completion marker.
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    struct Flat;

    impl PricingStrategy for Flat {
        fn strategy_name(&self) -> &str {
            "flat"
        }

        fn compute(&self, _tiers: &[PriceTier], usage: i64, included: i64, currency: &str) -> Money {
            Money::new((usage - included).max(0), currency)
        }
    }

    #[async_trait]
    impl Plugin for Flat {
        fn name(&self) -> &str {
            "flat-pricing"
        }

        fn as_pricing_strategy(&self) -> Option<&dyn PricingStrategy> {
            Some(self)
        }
    }

    #[test]
    fn roles_resolve_by_name() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(Flat)).expect("register");

        let plugin = registry.pricing_strategy("flat").expect("resolved");
        let strategy = plugin.as_pricing_strategy().expect("role");
        assert_eq!(strategy.compute(&[], 150, 100, "usd"), Money::new(50, "usd"));
        assert!(registry.pricing_strategy("graduated").is_none());
    }
}

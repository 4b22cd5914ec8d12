//! Plugin hook contracts.
//!
//! Plugins observe billing lifecycle events and never sit on the billing
//! path: every handler runs on its own task under the registry's dispatch
//! timeout, and failures are logged, not propagated.
//!
//! A plugin declares the events it wants via [`Plugin::capabilities`];
//! the registry caches subscriber lists per [`EventKind`] at registration
//! time. Payloads arrive as `Arc`-shared domain values so detached
//! dispatch never copies an invoice per observer.
//!
//! Beyond observation, a plugin can take on resolved roles (payment
//! provider, pricing strategy, usage aggregator, tax calculator, invoice
//! formatter, coupon validator) by answering the matching `as_*`
//! accessor. Roles are looked up by the engine when needed, never
//! broadcast.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tally_shared::{Money, PlanId};

use crate::coupon::Coupon;
use crate::entitlement::Decision;
use crate::error::BillingResult;
use crate::invoice::Invoice;
use crate::meter::UsageEvent;
use crate::plan::{Plan, PriceTier};
use crate::subscription::Subscription;

/// Every event kind the registry can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Init,
    Shutdown,
    PlanCreated,
    PlanUpdated,
    PlanArchived,
    SubscriptionCreated,
    SubscriptionChanged,
    SubscriptionCanceled,
    SubscriptionExpired,
    UsageIngested,
    UsageFlushed,
    EntitlementChecked,
    QuotaExceeded,
    SoftLimitReached,
    InvoiceGenerated,
    InvoiceFinalized,
    InvoicePaid,
    InvoiceFailed,
    InvoiceVoided,
    ProviderSync,
    WebhookReceived,
}

/// Payload for quota and soft-limit breach events.
#[derive(Debug, Clone)]
pub struct QuotaBreach {
    pub tenant_id: String,
    pub feature_key: String,
    pub used: i64,
    pub limit: i64,
}

/// An observer of billing lifecycle events.
///
/// Implement `name` and `capabilities`, then override the handlers for
/// the declared kinds; everything else defaults to a no-op. A handler
/// that is not declared in `capabilities` is never invoked.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Unique name; duplicate registrations are rejected.
    fn name(&self) -> &str;

    /// The event kinds this plugin wants dispatched to it.
    fn capabilities(&self) -> &[EventKind] {
        &[]
    }

    async fn on_init(&self) -> BillingResult<()> {
        Ok(())
    }

    async fn on_shutdown(&self) -> BillingResult<()> {
        Ok(())
    }

    async fn on_plan_created(&self, _plan: Arc<Plan>) -> BillingResult<()> {
        Ok(())
    }

    async fn on_plan_updated(&self, _old: Arc<Plan>, _new: Arc<Plan>) -> BillingResult<()> {
        Ok(())
    }

    async fn on_plan_archived(&self, _plan_id: PlanId) -> BillingResult<()> {
        Ok(())
    }

    async fn on_subscription_created(&self, _sub: Arc<Subscription>) -> BillingResult<()> {
        Ok(())
    }

    async fn on_subscription_changed(
        &self,
        _sub: Arc<Subscription>,
        _old_plan: Arc<Plan>,
        _new_plan: Arc<Plan>,
    ) -> BillingResult<()> {
        Ok(())
    }

    async fn on_subscription_canceled(&self, _sub: Arc<Subscription>) -> BillingResult<()> {
        Ok(())
    }

    async fn on_subscription_expired(&self, _sub: Arc<Subscription>) -> BillingResult<()> {
        Ok(())
    }

    async fn on_usage_ingested(&self, _events: Arc<Vec<UsageEvent>>) -> BillingResult<()> {
        Ok(())
    }

    async fn on_usage_flushed(&self, _count: usize, _elapsed: Duration) -> BillingResult<()> {
        Ok(())
    }

    async fn on_entitlement_checked(&self, _decision: Arc<Decision>) -> BillingResult<()> {
        Ok(())
    }

    async fn on_quota_exceeded(&self, _breach: QuotaBreach) -> BillingResult<()> {
        Ok(())
    }

    async fn on_soft_limit_reached(&self, _breach: QuotaBreach) -> BillingResult<()> {
        Ok(())
    }

    async fn on_invoice_generated(&self, _invoice: Arc<Invoice>) -> BillingResult<()> {
        Ok(())
    }

    async fn on_invoice_finalized(&self, _invoice: Arc<Invoice>) -> BillingResult<()> {
        Ok(())
    }

    async fn on_invoice_paid(&self, _invoice: Arc<Invoice>) -> BillingResult<()> {
        Ok(())
    }

    async fn on_invoice_failed(&self, _invoice: Arc<Invoice>, _error: String) -> BillingResult<()> {
        Ok(())
    }

    async fn on_invoice_voided(&self, _invoice: Arc<Invoice>, _reason: String) -> BillingResult<()> {
        Ok(())
    }

    async fn on_provider_sync(&self, _provider: String, _success: bool) -> BillingResult<()> {
        Ok(())
    }

    async fn on_webhook_received(&self, _provider: String, _payload: Arc<Vec<u8>>) -> BillingResult<()> {
        Ok(())
    }

    // Resolved roles. A plugin exposes a role by returning `Some(self)`.

    fn as_payment_provider(&self) -> Option<&dyn PaymentProvider> {
        None
    }

    fn as_pricing_strategy(&self) -> Option<&dyn PricingStrategy> {
        None
    }

    fn as_usage_aggregator(&self) -> Option<&dyn UsageAggregator> {
        None
    }

    fn as_tax_calculator(&self) -> Option<&dyn TaxCalculator> {
        None
    }

    fn as_invoice_formatter(&self) -> Option<&dyn InvoiceFormatter> {
        None
    }

    fn as_coupon_validator(&self) -> Option<&dyn CouponValidator> {
        None
    }
}

/// Moves money for invoices. The core never calls this synchronously; it
/// records paid/voided state and leaves capture to integrations.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    /// Charges an invoice and returns an external payment reference.
    async fn charge(&self, invoice: &Invoice) -> BillingResult<String>;
}

/// Prices metered overage from tier bands. Resolved by name.
pub trait PricingStrategy: Send + Sync {
    fn strategy_name(&self) -> &str;

    /// Computes the charge for `usage` units given `included` free units.
    fn compute(&self, tiers: &[PriceTier], usage: i64, included: i64, currency: &str) -> Money;
}

/// Custom usage roll-up (for example max-concurrent instead of sum).
/// Resolved by name.
#[async_trait]
pub trait UsageAggregator: Send + Sync {
    fn aggregator_name(&self) -> &str;

    async fn aggregate(&self, events: &[UsageEvent]) -> BillingResult<i64>;
}

/// Computes tax for an invoice subtotal.
#[async_trait]
pub trait TaxCalculator: Send + Sync {
    async fn calculate_tax(&self, subtotal: &Money, tenant_id: &str) -> BillingResult<Money>;
}

/// Renders invoices for export. Resolved by format tag ("pdf", "csv").
pub trait InvoiceFormatter: Send + Sync {
    fn format(&self) -> &str;

    fn render(&self, invoice: &Invoice) -> BillingResult<String>;
}

/// Veto point for coupon redemption.
#[async_trait]
pub trait CouponValidator: Send + Sync {
    async fn validate_coupon(
        &self,
        coupon: &Coupon,
        sub: Option<&Subscription>,
    ) -> BillingResult<()>;
}

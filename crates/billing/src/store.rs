//! The storage contract.
//!
//! One trait covers every persisted entity so an engine owns a single
//! `Arc<dyn Store>`. Implementations must be safe for concurrent callers
//! and atomic per call; the engine performs no cross-call transactions.
//!
//! Contract points the engine depends on:
//!
//! - `ingest_batch` deduplicates by non-empty idempotency key as an
//!   idempotent no-op (duplicates are skipped, never an error).
//! - `aggregate` sums quantities of events with
//!   `timestamp > period.start_of(now)`, strictly after: an event at
//!   the boundary instant counts toward the previous window.
//! - `get_active_subscription` returns the newest subscription whose
//!   status is active or trialing.
//! - `get_cached` never returns an expired entry.

use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use tally_shared::{CouponId, InvoiceId, PlanId, SubscriptionId};

use crate::coupon::{Coupon, CouponListOpts};
use crate::entitlement::Decision;
use crate::error::BillingResult;
use crate::invoice::{Invoice, InvoiceListOpts};
use crate::meter::{UsageEvent, UsageQueryOpts};
use crate::plan::{Period, Plan, PlanListOpts};
use crate::subscription::{Subscription, SubscriptionListOpts};

/// Uniform CRUD + aggregation surface over all billing entities.
#[async_trait]
pub trait Store: Send + Sync {
    // Plans

    async fn create_plan(&self, plan: &Plan) -> BillingResult<()>;
    async fn get_plan(&self, plan_id: PlanId) -> BillingResult<Plan>;
    async fn get_plan_by_slug(&self, slug: &str, app_id: &str) -> BillingResult<Plan>;
    async fn list_plans(&self, app_id: &str, opts: PlanListOpts) -> BillingResult<Vec<Plan>>;
    async fn update_plan(&self, plan: &Plan) -> BillingResult<()>;
    async fn delete_plan(&self, plan_id: PlanId) -> BillingResult<()>;
    async fn archive_plan(&self, plan_id: PlanId) -> BillingResult<()>;

    // Subscriptions

    async fn create_subscription(&self, sub: &Subscription) -> BillingResult<()>;
    async fn get_subscription(&self, sub_id: SubscriptionId) -> BillingResult<Subscription>;
    async fn get_active_subscription(
        &self,
        tenant_id: &str,
        app_id: &str,
    ) -> BillingResult<Subscription>;
    async fn list_subscriptions(
        &self,
        tenant_id: &str,
        app_id: &str,
        opts: SubscriptionListOpts,
    ) -> BillingResult<Vec<Subscription>>;
    async fn update_subscription(&self, sub: &Subscription) -> BillingResult<()>;
    async fn cancel_subscription(
        &self,
        sub_id: SubscriptionId,
        cancel_at: OffsetDateTime,
    ) -> BillingResult<()>;

    // Metering

    async fn ingest_batch(&self, events: &[UsageEvent]) -> BillingResult<()>;
    async fn aggregate(
        &self,
        tenant_id: &str,
        app_id: &str,
        feature_key: &str,
        period: Period,
    ) -> BillingResult<i64>;
    async fn aggregate_multi(
        &self,
        tenant_id: &str,
        app_id: &str,
        feature_keys: &[String],
        period: Period,
    ) -> BillingResult<std::collections::HashMap<String, i64>>;
    async fn query_usage(
        &self,
        tenant_id: &str,
        app_id: &str,
        opts: UsageQueryOpts,
    ) -> BillingResult<Vec<UsageEvent>>;
    /// Deletes events older than `before`; returns how many went away.
    async fn purge_usage(&self, before: OffsetDateTime) -> BillingResult<i64>;

    // Entitlement cache

    async fn get_cached(
        &self,
        tenant_id: &str,
        app_id: &str,
        feature_key: &str,
    ) -> BillingResult<Decision>;
    async fn set_cached(
        &self,
        tenant_id: &str,
        app_id: &str,
        feature_key: &str,
        decision: &Decision,
        ttl: Duration,
    ) -> BillingResult<()>;
    /// Drops every cached decision for the `(tenant, app)` pair.
    async fn invalidate(&self, tenant_id: &str, app_id: &str) -> BillingResult<()>;
    /// Drops one cached decision. Off the hot path; for callers that
    /// mutate plan features live.
    async fn invalidate_feature(
        &self,
        tenant_id: &str,
        app_id: &str,
        feature_key: &str,
    ) -> BillingResult<()>;

    // Invoices

    async fn create_invoice(&self, invoice: &Invoice) -> BillingResult<()>;
    async fn get_invoice(&self, invoice_id: InvoiceId) -> BillingResult<Invoice>;
    async fn list_invoices(
        &self,
        tenant_id: &str,
        app_id: &str,
        opts: InvoiceListOpts,
    ) -> BillingResult<Vec<Invoice>>;
    async fn update_invoice(&self, invoice: &Invoice) -> BillingResult<()>;
    async fn get_invoice_by_period(
        &self,
        tenant_id: &str,
        app_id: &str,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<Invoice>;
    async fn list_pending_invoices(&self, app_id: &str) -> BillingResult<Vec<Invoice>>;
    async fn mark_invoice_paid(
        &self,
        invoice_id: InvoiceId,
        paid_at: OffsetDateTime,
        payment_ref: &str,
    ) -> BillingResult<()>;
    async fn mark_invoice_voided(&self, invoice_id: InvoiceId, reason: &str) -> BillingResult<()>;

    // Coupons

    async fn create_coupon(&self, coupon: &Coupon) -> BillingResult<()>;
    async fn get_coupon(&self, code: &str, app_id: &str) -> BillingResult<Coupon>;
    async fn get_coupon_by_id(&self, coupon_id: CouponId) -> BillingResult<Coupon>;
    async fn list_coupons(&self, app_id: &str, opts: CouponListOpts) -> BillingResult<Vec<Coupon>>;
    async fn update_coupon(&self, coupon: &Coupon) -> BillingResult<()>;
    async fn delete_coupon(&self, coupon_id: CouponId) -> BillingResult<()>;

    // Lifecycle

    async fn migrate(&self) -> BillingResult<()>;
    async fn ping(&self) -> BillingResult<()>;
    async fn close(&self) -> BillingResult<()>;
}

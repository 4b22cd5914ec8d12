//! In-memory store backend.
//!
//! Backs tests and single-process embedding without a database. All state
//! sits behind one reader-writer lock; no method holds the lock across an
//! await point.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use time::OffsetDateTime;

use tally_shared::{CouponId, InvoiceId, PlanId, SubscriptionId};

use crate::coupon::{Coupon, CouponListOpts};
use crate::entitlement::Decision;
use crate::error::{BillingError, BillingResult};
use crate::invoice::{Invoice, InvoiceListOpts, InvoiceStatus};
use crate::meter::{UsageEvent, UsageQueryOpts};
use crate::plan::{Period, Plan, PlanListOpts, PlanStatus};
use crate::store::Store;
use crate::subscription::{Subscription, SubscriptionListOpts};

#[derive(Default)]
struct State {
    plans: HashMap<String, Plan>,
    subscriptions: HashMap<String, Subscription>,
    usage_events: Vec<UsageEvent>,
    seen_idempotency_keys: HashSet<String>,
    cache: HashMap<String, (Decision, OffsetDateTime)>,
    invoices: HashMap<String, Invoice>,
    coupons: HashMap<String, Coupon>,
}

/// A [`Store`] holding everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

fn cache_key(tenant_id: &str, app_id: &str, feature_key: &str) -> String {
    format!("{tenant_id}:{app_id}:{feature_key}")
}

fn page<T>(items: Vec<T>, limit: usize, offset: usize) -> Vec<T> {
    let iter = items.into_iter().skip(offset);
    if limit == 0 {
        iter.collect()
    } else {
        iter.take(limit).collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    // Plans

    async fn create_plan(&self, plan: &Plan) -> BillingResult<()> {
        let mut state = self.state.write();
        if state.plans.contains_key(&plan.id.to_string()) {
            return Err(BillingError::AlreadyExists(format!("plan {}", plan.id)));
        }
        if state.plans.values().any(|p| p.slug == plan.slug && p.app_id == plan.app_id) {
            return Err(BillingError::AlreadyExists(format!("plan slug {}", plan.slug)));
        }
        state.plans.insert(plan.id.to_string(), plan.clone());
        Ok(())
    }

    async fn get_plan(&self, plan_id: PlanId) -> BillingResult<Plan> {
        self.state
            .read()
            .plans
            .get(&plan_id.to_string())
            .cloned()
            .ok_or(BillingError::PlanNotFound)
    }

    async fn get_plan_by_slug(&self, slug: &str, app_id: &str) -> BillingResult<Plan> {
        self.state
            .read()
            .plans
            .values()
            .find(|p| p.slug == slug && p.app_id == app_id)
            .cloned()
            .ok_or(BillingError::PlanNotFound)
    }

    async fn list_plans(&self, app_id: &str, opts: PlanListOpts) -> BillingResult<Vec<Plan>> {
        let mut plans: Vec<Plan> = self
            .state
            .read()
            .plans
            .values()
            .filter(|p| p.app_id == app_id)
            .filter(|p| opts.status.is_none_or(|s| p.status == s))
            .cloned()
            .collect();
        plans.sort_by_key(|p| p.id);
        Ok(page(plans, opts.limit, opts.offset))
    }

    async fn update_plan(&self, plan: &Plan) -> BillingResult<()> {
        let mut state = self.state.write();
        if !state.plans.contains_key(&plan.id.to_string()) {
            return Err(BillingError::PlanNotFound);
        }
        state.plans.insert(plan.id.to_string(), plan.clone());
        Ok(())
    }

    async fn delete_plan(&self, plan_id: PlanId) -> BillingResult<()> {
        self.state.write().plans.remove(&plan_id.to_string());
        Ok(())
    }

    async fn archive_plan(&self, plan_id: PlanId) -> BillingResult<()> {
        let mut state = self.state.write();
        let plan = state
            .plans
            .get_mut(&plan_id.to_string())
            .ok_or(BillingError::PlanNotFound)?;
        plan.status = PlanStatus::Archived;
        plan.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    // Subscriptions

    async fn create_subscription(&self, sub: &Subscription) -> BillingResult<()> {
        let mut state = self.state.write();
        if state.subscriptions.contains_key(&sub.id.to_string()) {
            return Err(BillingError::AlreadyExists(format!("subscription {}", sub.id)));
        }
        state.subscriptions.insert(sub.id.to_string(), sub.clone());
        Ok(())
    }

    async fn get_subscription(&self, sub_id: SubscriptionId) -> BillingResult<Subscription> {
        self.state
            .read()
            .subscriptions
            .get(&sub_id.to_string())
            .cloned()
            .ok_or(BillingError::SubscriptionNotFound)
    }

    async fn get_active_subscription(
        &self,
        tenant_id: &str,
        app_id: &str,
    ) -> BillingResult<Subscription> {
        self.state
            .read()
            .subscriptions
            .values()
            .filter(|s| {
                s.tenant_id == tenant_id && s.app_id == app_id && s.status.is_entitling()
            })
            .max_by_key(|s| s.created_at)
            .cloned()
            .ok_or(BillingError::NoActiveSubscription)
    }

    async fn list_subscriptions(
        &self,
        tenant_id: &str,
        app_id: &str,
        opts: SubscriptionListOpts,
    ) -> BillingResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .state
            .read()
            .subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.app_id == app_id)
            .filter(|s| opts.status.is_none_or(|st| s.status == st))
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.id);
        Ok(page(subs, opts.limit, opts.offset))
    }

    async fn update_subscription(&self, sub: &Subscription) -> BillingResult<()> {
        self.state.write().subscriptions.insert(sub.id.to_string(), sub.clone());
        Ok(())
    }

    async fn cancel_subscription(
        &self,
        sub_id: SubscriptionId,
        cancel_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut state = self.state.write();
        let sub = state
            .subscriptions
            .get_mut(&sub_id.to_string())
            .ok_or(BillingError::SubscriptionNotFound)?;
        let now = OffsetDateTime::now_utc();
        sub.cancel_at = Some(cancel_at);
        if now >= cancel_at {
            sub.status = crate::subscription::SubscriptionStatus::Canceled;
            sub.canceled_at = Some(now);
        }
        sub.updated_at = now;
        Ok(())
    }

    // Metering

    async fn ingest_batch(&self, events: &[UsageEvent]) -> BillingResult<()> {
        let mut state = self.state.write();
        for event in events {
            if !event.idempotency_key.is_empty() {
                if state.seen_idempotency_keys.contains(&event.idempotency_key) {
                    continue;
                }
                state.seen_idempotency_keys.insert(event.idempotency_key.clone());
            }
            state.usage_events.push(event.clone());
        }
        Ok(())
    }

    async fn aggregate(
        &self,
        tenant_id: &str,
        app_id: &str,
        feature_key: &str,
        period: Period,
    ) -> BillingResult<i64> {
        let start = period.start_of(OffsetDateTime::now_utc());
        Ok(self
            .state
            .read()
            .usage_events
            .iter()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.app_id == app_id
                    && e.feature_key == feature_key
                    && e.timestamp > start
            })
            .map(|e| e.quantity)
            .sum())
    }

    async fn aggregate_multi(
        &self,
        tenant_id: &str,
        app_id: &str,
        feature_keys: &[String],
        period: Period,
    ) -> BillingResult<HashMap<String, i64>> {
        let mut totals = HashMap::with_capacity(feature_keys.len());
        for key in feature_keys {
            totals.insert(key.clone(), self.aggregate(tenant_id, app_id, key, period).await?);
        }
        Ok(totals)
    }

    async fn query_usage(
        &self,
        tenant_id: &str,
        app_id: &str,
        opts: UsageQueryOpts,
    ) -> BillingResult<Vec<UsageEvent>> {
        let mut events: Vec<UsageEvent> = self
            .state
            .read()
            .usage_events
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.app_id == app_id)
            .filter(|e| opts.feature_key.as_deref().is_none_or(|k| e.feature_key == k))
            .filter(|e| opts.start.is_none_or(|s| e.timestamp > s))
            .filter(|e| opts.end.is_none_or(|s| e.timestamp < s))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(page(events, opts.limit, opts.offset))
    }

    async fn purge_usage(&self, before: OffsetDateTime) -> BillingResult<i64> {
        let mut state = self.state.write();
        let before_len = state.usage_events.len();
        state.usage_events.retain(|e| e.timestamp >= before);
        Ok((before_len - state.usage_events.len()) as i64)
    }

    // Entitlement cache

    async fn get_cached(
        &self,
        tenant_id: &str,
        app_id: &str,
        feature_key: &str,
    ) -> BillingResult<Decision> {
        let key = cache_key(tenant_id, app_id, feature_key);
        let state = self.state.read();
        match state.cache.get(&key) {
            Some((decision, expires_at)) if OffsetDateTime::now_utc() < *expires_at => {
                Ok(decision.clone())
            }
            _ => Err(BillingError::CacheMiss),
        }
    }

    async fn set_cached(
        &self,
        tenant_id: &str,
        app_id: &str,
        feature_key: &str,
        decision: &Decision,
        ttl: Duration,
    ) -> BillingResult<()> {
        let key = cache_key(tenant_id, app_id, feature_key);
        let expires_at = OffsetDateTime::now_utc() + ttl;
        self.state.write().cache.insert(key, (decision.clone(), expires_at));
        Ok(())
    }

    async fn invalidate(&self, tenant_id: &str, app_id: &str) -> BillingResult<()> {
        let prefix = format!("{tenant_id}:{app_id}:");
        self.state.write().cache.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    async fn invalidate_feature(
        &self,
        tenant_id: &str,
        app_id: &str,
        feature_key: &str,
    ) -> BillingResult<()> {
        let key = cache_key(tenant_id, app_id, feature_key);
        self.state.write().cache.remove(&key);
        Ok(())
    }

    // Invoices

    async fn create_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        let mut state = self.state.write();
        if state.invoices.contains_key(&invoice.id.to_string()) {
            return Err(BillingError::AlreadyExists(format!("invoice {}", invoice.id)));
        }
        state.invoices.insert(invoice.id.to_string(), invoice.clone());
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: InvoiceId) -> BillingResult<Invoice> {
        self.state
            .read()
            .invoices
            .get(&invoice_id.to_string())
            .cloned()
            .ok_or(BillingError::InvoiceNotFound)
    }

    async fn list_invoices(
        &self,
        tenant_id: &str,
        app_id: &str,
        opts: InvoiceListOpts,
    ) -> BillingResult<Vec<Invoice>> {
        let mut invoices: Vec<Invoice> = self
            .state
            .read()
            .invoices
            .values()
            .filter(|i| i.tenant_id == tenant_id && i.app_id == app_id)
            .filter(|i| opts.status.is_none_or(|s| i.status == s))
            .filter(|i| opts.start.is_none_or(|s| i.period_start >= s))
            .filter(|i| opts.end.is_none_or(|e| i.period_end <= e))
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.id);
        Ok(page(invoices, opts.limit, opts.offset))
    }

    async fn update_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        self.state.write().invoices.insert(invoice.id.to_string(), invoice.clone());
        Ok(())
    }

    async fn get_invoice_by_period(
        &self,
        tenant_id: &str,
        app_id: &str,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<Invoice> {
        self.state
            .read()
            .invoices
            .values()
            .find(|i| {
                i.tenant_id == tenant_id
                    && i.app_id == app_id
                    && i.period_start == period_start
                    && i.period_end == period_end
            })
            .cloned()
            .ok_or(BillingError::InvoiceNotFound)
    }

    async fn list_pending_invoices(&self, app_id: &str) -> BillingResult<Vec<Invoice>> {
        let mut invoices: Vec<Invoice> = self
            .state
            .read()
            .invoices
            .values()
            .filter(|i| i.app_id == app_id && i.status == InvoiceStatus::Pending)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.id);
        Ok(invoices)
    }

    async fn mark_invoice_paid(
        &self,
        invoice_id: InvoiceId,
        paid_at: OffsetDateTime,
        payment_ref: &str,
    ) -> BillingResult<()> {
        let mut state = self.state.write();
        let invoice = state
            .invoices
            .get_mut(&invoice_id.to_string())
            .ok_or(BillingError::InvoiceNotFound)?;
        match invoice.status {
            InvoiceStatus::Voided => return Err(BillingError::InvoiceVoided),
            InvoiceStatus::Paid => return Err(BillingError::InvoicePaid),
            _ => {}
        }
        invoice.status = InvoiceStatus::Paid;
        invoice.paid_at = Some(paid_at);
        invoice.payment_ref = payment_ref.to_string();
        invoice.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn mark_invoice_voided(&self, invoice_id: InvoiceId, reason: &str) -> BillingResult<()> {
        let mut state = self.state.write();
        let invoice = state
            .invoices
            .get_mut(&invoice_id.to_string())
            .ok_or(BillingError::InvoiceNotFound)?;
        if invoice.status == InvoiceStatus::Paid {
            return Err(BillingError::InvoicePaid);
        }
        let now = OffsetDateTime::now_utc();
        invoice.status = InvoiceStatus::Voided;
        invoice.voided_at = Some(now);
        invoice.void_reason = reason.to_string();
        invoice.updated_at = now;
        Ok(())
    }

    // Coupons

    async fn create_coupon(&self, coupon: &Coupon) -> BillingResult<()> {
        let mut state = self.state.write();
        if state.coupons.values().any(|c| c.code == coupon.code && c.app_id == coupon.app_id) {
            return Err(BillingError::AlreadyExists(format!("coupon {}", coupon.code)));
        }
        state.coupons.insert(coupon.id.to_string(), coupon.clone());
        Ok(())
    }

    async fn get_coupon(&self, code: &str, app_id: &str) -> BillingResult<Coupon> {
        self.state
            .read()
            .coupons
            .values()
            .find(|c| c.code == code && c.app_id == app_id)
            .cloned()
            .ok_or(BillingError::CouponNotFound)
    }

    async fn get_coupon_by_id(&self, coupon_id: CouponId) -> BillingResult<Coupon> {
        self.state
            .read()
            .coupons
            .get(&coupon_id.to_string())
            .cloned()
            .ok_or(BillingError::CouponNotFound)
    }

    async fn list_coupons(&self, app_id: &str, opts: CouponListOpts) -> BillingResult<Vec<Coupon>> {
        let now = OffsetDateTime::now_utc();
        let mut coupons: Vec<Coupon> = self
            .state
            .read()
            .coupons
            .values()
            .filter(|c| c.app_id == app_id)
            .filter(|c| {
                !opts.active
                    || (c.valid_from.is_none_or(|from| now >= from)
                        && c.valid_until.is_none_or(|until| now <= until))
            })
            .cloned()
            .collect();
        coupons.sort_by_key(|c| c.id);
        Ok(page(coupons, opts.limit, opts.offset))
    }

    async fn update_coupon(&self, coupon: &Coupon) -> BillingResult<()> {
        self.state.write().coupons.insert(coupon.id.to_string(), coupon.clone());
        Ok(())
    }

    async fn delete_coupon(&self, coupon_id: CouponId) -> BillingResult<()> {
        self.state.write().coupons.remove(&coupon_id.to_string());
        Ok(())
    }

    // Lifecycle

    async fn migrate(&self) -> BillingResult<()> {
        Ok(())
    }

    async fn ping(&self) -> BillingResult<()> {
        Ok(())
    }

    async fn close(&self) -> BillingResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::FeatureType;
    use crate::testutil;

    #[tokio::test]
    async fn ingest_deduplicates_by_idempotency_key() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();

        let mut event = testutil::usage_event("t1", "a1", "api_calls", 5, now);
        event.idempotency_key = "req-42".into();
        store.ingest_batch(&[event.clone()]).await.expect("first ingest");
        store.ingest_batch(&[event]).await.expect("second ingest is a no-op");

        let total = store.aggregate("t1", "a1", "api_calls", Period::Monthly).await.expect("sum");
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn empty_idempotency_keys_never_deduplicate() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let event = testutil::usage_event("t1", "a1", "api_calls", 5, now);
        store.ingest_batch(&[event.clone(), event]).await.expect("ingest");

        let total = store.aggregate("t1", "a1", "api_calls", Period::Monthly).await.expect("sum");
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn aggregate_excludes_the_period_boundary_instant() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let boundary = Period::Monthly.start_of(now);

        store
            .ingest_batch(&[
                testutil::usage_event("t1", "a1", "api_calls", 100, boundary),
                testutil::usage_event("t1", "a1", "api_calls", 7, boundary + Duration::from_nanos(1)),
            ])
            .await
            .expect("ingest");

        let total = store.aggregate("t1", "a1", "api_calls", Period::Monthly).await.expect("sum");
        assert_eq!(total, 7);
    }

    #[tokio::test]
    async fn expired_cache_entries_are_not_returned() {
        let store = MemoryStore::new();
        let decision = Decision::deny("api_calls", "quota exceeded");

        store
            .set_cached("t1", "a1", "api_calls", &decision, Duration::from_secs(30))
            .await
            .expect("set");
        assert_eq!(store.get_cached("t1", "a1", "api_calls").await.expect("hit"), decision);

        store
            .set_cached("t1", "a1", "api_calls", &decision, Duration::ZERO)
            .await
            .expect("set expired");
        assert!(matches!(
            store.get_cached("t1", "a1", "api_calls").await,
            Err(BillingError::CacheMiss)
        ));
    }

    #[tokio::test]
    async fn invalidate_clears_the_whole_tenant_app_pair() {
        let store = MemoryStore::new();
        let decision = Decision::deny("api_calls", "quota exceeded");
        let ttl = Duration::from_secs(30);
        store.set_cached("t1", "a1", "api_calls", &decision, ttl).await.expect("set");
        store.set_cached("t1", "a1", "storage", &decision, ttl).await.expect("set");
        store.set_cached("t2", "a1", "api_calls", &decision, ttl).await.expect("set");

        store.invalidate("t1", "a1").await.expect("invalidate");

        assert!(store.get_cached("t1", "a1", "api_calls").await.is_err());
        assert!(store.get_cached("t1", "a1", "storage").await.is_err());
        assert!(store.get_cached("t2", "a1", "api_calls").await.is_ok());
    }

    #[tokio::test]
    async fn newest_entitling_subscription_wins() {
        let store = MemoryStore::new();
        let plan = testutil::plan_with_feature("api_calls", FeatureType::Metered, 100);

        let mut older = testutil::active_subscription("t1", "a1", &plan);
        older.created_at -= time::Duration::days(2);
        let newer = testutil::active_subscription("t1", "a1", &plan);
        let mut canceled = testutil::active_subscription("t1", "a1", &plan);
        canceled.status = crate::subscription::SubscriptionStatus::Canceled;

        store.create_subscription(&older).await.expect("create");
        store.create_subscription(&newer).await.expect("create");
        store.create_subscription(&canceled).await.expect("create");

        let active = store.get_active_subscription("t1", "a1").await.expect("active");
        assert_eq!(active.id, newer.id);
    }

    #[tokio::test]
    async fn purge_removes_only_older_events() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();
        store
            .ingest_batch(&[
                testutil::usage_event("t1", "a1", "api_calls", 1, now - time::Duration::days(40)),
                testutil::usage_event("t1", "a1", "api_calls", 2, now),
            ])
            .await
            .expect("ingest");

        let purged = store.purge_usage(now - time::Duration::days(30)).await.expect("purge");
        assert_eq!(purged, 1);

        let remaining = store
            .query_usage("t1", "a1", UsageQueryOpts::default())
            .await
            .expect("query");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].quantity, 2);
    }

    #[tokio::test]
    async fn invoice_status_guards() {
        let store = MemoryStore::new();
        let plan = testutil::plan_with_base_fee("api_calls", 100, 4900);
        let sub = testutil::active_subscription("t1", "a1", &plan);
        let now = OffsetDateTime::now_utc();

        let mut invoice = crate::invoice::Invoice {
            id: tally_shared::Id::new(tally_shared::Prefix::Invoice),
            tenant_id: "t1".into(),
            subscription_id: sub.id,
            app_id: "a1".into(),
            status: InvoiceStatus::Pending,
            currency: "usd".into(),
            subtotal: tally_shared::usd(4900),
            tax_amount: tally_shared::Money::zero("usd"),
            discount_amount: tally_shared::Money::zero("usd"),
            total: tally_shared::usd(4900),
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
        store.create_invoice(&invoice).await.expect("create");

        store.mark_invoice_paid(invoice.id, now, "pay_123").await.expect("pay");
        assert!(matches!(
            store.mark_invoice_paid(invoice.id, now, "pay_124").await,
            Err(BillingError::InvoicePaid)
        ));
        assert!(matches!(
            store.mark_invoice_voided(invoice.id, "mistake").await,
            Err(BillingError::InvoicePaid)
        ));

        // A voided invoice can never be paid.
        invoice.id = tally_shared::Id::new(tally_shared::Prefix::Invoice);
        invoice.status = InvoiceStatus::Pending;
        invoice.period_start += time::Duration::days(30);
        store.create_invoice(&invoice).await.expect("create");
        store.mark_invoice_voided(invoice.id, "duplicate").await.expect("void");
        assert!(matches!(
            store.mark_invoice_paid(invoice.id, now, "pay_125").await,
            Err(BillingError::InvoiceVoided)
        ));
    }
}

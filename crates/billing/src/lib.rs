//! Tally: an embeddable usage-based billing engine.
//!
//! Applications link this crate to record per-tenant feature usage at
//! high rates, answer "may tenant T consume feature F now?" in
//! sub-millisecond time, and produce draft invoices for subscription
//! periods. Every fact is keyed by a `(tenant, app)` pair carried in a
//! request [`Context`].
//!
//! The three load-bearing pieces:
//!
//! - the **metering pipeline** ([`engine`]): a bounded non-blocking
//!   channel drained by one background worker that batch-flushes into the
//!   store with idempotent insertion;
//! - the **entitlement evaluator** ([`Tally::entitled`]): a read-through
//!   cache over subscription → plan → feature → period-windowed usage
//!   aggregation;
//! - the **plugin registry** ([`registry`]): capability-cached observer
//!   dispatch under per-call timeouts, so hooks can never stall billing.
//!
//! Storage is pluggable behind the [`Store`] trait; [`MemoryStore`]
//! ships for tests and single-process embedding, and a Postgres backend
//! is available behind the `postgres` feature.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tally_billing::{Context, MemoryStore, Tally};
//!
//! # async fn demo() -> tally_billing::BillingResult<()> {
//! let engine = Tally::new(Arc::new(MemoryStore::new()));
//! engine.start(&Context::new()).await?;
//!
//! let ctx = Context::for_tenant("t1", "a1");
//! engine.meter(&ctx, "api_calls", 1).await?;
//! let decision = engine.entitled(&ctx, "api_calls").await?;
//! # let _ = decision;
//! engine.stop().await
//! # }
//! ```

pub mod context;
pub mod coupon;
pub mod engine;
pub mod entitlement;
pub mod error;
pub mod invoice;
pub mod memory;
pub mod meter;
pub mod plan;
pub mod plugin;
pub mod registry;
pub mod store;
pub mod subscription;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(test)]
pub(crate) mod testutil;

pub use context::{Context, APP_ID_KEY, TENANT_ID_KEY};
pub use coupon::{Coupon, CouponListOpts, CouponType};
pub use engine::{Tally, TallyConfig};
pub use entitlement::Decision;
pub use error::{BillingError, BillingResult};
pub use invoice::{Invoice, InvoiceListOpts, InvoiceStatus, LineItem, LineItemType};
pub use memory::MemoryStore;
pub use meter::{UsageEvent, UsageQueryOpts};
pub use plan::{
    Feature, FeatureType, Period, Plan, PlanListOpts, PlanStatus, PriceTier, Pricing, TierType,
};
pub use plugin::{
    CouponValidator, EventKind, InvoiceFormatter, PaymentProvider, Plugin, PricingStrategy,
    QuotaBreach, TaxCalculator, UsageAggregator,
};
pub use registry::PluginRegistry;
pub use store::Store;
pub use subscription::{Subscription, SubscriptionListOpts, SubscriptionStatus};

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

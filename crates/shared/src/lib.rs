//! Shared value types for the Tally billing engine.
//!
//! This crate carries the two types every other Tally crate speaks in:
//! [`Money`] (integer minor units with a currency tag) and [`Id`]
//! (type-prefixed, time-sortable identifiers).

pub mod id;
pub mod money;

pub use id::{
    CouponId, EntitlementId, FeatureId, Id, IdError, InvoiceId, LineItemId, PaymentId, PlanId,
    Prefix, PriceId, SubscriptionId, UsageEventId,
};
pub use money::{aud, cad, eur, gbp, jpy, usd, Money};

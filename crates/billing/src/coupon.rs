//! Discount coupons.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use tally_shared::{CouponId, Money};

use crate::error::{BillingError, BillingResult};

/// Whether a coupon takes a percentage or a fixed amount off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponType {
    Percentage,
    Amount,
}

/// A redeemable discount, unique by code per app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coupon {
    pub id: CouponId,
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub coupon_type: CouponType,
    /// Fixed discount; zero for percentage coupons.
    pub amount: Money,
    /// Whole-number percentage; zero for amount coupons.
    #[serde(default)]
    pub percentage: i32,
    /// `0` means unlimited redemptions.
    #[serde(default)]
    pub max_redemptions: i32,
    #[serde(default)]
    pub times_redeemed: i32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_until: Option<OffsetDateTime>,
    pub app_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Filters for listing coupons.
#[derive(Debug, Clone, Default)]
pub struct CouponListOpts {
    /// Only coupons inside their validity window.
    pub active: bool,
    pub limit: usize,
    pub offset: usize,
}

impl Coupon {
    /// Checks the validity window and the redemption budget at `now`.
    pub fn validate(&self, now: OffsetDateTime) -> BillingResult<()> {
        if let Some(from) = self.valid_from {
            if now < from {
                return Err(BillingError::CouponNotStarted);
            }
        }
        if let Some(until) = self.valid_until {
            if now > until {
                return Err(BillingError::CouponExpired);
            }
        }
        if self.max_redemptions > 0 && self.times_redeemed >= self.max_redemptions {
            return Err(BillingError::CouponExhausted);
        }
        Ok(())
    }

    /// The discount this coupon yields against `subtotal`. Fixed-amount
    /// coupons are capped at the subtotal and must share its currency.
    pub fn discount(&self, subtotal: &Money) -> Money {
        match self.coupon_type {
            CouponType::Percentage => subtotal.multiply(self.percentage as i64).divide(100),
            CouponType::Amount => self.amount.min(subtotal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_shared::usd;
    use time::macros::datetime;

    fn coupon() -> Coupon {
        let now = datetime!(2025-06-01 00:00:00 UTC);
        Coupon {
            id: CouponId::new(tally_shared::Prefix::Coupon),
            code: "LAUNCH20".into(),
            name: "Launch discount".into(),
            coupon_type: CouponType::Percentage,
            amount: Money::zero("usd"),
            percentage: 20,
            max_redemptions: 2,
            times_redeemed: 0,
            valid_from: Some(datetime!(2025-05-01 00:00:00 UTC)),
            valid_until: Some(datetime!(2025-07-01 00:00:00 UTC)),
            app_id: "a1".into(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn validates_window_and_budget() {
        let c = coupon();
        assert!(c.validate(datetime!(2025-06-01 00:00:00 UTC)).is_ok());
        assert!(matches!(
            c.validate(datetime!(2025-04-01 00:00:00 UTC)),
            Err(BillingError::CouponNotStarted)
        ));
        assert!(matches!(
            c.validate(datetime!(2025-08-01 00:00:00 UTC)),
            Err(BillingError::CouponExpired)
        ));

        let mut spent = c;
        spent.times_redeemed = 2;
        assert!(matches!(
            spent.validate(datetime!(2025-06-01 00:00:00 UTC)),
            Err(BillingError::CouponExhausted)
        ));
    }

    #[test]
    fn percentage_and_amount_discounts() {
        let pct = coupon();
        assert_eq!(pct.discount(&usd(10_000)), usd(2_000));

        let mut fixed = coupon();
        fixed.coupon_type = CouponType::Amount;
        fixed.amount = usd(1_500);
        assert_eq!(fixed.discount(&usd(10_000)), usd(1_500));
        // Capped at the subtotal.
        assert_eq!(fixed.discount(&usd(1_000)), usd(1_000));
    }
}

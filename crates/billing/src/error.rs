//! Billing error types.
//!
//! Every failure the engine can report is a stable variant here. Callers
//! match on variants; message strings are for logs only and carry no
//! contract.

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    // General
    #[error("not found: {0}")]
    NotFound(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Plans
    #[error("plan not found")]
    PlanNotFound,

    #[error("feature not found: {0}")]
    FeatureNotFound(String),

    // Subscriptions
    #[error("subscription not found")]
    SubscriptionNotFound,

    #[error("no active subscription")]
    NoActiveSubscription,

    // Metering
    #[error("meter buffer full")]
    BufferFull,

    // Entitlements
    #[error("quota exceeded for {feature}: used {used} of {limit}")]
    QuotaExceeded { feature: String, used: i64, limit: i64 },

    #[error("hard limit reached")]
    HardLimitReached,

    #[error("soft limit reached")]
    SoftLimitReached,

    #[error("entitlement cache miss")]
    CacheMiss,

    // Invoices
    #[error("invoice not found")]
    InvoiceNotFound,

    #[error("invoice already finalized")]
    InvoiceFinalized,

    #[error("invoice already paid")]
    InvoicePaid,

    #[error("invoice is voided")]
    InvoiceVoided,

    // Coupons
    #[error("coupon not found")]
    CouponNotFound,

    #[error("coupon expired")]
    CouponExpired,

    #[error("coupon redemptions exhausted")]
    CouponExhausted,

    #[error("coupon not yet valid")]
    CouponNotStarted,

    // Providers
    #[error("provider sync failed: {0}")]
    ProviderSync(String),

    #[error("webhook validation failed: {0}")]
    ProviderWebhook(String),

    // Store
    #[error("store not ready")]
    StoreNotReady,

    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    #[error("migration failed: {0}")]
    MigrationFailed(String),

    #[error("database error: {0}")]
    Database(String),
}

impl BillingError {
    /// True for any of the per-entity or generic not-found conditions.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BillingError::NotFound(_)
                | BillingError::PlanNotFound
                | BillingError::SubscriptionNotFound
                | BillingError::FeatureNotFound(_)
                | BillingError::InvoiceNotFound
                | BillingError::CouponNotFound
        )
    }

    /// True for quota/limit conditions.
    pub fn is_quota(&self) -> bool {
        matches!(
            self,
            BillingError::QuotaExceeded { .. }
                | BillingError::HardLimitReached
                | BillingError::SoftLimitReached
        )
    }

    /// True when the operation is temporary and worth retrying, most
    /// importantly the meter back-pressure signal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::BufferFull
                | BillingError::StoreNotReady
                | BillingError::TransactionFailed(_)
                | BillingError::ProviderSync(_)
        )
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

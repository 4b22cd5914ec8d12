//! PostgreSQL store backend.
//!
//! Available behind the `postgres` cargo feature. Entities map to flat
//! rows; plan features, pricing, line items, and metadata ride along as
//! JSONB documents. Money persists as `(amount_cents, currency)` column
//! pairs. Idempotent ingest leans on a partial unique index over
//! non-empty idempotency keys plus `ON CONFLICT DO NOTHING`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use time::OffsetDateTime;

use tally_shared::{CouponId, Id, IdError, InvoiceId, Money, PlanId, SubscriptionId};

use crate::coupon::{Coupon, CouponListOpts};
use crate::entitlement::Decision;
use crate::error::{BillingError, BillingResult};
use crate::invoice::{Invoice, InvoiceListOpts, InvoiceStatus, LineItem};
use crate::meter::{UsageEvent, UsageQueryOpts};
use crate::plan::{Period, Plan, PlanListOpts, PlanStatus};
use crate::store::Store;
use crate::subscription::{Subscription, SubscriptionListOpts};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tally_plans (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL DEFAULT '',
    slug        TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    currency    TEXT NOT NULL DEFAULT '',
    status      TEXT NOT NULL DEFAULT 'draft',
    trial_days  INT NOT NULL DEFAULT 0,
    features    JSONB NOT NULL DEFAULT '[]',
    pricing     JSONB,
    app_id      TEXT NOT NULL DEFAULT '',
    metadata    JSONB NOT NULL DEFAULT '{}',
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_tally_plans_app_id ON tally_plans (app_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tally_plans_slug_app ON tally_plans (slug, app_id);
CREATE INDEX IF NOT EXISTS idx_tally_plans_status ON tally_plans (app_id, status);

CREATE TABLE IF NOT EXISTS tally_subscriptions (
    id                   TEXT PRIMARY KEY,
    tenant_id            TEXT NOT NULL DEFAULT '',
    plan_id              TEXT NOT NULL DEFAULT '',
    status               TEXT NOT NULL DEFAULT 'active',
    current_period_start TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    current_period_end   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    trial_start          TIMESTAMPTZ,
    trial_end            TIMESTAMPTZ,
    canceled_at          TIMESTAMPTZ,
    cancel_at            TIMESTAMPTZ,
    ended_at             TIMESTAMPTZ,
    app_id               TEXT NOT NULL DEFAULT '',
    provider_id          TEXT NOT NULL DEFAULT '',
    provider_name        TEXT NOT NULL DEFAULT '',
    metadata             JSONB NOT NULL DEFAULT '{}',
    created_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at           TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_tally_subs_tenant_app ON tally_subscriptions (tenant_id, app_id);
CREATE INDEX IF NOT EXISTS idx_tally_subs_status ON tally_subscriptions (tenant_id, app_id, status);
CREATE INDEX IF NOT EXISTS idx_tally_subs_plan ON tally_subscriptions (plan_id);

CREATE TABLE IF NOT EXISTS tally_usage_events (
    id              TEXT PRIMARY KEY,
    tenant_id       TEXT NOT NULL DEFAULT '',
    app_id          TEXT NOT NULL DEFAULT '',
    feature_key     TEXT NOT NULL DEFAULT '',
    quantity        BIGINT NOT NULL DEFAULT 0,
    timestamp       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    idempotency_key TEXT NOT NULL DEFAULT '',
    metadata        JSONB NOT NULL DEFAULT '{}',
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_tally_usage_tenant_app_feature
    ON tally_usage_events (tenant_id, app_id, feature_key, timestamp);
CREATE INDEX IF NOT EXISTS idx_tally_usage_timestamp ON tally_usage_events (timestamp);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tally_usage_idempotency
    ON tally_usage_events (idempotency_key) WHERE idempotency_key != '';

CREATE TABLE IF NOT EXISTS tally_entitlement_cache (
    cache_key   TEXT PRIMARY KEY,
    tenant_id   TEXT NOT NULL DEFAULT '',
    app_id      TEXT NOT NULL DEFAULT '',
    feature_key TEXT NOT NULL DEFAULT '',
    allowed     BOOLEAN NOT NULL DEFAULT FALSE,
    used        BIGINT NOT NULL DEFAULT 0,
    cache_limit BIGINT NOT NULL DEFAULT 0,
    remaining   BIGINT NOT NULL DEFAULT 0,
    soft_limit  BOOLEAN NOT NULL DEFAULT FALSE,
    reason      TEXT NOT NULL DEFAULT '',
    expires_at  TIMESTAMPTZ NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_tally_cache_tenant_app ON tally_entitlement_cache (tenant_id, app_id);
CREATE INDEX IF NOT EXISTS idx_tally_cache_expires ON tally_entitlement_cache (expires_at);

CREATE TABLE IF NOT EXISTS tally_invoices (
    id                    TEXT PRIMARY KEY,
    tenant_id             TEXT NOT NULL DEFAULT '',
    subscription_id       TEXT NOT NULL DEFAULT '',
    status                TEXT NOT NULL DEFAULT 'draft',
    currency              TEXT NOT NULL DEFAULT '',
    subtotal_amount_cents BIGINT NOT NULL DEFAULT 0,
    tax_amount_cents      BIGINT NOT NULL DEFAULT 0,
    discount_amount_cents BIGINT NOT NULL DEFAULT 0,
    total_amount_cents    BIGINT NOT NULL DEFAULT 0,
    line_items            JSONB NOT NULL DEFAULT '[]',
    period_start          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    period_end            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    due_date              TIMESTAMPTZ,
    paid_at               TIMESTAMPTZ,
    voided_at             TIMESTAMPTZ,
    void_reason           TEXT NOT NULL DEFAULT '',
    payment_ref           TEXT NOT NULL DEFAULT '',
    provider_id           TEXT NOT NULL DEFAULT '',
    app_id                TEXT NOT NULL DEFAULT '',
    metadata              JSONB NOT NULL DEFAULT '{}',
    created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at            TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_tally_invoices_tenant_app ON tally_invoices (tenant_id, app_id);
CREATE INDEX IF NOT EXISTS idx_tally_invoices_status ON tally_invoices (app_id, status);
CREATE INDEX IF NOT EXISTS idx_tally_invoices_period
    ON tally_invoices (tenant_id, app_id, period_start, period_end);
CREATE INDEX IF NOT EXISTS idx_tally_invoices_sub ON tally_invoices (subscription_id);

CREATE TABLE IF NOT EXISTS tally_coupons (
    id              TEXT PRIMARY KEY,
    code            TEXT NOT NULL DEFAULT '',
    name            TEXT NOT NULL DEFAULT '',
    type            TEXT NOT NULL DEFAULT '',
    amount_cents    BIGINT NOT NULL DEFAULT 0,
    amount_currency TEXT NOT NULL DEFAULT '',
    percentage      INT NOT NULL DEFAULT 0,
    max_redemptions INT NOT NULL DEFAULT 0,
    times_redeemed  INT NOT NULL DEFAULT 0,
    valid_from      TIMESTAMPTZ,
    valid_until     TIMESTAMPTZ,
    app_id          TEXT NOT NULL DEFAULT '',
    metadata        JSONB NOT NULL DEFAULT '{}',
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tally_coupons_code_app ON tally_coupons (code, app_id);
CREATE INDEX IF NOT EXISTS idx_tally_coupons_app ON tally_coupons (app_id);
"#;

/// A [`Store`] over a PostgreSQL pool.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> PostgresStore {
        PostgresStore { pool }
    }

    /// Connects with conservative pool limits suitable for sharing a
    /// pooled database with other services.
    pub async fn connect(database_url: &str) -> BillingResult<PostgresStore> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(PostgresStore { pool })
    }

    /// The underlying pool, for callers that need direct access.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// Enum columns persist as their snake_case serde names.
fn enum_to_str<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

fn enum_from_str<T: DeserializeOwned>(s: &str) -> BillingResult<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| BillingError::Database(format!("decode enum {s:?}: {e}")))
}

fn json_of<T: Serialize>(value: &T) -> BillingResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| BillingError::Database(format!("encode json: {e}")))
}

fn json_to<T: DeserializeOwned>(value: serde_json::Value) -> BillingResult<T> {
    serde_json::from_value(value).map_err(|e| BillingError::Database(format!("decode json: {e}")))
}

fn id_error(e: IdError) -> BillingError {
    BillingError::Database(format!("decode id: {e}"))
}

fn cache_key(tenant_id: &str, app_id: &str, feature_key: &str) -> String {
    format!("{tenant_id}:{app_id}:{feature_key}")
}

fn row_to_plan(row: &PgRow) -> BillingResult<Plan> {
    let status: String = row.try_get("status")?;
    let pricing: Option<serde_json::Value> = row.try_get("pricing")?;
    Ok(Plan {
        id: Id::parse_any(row.try_get::<String, _>("id")?.as_str()).map_err(id_error)?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        description: row.try_get("description")?,
        currency: row.try_get("currency")?,
        status: enum_from_str::<PlanStatus>(&status)?,
        trial_days: row.try_get("trial_days")?,
        features: json_to(row.try_get("features")?)?,
        pricing: pricing.map(json_to).transpose()?,
        app_id: row.try_get("app_id")?,
        metadata: json_to(row.try_get("metadata")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_subscription(row: &PgRow) -> BillingResult<Subscription> {
    let status: String = row.try_get("status")?;
    Ok(Subscription {
        id: Id::parse_any(row.try_get::<String, _>("id")?.as_str()).map_err(id_error)?,
        tenant_id: row.try_get("tenant_id")?,
        app_id: row.try_get("app_id")?,
        plan_id: Id::parse_any(row.try_get::<String, _>("plan_id")?.as_str()).map_err(id_error)?,
        status: enum_from_str(&status)?,
        current_period_start: row.try_get("current_period_start")?,
        current_period_end: row.try_get("current_period_end")?,
        trial_start: row.try_get("trial_start")?,
        trial_end: row.try_get("trial_end")?,
        canceled_at: row.try_get("canceled_at")?,
        cancel_at: row.try_get("cancel_at")?,
        ended_at: row.try_get("ended_at")?,
        provider_id: row.try_get("provider_id")?,
        provider_name: row.try_get("provider_name")?,
        metadata: json_to(row.try_get("metadata")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_usage_event(row: &PgRow) -> BillingResult<UsageEvent> {
    Ok(UsageEvent {
        id: Id::parse_any(row.try_get::<String, _>("id")?.as_str()).map_err(id_error)?,
        tenant_id: row.try_get("tenant_id")?,
        app_id: row.try_get("app_id")?,
        feature_key: row.try_get("feature_key")?,
        quantity: row.try_get("quantity")?,
        timestamp: row.try_get("timestamp")?,
        idempotency_key: row.try_get("idempotency_key")?,
        metadata: json_to(row.try_get("metadata")?)?,
    })
}

fn row_to_invoice(row: &PgRow) -> BillingResult<Invoice> {
    let status: String = row.try_get("status")?;
    let currency: String = row.try_get("currency")?;
    let line_items: Vec<LineItem> = json_to(row.try_get("line_items")?)?;
    Ok(Invoice {
        id: Id::parse_any(row.try_get::<String, _>("id")?.as_str()).map_err(id_error)?,
        tenant_id: row.try_get("tenant_id")?,
        subscription_id: Id::parse_any(row.try_get::<String, _>("subscription_id")?.as_str())
            .map_err(id_error)?,
        app_id: row.try_get("app_id")?,
        status: enum_from_str(&status)?,
        subtotal: Money::new(row.try_get("subtotal_amount_cents")?, &currency),
        tax_amount: Money::new(row.try_get("tax_amount_cents")?, &currency),
        discount_amount: Money::new(row.try_get("discount_amount_cents")?, &currency),
        total: Money::new(row.try_get("total_amount_cents")?, &currency),
        currency,
        line_items,
        period_start: row.try_get("period_start")?,
        period_end: row.try_get("period_end")?,
        due_date: row.try_get("due_date")?,
        paid_at: row.try_get("paid_at")?,
        voided_at: row.try_get("voided_at")?,
        void_reason: row.try_get("void_reason")?,
        payment_ref: row.try_get("payment_ref")?,
        provider_id: row.try_get("provider_id")?,
        metadata: json_to(row.try_get("metadata")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_coupon(row: &PgRow) -> BillingResult<Coupon> {
    let coupon_type: String = row.try_get("type")?;
    let amount_currency: String = row.try_get("amount_currency")?;
    Ok(Coupon {
        id: Id::parse_any(row.try_get::<String, _>("id")?.as_str()).map_err(id_error)?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        coupon_type: enum_from_str(&coupon_type)?,
        amount: Money::new(row.try_get("amount_cents")?, &amount_currency),
        percentage: row.try_get("percentage")?,
        max_redemptions: row.try_get("max_redemptions")?,
        times_redeemed: row.try_get("times_redeemed")?,
        valid_from: row.try_get("valid_from")?,
        valid_until: row.try_get("valid_until")?,
        app_id: row.try_get("app_id")?,
        metadata: json_to(row.try_get("metadata")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_decision(row: &PgRow) -> BillingResult<Decision> {
    Ok(Decision {
        allowed: row.try_get("allowed")?,
        feature: row.try_get("feature_key")?,
        used: row.try_get("used")?,
        limit: row.try_get("cache_limit")?,
        remaining: row.try_get("remaining")?,
        soft_limit: row.try_get("soft_limit")?,
        reason: row.try_get("reason")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

#[async_trait]
impl Store for PostgresStore {
    // Plans

    async fn create_plan(&self, plan: &Plan) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO tally_plans (
                id, name, slug, description, currency, status, trial_days,
                features, pricing, app_id, metadata, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(plan.id.to_string())
        .bind(&plan.name)
        .bind(&plan.slug)
        .bind(&plan.description)
        .bind(&plan.currency)
        .bind(enum_to_str(&plan.status))
        .bind(plan.trial_days)
        .bind(json_of(&plan.features)?)
        .bind(plan.pricing.as_ref().map(json_of).transpose()?)
        .bind(&plan.app_id)
        .bind(json_of(&plan.metadata)?)
        .bind(plan.created_at)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(BillingError::AlreadyExists(format!("plan {}", plan.slug)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_plan(&self, plan_id: PlanId) -> BillingResult<Plan> {
        let row = sqlx::query("SELECT * FROM tally_plans WHERE id = $1")
            .bind(plan_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BillingError::PlanNotFound)?;
        row_to_plan(&row)
    }

    async fn get_plan_by_slug(&self, slug: &str, app_id: &str) -> BillingResult<Plan> {
        let row = sqlx::query("SELECT * FROM tally_plans WHERE slug = $1 AND app_id = $2")
            .bind(slug)
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BillingError::PlanNotFound)?;
        row_to_plan(&row)
    }

    async fn list_plans(&self, app_id: &str, opts: PlanListOpts) -> BillingResult<Vec<Plan>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tally_plans
            WHERE app_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY id
            LIMIT CASE WHEN $3 > 0 THEN $3 ELSE NULL END OFFSET $4
            "#,
        )
        .bind(app_id)
        .bind(opts.status.map(|s| enum_to_str(&s)))
        .bind(opts.limit as i64)
        .bind(opts.offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_plan).collect()
    }

    async fn update_plan(&self, plan: &Plan) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tally_plans SET
                name = $2, slug = $3, description = $4, currency = $5,
                status = $6, trial_days = $7, features = $8, pricing = $9,
                metadata = $10, updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(plan.id.to_string())
        .bind(&plan.name)
        .bind(&plan.slug)
        .bind(&plan.description)
        .bind(&plan.currency)
        .bind(enum_to_str(&plan.status))
        .bind(plan.trial_days)
        .bind(json_of(&plan.features)?)
        .bind(plan.pricing.as_ref().map(json_of).transpose()?)
        .bind(json_of(&plan.metadata)?)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::PlanNotFound);
        }
        Ok(())
    }

    async fn delete_plan(&self, plan_id: PlanId) -> BillingResult<()> {
        sqlx::query("DELETE FROM tally_plans WHERE id = $1")
            .bind(plan_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn archive_plan(&self, plan_id: PlanId) -> BillingResult<()> {
        let result =
            sqlx::query("UPDATE tally_plans SET status = 'archived', updated_at = NOW() WHERE id = $1")
                .bind(plan_id.to_string())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::PlanNotFound);
        }
        Ok(())
    }

    // Subscriptions

    async fn create_subscription(&self, sub: &Subscription) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO tally_subscriptions (
                id, tenant_id, plan_id, status, current_period_start,
                current_period_end, trial_start, trial_end, canceled_at,
                cancel_at, ended_at, app_id, provider_id, provider_name,
                metadata, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(sub.id.to_string())
        .bind(&sub.tenant_id)
        .bind(sub.plan_id.to_string())
        .bind(enum_to_str(&sub.status))
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.trial_start)
        .bind(sub.trial_end)
        .bind(sub.canceled_at)
        .bind(sub.cancel_at)
        .bind(sub.ended_at)
        .bind(&sub.app_id)
        .bind(&sub.provider_id)
        .bind(&sub.provider_name)
        .bind(json_of(&sub.metadata)?)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(BillingError::AlreadyExists(format!("subscription {}", sub.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_subscription(&self, sub_id: SubscriptionId) -> BillingResult<Subscription> {
        let row = sqlx::query("SELECT * FROM tally_subscriptions WHERE id = $1")
            .bind(sub_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)?;
        row_to_subscription(&row)
    }

    async fn get_active_subscription(
        &self,
        tenant_id: &str,
        app_id: &str,
    ) -> BillingResult<Subscription> {
        let row = sqlx::query(
            r#"
            SELECT * FROM tally_subscriptions
            WHERE tenant_id = $1 AND app_id = $2 AND status IN ('active', 'trialing')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(BillingError::NoActiveSubscription)?;
        row_to_subscription(&row)
    }

    async fn list_subscriptions(
        &self,
        tenant_id: &str,
        app_id: &str,
        opts: SubscriptionListOpts,
    ) -> BillingResult<Vec<Subscription>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tally_subscriptions
            WHERE tenant_id = $1 AND app_id = $2 AND ($3::text IS NULL OR status = $3)
            ORDER BY id
            LIMIT CASE WHEN $4 > 0 THEN $4 ELSE NULL END OFFSET $5
            "#,
        )
        .bind(tenant_id)
        .bind(app_id)
        .bind(opts.status.map(|s| enum_to_str(&s)))
        .bind(opts.limit as i64)
        .bind(opts.offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_subscription).collect()
    }

    async fn update_subscription(&self, sub: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE tally_subscriptions SET
                tenant_id = $2, plan_id = $3, status = $4,
                current_period_start = $5, current_period_end = $6,
                trial_start = $7, trial_end = $8, canceled_at = $9,
                cancel_at = $10, ended_at = $11, provider_id = $12,
                provider_name = $13, metadata = $14, updated_at = $15
            WHERE id = $1
            "#,
        )
        .bind(sub.id.to_string())
        .bind(&sub.tenant_id)
        .bind(sub.plan_id.to_string())
        .bind(enum_to_str(&sub.status))
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.trial_start)
        .bind(sub.trial_end)
        .bind(sub.canceled_at)
        .bind(sub.cancel_at)
        .bind(sub.ended_at)
        .bind(&sub.provider_id)
        .bind(&sub.provider_name)
        .bind(json_of(&sub.metadata)?)
        .bind(sub.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_subscription(
        &self,
        sub_id: SubscriptionId,
        cancel_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tally_subscriptions SET
                cancel_at = $2,
                status = CASE WHEN $2 <= NOW() THEN 'canceled' ELSE status END,
                canceled_at = CASE WHEN $2 <= NOW() THEN NOW() ELSE canceled_at END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(sub_id.to_string())
        .bind(cancel_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::SubscriptionNotFound);
        }
        Ok(())
    }

    // Metering

    async fn ingest_batch(&self, events: &[UsageEvent]) -> BillingResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for event in events {
            // The partial unique index over non-empty idempotency keys
            // turns duplicate submissions into no-ops.
            sqlx::query(
                r#"
                INSERT INTO tally_usage_events (
                    id, tenant_id, app_id, feature_key, quantity,
                    timestamp, idempotency_key, metadata
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(event.id.to_string())
            .bind(&event.tenant_id)
            .bind(&event.app_id)
            .bind(&event.feature_key)
            .bind(event.quantity)
            .bind(event.timestamp)
            .bind(&event.idempotency_key)
            .bind(json_of(&event.metadata)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await.map_err(|e| BillingError::TransactionFailed(e.to_string()))
    }

    async fn aggregate(
        &self,
        tenant_id: &str,
        app_id: &str,
        feature_key: &str,
        period: Period,
    ) -> BillingResult<i64> {
        let start = period.start_of(OffsetDateTime::now_utc());
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(quantity), 0)::bigint
            FROM tally_usage_events
            WHERE tenant_id = $1 AND app_id = $2 AND feature_key = $3 AND timestamp > $4
            "#,
        )
        .bind(tenant_id)
        .bind(app_id)
        .bind(feature_key)
        .bind(start)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn aggregate_multi(
        &self,
        tenant_id: &str,
        app_id: &str,
        feature_keys: &[String],
        period: Period,
    ) -> BillingResult<HashMap<String, i64>> {
        let start = period.start_of(OffsetDateTime::now_utc());
        let rows = sqlx::query(
            r#"
            SELECT feature_key, COALESCE(SUM(quantity), 0)::bigint AS total
            FROM tally_usage_events
            WHERE tenant_id = $1 AND app_id = $2 AND feature_key = ANY($3) AND timestamp > $4
            GROUP BY feature_key
            "#,
        )
        .bind(tenant_id)
        .bind(app_id)
        .bind(feature_keys)
        .bind(start)
        .fetch_all(&self.pool)
        .await?;

        let mut totals: HashMap<String, i64> =
            feature_keys.iter().map(|k| (k.clone(), 0)).collect();
        for row in rows {
            totals.insert(row.try_get("feature_key")?, row.try_get("total")?);
        }
        Ok(totals)
    }

    async fn query_usage(
        &self,
        tenant_id: &str,
        app_id: &str,
        opts: UsageQueryOpts,
    ) -> BillingResult<Vec<UsageEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tally_usage_events
            WHERE tenant_id = $1 AND app_id = $2
              AND ($3::text IS NULL OR feature_key = $3)
              AND ($4::timestamptz IS NULL OR timestamp > $4)
              AND ($5::timestamptz IS NULL OR timestamp < $5)
            ORDER BY timestamp
            LIMIT CASE WHEN $6 > 0 THEN $6 ELSE NULL END OFFSET $7
            "#,
        )
        .bind(tenant_id)
        .bind(app_id)
        .bind(opts.feature_key)
        .bind(opts.start)
        .bind(opts.end)
        .bind(opts.limit as i64)
        .bind(opts.offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_usage_event).collect()
    }

    async fn purge_usage(&self, before: OffsetDateTime) -> BillingResult<i64> {
        let result = sqlx::query("DELETE FROM tally_usage_events WHERE timestamp < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as i64)
    }

    // Entitlement cache

    async fn get_cached(
        &self,
        tenant_id: &str,
        app_id: &str,
        feature_key: &str,
    ) -> BillingResult<Decision> {
        let row = sqlx::query(
            "SELECT * FROM tally_entitlement_cache WHERE cache_key = $1 AND expires_at > NOW()",
        )
        .bind(cache_key(tenant_id, app_id, feature_key))
        .fetch_optional(&self.pool)
        .await?
        .ok_or(BillingError::CacheMiss)?;
        row_to_decision(&row)
    }

    async fn set_cached(
        &self,
        tenant_id: &str,
        app_id: &str,
        feature_key: &str,
        decision: &Decision,
        ttl: Duration,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tally_entitlement_cache (
                cache_key, tenant_id, app_id, feature_key, allowed, used,
                cache_limit, remaining, soft_limit, reason, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (cache_key) DO UPDATE SET
                allowed = EXCLUDED.allowed, used = EXCLUDED.used,
                cache_limit = EXCLUDED.cache_limit,
                remaining = EXCLUDED.remaining,
                soft_limit = EXCLUDED.soft_limit, reason = EXCLUDED.reason,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(cache_key(tenant_id, app_id, feature_key))
        .bind(tenant_id)
        .bind(app_id)
        .bind(feature_key)
        .bind(decision.allowed)
        .bind(decision.used)
        .bind(decision.limit)
        .bind(decision.remaining)
        .bind(decision.soft_limit)
        .bind(&decision.reason)
        .bind(OffsetDateTime::now_utc() + ttl)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn invalidate(&self, tenant_id: &str, app_id: &str) -> BillingResult<()> {
        sqlx::query("DELETE FROM tally_entitlement_cache WHERE tenant_id = $1 AND app_id = $2")
            .bind(tenant_id)
            .bind(app_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn invalidate_feature(
        &self,
        tenant_id: &str,
        app_id: &str,
        feature_key: &str,
    ) -> BillingResult<()> {
        sqlx::query("DELETE FROM tally_entitlement_cache WHERE cache_key = $1")
            .bind(cache_key(tenant_id, app_id, feature_key))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Invoices

    async fn create_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tally_invoices (
                id, tenant_id, subscription_id, status, currency,
                subtotal_amount_cents, tax_amount_cents,
                discount_amount_cents, total_amount_cents, line_items,
                period_start, period_end, due_date, paid_at, voided_at,
                void_reason, payment_ref, provider_id, app_id, metadata,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                      $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
            "#,
        )
        .bind(invoice.id.to_string())
        .bind(&invoice.tenant_id)
        .bind(invoice.subscription_id.to_string())
        .bind(enum_to_str(&invoice.status))
        .bind(&invoice.currency)
        .bind(invoice.subtotal.amount)
        .bind(invoice.tax_amount.amount)
        .bind(invoice.discount_amount.amount)
        .bind(invoice.total.amount)
        .bind(json_of(&invoice.line_items)?)
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .bind(invoice.due_date)
        .bind(invoice.paid_at)
        .bind(invoice.voided_at)
        .bind(&invoice.void_reason)
        .bind(&invoice.payment_ref)
        .bind(&invoice.provider_id)
        .bind(&invoice.app_id)
        .bind(json_of(&invoice.metadata)?)
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: InvoiceId) -> BillingResult<Invoice> {
        let row = sqlx::query("SELECT * FROM tally_invoices WHERE id = $1")
            .bind(invoice_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BillingError::InvoiceNotFound)?;
        row_to_invoice(&row)
    }

    async fn list_invoices(
        &self,
        tenant_id: &str,
        app_id: &str,
        opts: InvoiceListOpts,
    ) -> BillingResult<Vec<Invoice>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tally_invoices
            WHERE tenant_id = $1 AND app_id = $2
              AND ($3::text IS NULL OR status = $3)
              AND ($4::timestamptz IS NULL OR period_start >= $4)
              AND ($5::timestamptz IS NULL OR period_end <= $5)
            ORDER BY id
            LIMIT CASE WHEN $6 > 0 THEN $6 ELSE NULL END OFFSET $7
            "#,
        )
        .bind(tenant_id)
        .bind(app_id)
        .bind(opts.status.map(|s| enum_to_str(&s)))
        .bind(opts.start)
        .bind(opts.end)
        .bind(opts.limit as i64)
        .bind(opts.offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_invoice).collect()
    }

    async fn update_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE tally_invoices SET
                status = $2, currency = $3, subtotal_amount_cents = $4,
                tax_amount_cents = $5, discount_amount_cents = $6,
                total_amount_cents = $7, line_items = $8, due_date = $9,
                paid_at = $10, voided_at = $11, void_reason = $12,
                payment_ref = $13, provider_id = $14, metadata = $15,
                updated_at = $16
            WHERE id = $1
            "#,
        )
        .bind(invoice.id.to_string())
        .bind(enum_to_str(&invoice.status))
        .bind(&invoice.currency)
        .bind(invoice.subtotal.amount)
        .bind(invoice.tax_amount.amount)
        .bind(invoice.discount_amount.amount)
        .bind(invoice.total.amount)
        .bind(json_of(&invoice.line_items)?)
        .bind(invoice.due_date)
        .bind(invoice.paid_at)
        .bind(invoice.voided_at)
        .bind(&invoice.void_reason)
        .bind(&invoice.payment_ref)
        .bind(&invoice.provider_id)
        .bind(json_of(&invoice.metadata)?)
        .bind(invoice.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_invoice_by_period(
        &self,
        tenant_id: &str,
        app_id: &str,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<Invoice> {
        let row = sqlx::query(
            r#"
            SELECT * FROM tally_invoices
            WHERE tenant_id = $1 AND app_id = $2
              AND period_start = $3 AND period_end = $4
            "#,
        )
        .bind(tenant_id)
        .bind(app_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(BillingError::InvoiceNotFound)?;
        row_to_invoice(&row)
    }

    async fn list_pending_invoices(&self, app_id: &str) -> BillingResult<Vec<Invoice>> {
        let rows = sqlx::query(
            "SELECT * FROM tally_invoices WHERE app_id = $1 AND status = 'pending' ORDER BY id",
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_invoice).collect()
    }

    async fn mark_invoice_paid(
        &self,
        invoice_id: InvoiceId,
        paid_at: OffsetDateTime,
        payment_ref: &str,
    ) -> BillingResult<()> {
        let invoice = self.get_invoice(invoice_id).await?;
        match invoice.status {
            InvoiceStatus::Voided => return Err(BillingError::InvoiceVoided),
            InvoiceStatus::Paid => return Err(BillingError::InvoicePaid),
            _ => {}
        }

        sqlx::query(
            r#"
            UPDATE tally_invoices
            SET status = 'paid', paid_at = $2, payment_ref = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(invoice_id.to_string())
        .bind(paid_at)
        .bind(payment_ref)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_invoice_voided(&self, invoice_id: InvoiceId, reason: &str) -> BillingResult<()> {
        let invoice = self.get_invoice(invoice_id).await?;
        if invoice.status == InvoiceStatus::Paid {
            return Err(BillingError::InvoicePaid);
        }

        sqlx::query(
            r#"
            UPDATE tally_invoices
            SET status = 'voided', voided_at = NOW(), void_reason = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(invoice_id.to_string())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // Coupons

    async fn create_coupon(&self, coupon: &Coupon) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO tally_coupons (
                id, code, name, type, amount_cents, amount_currency,
                percentage, max_redemptions, times_redeemed, valid_from,
                valid_until, app_id, metadata, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(coupon.id.to_string())
        .bind(&coupon.code)
        .bind(&coupon.name)
        .bind(enum_to_str(&coupon.coupon_type))
        .bind(coupon.amount.amount)
        .bind(&coupon.amount.currency)
        .bind(coupon.percentage)
        .bind(coupon.max_redemptions)
        .bind(coupon.times_redeemed)
        .bind(coupon.valid_from)
        .bind(coupon.valid_until)
        .bind(&coupon.app_id)
        .bind(json_of(&coupon.metadata)?)
        .bind(coupon.created_at)
        .bind(coupon.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(BillingError::AlreadyExists(format!("coupon {}", coupon.code)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_coupon(&self, code: &str, app_id: &str) -> BillingResult<Coupon> {
        let row = sqlx::query("SELECT * FROM tally_coupons WHERE code = $1 AND app_id = $2")
            .bind(code)
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BillingError::CouponNotFound)?;
        row_to_coupon(&row)
    }

    async fn get_coupon_by_id(&self, coupon_id: CouponId) -> BillingResult<Coupon> {
        let row = sqlx::query("SELECT * FROM tally_coupons WHERE id = $1")
            .bind(coupon_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BillingError::CouponNotFound)?;
        row_to_coupon(&row)
    }

    async fn list_coupons(&self, app_id: &str, opts: CouponListOpts) -> BillingResult<Vec<Coupon>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tally_coupons
            WHERE app_id = $1
              AND (NOT $2 OR (
                  (valid_from IS NULL OR valid_from <= NOW())
                  AND (valid_until IS NULL OR valid_until >= NOW())
              ))
            ORDER BY id
            LIMIT CASE WHEN $3 > 0 THEN $3 ELSE NULL END OFFSET $4
            "#,
        )
        .bind(app_id)
        .bind(opts.active)
        .bind(opts.limit as i64)
        .bind(opts.offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_coupon).collect()
    }

    async fn update_coupon(&self, coupon: &Coupon) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE tally_coupons SET
                code = $2, name = $3, type = $4, amount_cents = $5,
                amount_currency = $6, percentage = $7, max_redemptions = $8,
                times_redeemed = $9, valid_from = $10, valid_until = $11,
                metadata = $12, updated_at = $13
            WHERE id = $1
            "#,
        )
        .bind(coupon.id.to_string())
        .bind(&coupon.code)
        .bind(&coupon.name)
        .bind(enum_to_str(&coupon.coupon_type))
        .bind(coupon.amount.amount)
        .bind(&coupon.amount.currency)
        .bind(coupon.percentage)
        .bind(coupon.max_redemptions)
        .bind(coupon.times_redeemed)
        .bind(coupon.valid_from)
        .bind(coupon.valid_until)
        .bind(json_of(&coupon.metadata)?)
        .bind(coupon.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_coupon(&self, coupon_id: CouponId) -> BillingResult<()> {
        sqlx::query("DELETE FROM tally_coupons WHERE id = $1")
            .bind(coupon_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Lifecycle

    async fn migrate(&self) -> BillingResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| BillingError::MigrationFailed(e.to_string()))?;
        Ok(())
    }

    async fn ping(&self) -> BillingResult<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> BillingResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

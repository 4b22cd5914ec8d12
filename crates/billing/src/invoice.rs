//! Invoice model.
//!
//! An invoice owns its line items: items carry the invoice id but are
//! persisted and loaded embedded in their parent, and never outlive it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use tally_shared::{InvoiceId, LineItemId, Money, SubscriptionId};

/// Invoice lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Pending,
    Paid,
    PastDue,
    Voided,
}

/// What a line item charges for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemType {
    Base,
    Usage,
    Overage,
    Seat,
    Discount,
    Tax,
}

/// A charge document for one subscription period.
///
/// Invariant: `total = subtotal + tax_amount - discount_amount`, all in
/// the invoice currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub tenant_id: String,
    pub subscription_id: SubscriptionId,
    pub app_id: String,
    pub status: InvoiceStatus,
    pub currency: String,
    pub subtotal: Money,
    pub tax_amount: Money,
    pub discount_amount: Money,
    pub total: Money,
    pub line_items: Vec<LineItem>,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub due_date: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub voided_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub void_reason: String,
    #[serde(default)]
    pub payment_ref: String,
    #[serde(default)]
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A single charge row on an invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub id: LineItemId,
    pub invoice_id: InvoiceId,
    /// Set for usage/overage rows; empty for base fees.
    #[serde(default)]
    pub feature_key: String,
    pub description: String,
    pub quantity: i64,
    pub unit_amount: Money,
    pub amount: Money,
    #[serde(rename = "type")]
    pub item_type: LineItemType,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Filters for listing invoices.
#[derive(Debug, Clone, Default)]
pub struct InvoiceListOpts {
    pub status: Option<InvoiceStatus>,
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
    pub limit: usize,
    pub offset: usize,
}

impl Invoice {
    /// Recomputes `total` from the subtotal, tax, and discount columns.
    pub fn recompute_total(&mut self) {
        self.total = self.subtotal.add(&self.tax_amount).subtract(&self.discount_amount);
    }
}

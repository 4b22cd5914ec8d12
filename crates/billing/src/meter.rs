//! Usage event model for the metering pipeline.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use tally_shared::UsageEventId;

/// One recorded unit (or batch) of feature consumption.
///
/// Events are append-only; the only permitted deletion is purging by age.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: UsageEventId,
    pub tenant_id: String,
    pub app_id: String,
    pub feature_key: String,
    pub quantity: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Non-empty keys deduplicate: re-ingesting the same key is a no-op.
    #[serde(default)]
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Filters for querying raw usage events.
#[derive(Debug, Clone, Default)]
pub struct UsageQueryOpts {
    pub feature_key: Option<String>,
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
    pub limit: usize,
    pub offset: usize,
}

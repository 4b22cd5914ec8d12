//! Entitlement decisions.
//!
//! A [`Decision`] answers "may this tenant consume this feature right
//! now?" together with the numbers that justify the answer. Decisions are
//! cached by the store under `(tenant, app, feature)` with an absolute
//! expiry.

use serde::{Deserialize, Serialize};

/// The outcome of an entitlement check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub feature: String,
    #[serde(default)]
    pub used: i64,
    #[serde(default)]
    pub limit: i64,
    /// Quota left in the window; `-1` when the feature is unlimited.
    #[serde(default)]
    pub remaining: i64,
    #[serde(default)]
    pub soft_limit: bool,
    /// Why the decision came out this way, when not a plain allow.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl Decision {
    /// A denial carrying only a reason, for pre-store short circuits
    /// (missing context, no subscription, unknown plan or feature).
    pub fn deny(feature: &str, reason: &str) -> Decision {
        Decision {
            allowed: false,
            feature: feature.to_string(),
            used: 0,
            limit: 0,
            remaining: 0,
            soft_limit: false,
            reason: reason.to_string(),
        }
    }
}

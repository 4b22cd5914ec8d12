//! Type-prefixed entity identifiers.
//!
//! Every Tally entity is identified by a `prefix_suffix` string such as
//! `plan_018f4c7a9e2f7c1b8d3a5e6f90123456`. The prefix names the entity
//! type; the suffix is a UUIDv7 rendered as 32 lowercase hex characters,
//! so ids of one type sort by creation time (small reorderings inside a
//! sub-millisecond window are possible and acceptable).

use std::fmt;
use std::str::FromStr;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The entity type encoded in an [`Id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Prefix {
    Plan,
    Feature,
    Price,
    Subscription,
    UsageEvent,
    Entitlement,
    Invoice,
    LineItem,
    Coupon,
    Payment,
}

impl Prefix {
    /// The short lowercase tag used in the string form.
    pub const fn as_str(self) -> &'static str {
        match self {
            Prefix::Plan => "plan",
            Prefix::Feature => "feat",
            Prefix::Price => "price",
            Prefix::Subscription => "sub",
            Prefix::UsageEvent => "uevt",
            Prefix::Entitlement => "ent",
            Prefix::Invoice => "inv",
            Prefix::LineItem => "li",
            Prefix::Coupon => "cpn",
            Prefix::Payment => "pay",
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Prefix {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Prefix::Plan),
            "feat" => Ok(Prefix::Feature),
            "price" => Ok(Prefix::Price),
            "sub" => Ok(Prefix::Subscription),
            "uevt" => Ok(Prefix::UsageEvent),
            "ent" => Ok(Prefix::Entitlement),
            "inv" => Ok(Prefix::Invoice),
            "li" => Ok(Prefix::LineItem),
            "cpn" => Ok(Prefix::Coupon),
            "pay" => Ok(Prefix::Payment),
            other => Err(IdError::UnknownPrefix(other.to_string())),
        }
    }
}

/// Errors from parsing id strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("id: empty string")]
    Empty,

    #[error("id: unknown prefix {0:?}")]
    UnknownPrefix(String),

    #[error("id: expected prefix {expected:?}, got {found:?}")]
    PrefixMismatch { expected: &'static str, found: String },

    #[error("id: malformed suffix {0:?}")]
    MalformedSuffix(String),
}

/// A globally unique, type-prefixed, time-sortable identifier.
///
/// The default value is [`Id::NIL`]: its string form is empty and it maps
/// to NULL in database columns, so optional references need no `Option`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Id(Option<(Prefix, Uuid)>);

/// Identifier for plans (prefix `plan`).
pub type PlanId = Id;
/// Identifier for plan features (prefix `feat`).
pub type FeatureId = Id;
/// Identifier for pricing configurations (prefix `price`).
pub type PriceId = Id;
/// Identifier for subscriptions (prefix `sub`).
pub type SubscriptionId = Id;
/// Identifier for usage events (prefix `uevt`).
pub type UsageEventId = Id;
/// Identifier for entitlement records (prefix `ent`).
pub type EntitlementId = Id;
/// Identifier for invoices (prefix `inv`).
pub type InvoiceId = Id;
/// Identifier for invoice line items (prefix `li`).
pub type LineItemId = Id;
/// Identifier for coupons (prefix `cpn`).
pub type CouponId = Id;
/// Identifier for payment records (prefix `pay`).
pub type PaymentId = Id;

impl Id {
    /// The zero-value id.
    pub const NIL: Id = Id(None);

    /// Generates a new globally unique id with the given prefix.
    pub fn new(prefix: Prefix) -> Id {
        Id(Some((prefix, Uuid::now_v7())))
    }

    /// Parses `prefix_suffix`, requiring the prefix to match `expected`.
    /// Cross-type strings (`sub_…` parsed as a plan id) are rejected.
    pub fn parse(s: &str, expected: Prefix) -> Result<Id, IdError> {
        let id = Id::parse_any(s)?;
        let Some(found) = id.prefix() else {
            return Err(IdError::Empty);
        };
        if found != expected {
            return Err(IdError::PrefixMismatch {
                expected: expected.as_str(),
                found: found.as_str().to_string(),
            });
        }
        Ok(id)
    }

    /// Parses `prefix_suffix`, accepting any known prefix.
    pub fn parse_any(s: &str) -> Result<Id, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let (prefix, suffix) = s
            .split_once('_')
            .ok_or_else(|| IdError::MalformedSuffix(s.to_string()))?;
        let prefix = Prefix::from_str(prefix)?;

        if suffix.len() != 32
            || !suffix.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(IdError::MalformedSuffix(suffix.to_string()));
        }
        let uuid =
            Uuid::try_parse(suffix).map_err(|_| IdError::MalformedSuffix(suffix.to_string()))?;

        Ok(Id(Some((prefix, uuid))))
    }

    /// True for the zero value.
    pub fn is_nil(self) -> bool {
        self.0.is_none()
    }

    /// The prefix component, or `None` for the nil id.
    pub fn prefix(self) -> Option<Prefix> {
        self.0.map(|(p, _)| p)
    }

    /// The nullable database representation: NULL for nil.
    pub fn as_nullable(self) -> Option<String> {
        self.0.map(|_| self.to_string())
    }

    /// Restores an id from a nullable database column.
    pub fn from_nullable(value: Option<&str>) -> Result<Id, IdError> {
        match value {
            None | Some("") => Ok(Id::NIL),
            Some(s) => Id::parse_any(s),
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => Ok(()),
            Some((prefix, uuid)) => write!(f, "{}_{}", prefix, uuid.simple()),
        }
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Id::NIL);
        }
        Id::parse_any(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_form_round_trips() {
        let id = Id::new(Prefix::Plan);
        let s = id.to_string();
        assert!(s.starts_with("plan_"));
        assert_eq!(Id::parse(&s, Prefix::Plan).expect("parse"), id);
        assert_eq!(Id::parse_any(&s).expect("parse any"), id);
    }

    #[test]
    fn cross_prefix_parsing_fails() {
        let sub = Id::new(Prefix::Subscription).to_string();
        let err = Id::parse(&sub, Prefix::Plan).expect_err("must reject");
        assert_eq!(
            err,
            IdError::PrefixMismatch { expected: "plan", found: "sub".to_string() }
        );
    }

    #[test]
    fn malformed_strings_fail() {
        assert_eq!(Id::parse_any(""), Err(IdError::Empty));
        assert!(matches!(Id::parse_any("noseparator"), Err(IdError::MalformedSuffix(_))));
        assert!(matches!(Id::parse_any("zzz_0123"), Err(IdError::UnknownPrefix(_))));
        assert!(matches!(Id::parse_any("plan_0123"), Err(IdError::MalformedSuffix(_))));
        // Uppercase hex is not a valid suffix.
        let upper = Id::new(Prefix::Plan).to_string().to_uppercase().replace("PLAN", "plan");
        assert!(matches!(Id::parse_any(&upper), Err(IdError::MalformedSuffix(_))));
    }

    #[test]
    fn nil_round_trips_through_text_and_null() {
        assert_eq!(Id::NIL.to_string(), "");
        assert!(Id::default().is_nil());
        assert_eq!(Id::NIL.as_nullable(), None);
        assert_eq!(Id::from_nullable(None).expect("null"), Id::NIL);
        assert_eq!(Id::from_nullable(Some("")).expect("empty"), Id::NIL);

        let id = Id::new(Prefix::Invoice);
        let col = id.as_nullable();
        assert_eq!(Id::from_nullable(col.as_deref()).expect("parse"), id);
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let first = Id::new(Prefix::UsageEvent);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = Id::new(Prefix::UsageEvent);
        assert!(first.to_string() < second.to_string());
        assert!(first < second);
    }

    #[test]
    fn serde_round_trips() {
        let id = Id::new(Prefix::Coupon);
        let json = serde_json::to_string(&id).expect("encode");
        let back: Id = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, id);

        let nil: Id = serde_json::from_str("\"\"").expect("decode nil");
        assert!(nil.is_nil());
        assert_eq!(serde_json::to_string(&Id::NIL).expect("encode nil"), "\"\"");
    }
}

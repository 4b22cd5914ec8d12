//! Integer-only monetary values.
//!
//! All amounts are in the smallest currency unit (cents, pence, yen) so
//! arithmetic never touches floating point. `usd(4900)` is $49.00.

use std::fmt;

use serde::de::Deserializer;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};

/// A monetary value in the smallest unit of its currency.
///
/// Currency codes are lowercase ISO-4217 ("usd", "eur", "jpy").
/// Arithmetic between two values is only defined when the currencies match;
/// mixing currencies is a data-model violation upstream and panics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Money {
    pub amount: i64,
    pub currency: String,
}

/// Money in US dollars (cents).
pub fn usd(cents: i64) -> Money {
    Money { amount: cents, currency: "usd".into() }
}

/// Money in euros (cents).
pub fn eur(cents: i64) -> Money {
    Money { amount: cents, currency: "eur".into() }
}

/// Money in British pounds (pence).
pub fn gbp(pence: i64) -> Money {
    Money { amount: pence, currency: "gbp".into() }
}

/// Money in Japanese yen (no decimal).
pub fn jpy(yen: i64) -> Money {
    Money { amount: yen, currency: "jpy".into() }
}

/// Money in Canadian dollars (cents).
pub fn cad(cents: i64) -> Money {
    Money { amount: cents, currency: "cad".into() }
}

/// Money in Australian dollars (cents).
pub fn aud(cents: i64) -> Money {
    Money { amount: cents, currency: "aud".into() }
}

impl Money {
    /// Creates a value in an arbitrary currency. The code is lowercased.
    pub fn new(amount: i64, currency: &str) -> Money {
        Money { amount, currency: currency.to_lowercase() }
    }

    /// A zero value in the given currency.
    pub fn zero(currency: &str) -> Money {
        Money::new(0, currency)
    }

    /// Sums an iterator of values. All must share one currency.
    /// An empty iterator sums to zero USD.
    pub fn sum<I: IntoIterator<Item = Money>>(values: I) -> Money {
        let mut iter = values.into_iter();
        let Some(first) = iter.next() else {
            return Money::zero("usd");
        };
        iter.fold(first, |acc, v| acc.add(&v))
    }

    // Arithmetic

    /// Adds two values. Panics if currencies differ.
    pub fn add(&self, other: &Money) -> Money {
        self.assert_same_currency(other);
        Money { amount: self.amount + other.amount, currency: self.currency.clone() }
    }

    /// Subtracts another value. Panics if currencies differ.
    pub fn subtract(&self, other: &Money) -> Money {
        self.assert_same_currency(other);
        Money { amount: self.amount - other.amount, currency: self.currency.clone() }
    }

    /// Multiplies by a quantity.
    pub fn multiply(&self, qty: i64) -> Money {
        Money { amount: self.amount * qty, currency: self.currency.clone() }
    }

    /// Divides by a divisor, truncating toward zero. Panics on zero.
    pub fn divide(&self, divisor: i64) -> Money {
        if divisor == 0 {
            panic!("money: division by zero");
        }
        Money { amount: self.amount / divisor, currency: self.currency.clone() }
    }

    /// The negated value.
    pub fn negate(&self) -> Money {
        Money { amount: -self.amount, currency: self.currency.clone() }
    }

    /// The absolute value.
    pub fn abs(&self) -> Money {
        Money { amount: self.amount.abs(), currency: self.currency.clone() }
    }

    // Comparisons

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }

    pub fn is_positive(&self) -> bool {
        self.amount > 0
    }

    pub fn is_negative(&self) -> bool {
        self.amount < 0
    }

    /// True when this value is strictly less. Panics if currencies differ.
    pub fn less_than(&self, other: &Money) -> bool {
        self.assert_same_currency(other);
        self.amount < other.amount
    }

    /// True when this value is strictly greater. Panics if currencies differ.
    pub fn greater_than(&self, other: &Money) -> bool {
        self.assert_same_currency(other);
        self.amount > other.amount
    }

    /// The smaller of two values. Panics if currencies differ.
    pub fn min(&self, other: &Money) -> Money {
        self.assert_same_currency(other);
        if self.amount < other.amount { self.clone() } else { other.clone() }
    }

    /// The larger of two values. Panics if currencies differ.
    pub fn max(&self, other: &Money) -> Money {
        self.assert_same_currency(other);
        if self.amount > other.amount { self.clone() } else { other.clone() }
    }

    // Formatting

    /// The major-unit string without a symbol: `usd(4900)` → "49.00",
    /// `jpy(100)` → "100".
    pub fn format_major(&self) -> String {
        let decimals = currency_decimals(&self.currency);
        if decimals == 0 {
            return self.amount.to_string();
        }

        let divisor = 10_u64.pow(decimals);
        let abs = self.amount.unsigned_abs();
        let sign = if self.amount < 0 { "-" } else { "" };
        format!(
            "{sign}{}.{:0width$}",
            abs / divisor,
            abs % divisor,
            width = decimals as usize
        )
    }

    fn assert_same_currency(&self, other: &Money) {
        if self.currency != other.currency {
            panic!("money: currency mismatch: {} != {}", self.currency, other.currency);
        }
    }
}

impl fmt::Display for Money {
    /// Renders with a currency symbol: "$49.00", "€199.00", "¥100".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", currency_symbol(&self.currency), self.format_major())
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Money", 3)?;
        s.serialize_field("amount", &self.amount)?;
        s.serialize_field("currency", &self.currency)?;
        s.serialize_field("display", &self.to_string())?;
        s.end()
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // The display field is advisory and ignored on decode.
        #[derive(Deserialize)]
        struct Repr {
            amount: i64,
            currency: String,
        }

        let repr = Repr::deserialize(deserializer)?;
        Ok(Money { amount: repr.amount, currency: repr.currency.to_lowercase() })
    }
}

fn currency_symbol(currency: &str) -> String {
    match currency {
        "usd" => "$".into(),
        "eur" => "\u{20ac}".into(),
        "gbp" => "\u{a3}".into(),
        "jpy" | "cny" => "\u{a5}".into(),
        "cad" => "C$".into(),
        "aud" => "A$".into(),
        "chf" => "CHF ".into(),
        "sek" => "kr ".into(),
        "nzd" => "NZ$".into(),
        other => format!("{} ", other.to_uppercase()),
    }
}

fn currency_decimals(currency: &str) -> u32 {
    match currency {
        // Zero-decimal currencies; everything else uses two places.
        "jpy" | "krw" | "vnd" | "clp" | "pyg" | "idr" => 0,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_subtract_are_inverse() {
        let a = usd(4900);
        let b = usd(151);
        assert_eq!(a.add(&b).subtract(&b), a);
    }

    #[test]
    fn add_is_commutative_with_zero_identity() {
        let a = usd(4900);
        let b = usd(100);
        assert_eq!(a.add(&b), b.add(&a));
        assert_eq!(a.add(&Money::zero("usd")), a);
    }

    #[test]
    fn multiply_then_divide_truncates() {
        let a = usd(1001);
        let k = 3;
        let round_tripped = a.multiply(k).divide(k);
        assert_eq!(round_tripped.currency, "usd");
        assert_eq!(round_tripped.amount, 1001);

        // Truncation loses at most the remainder.
        assert_eq!(usd(10).divide(3).amount, 3);
        assert_eq!(usd(-10).divide(3).amount, -3);
    }

    #[test]
    #[should_panic(expected = "currency mismatch")]
    fn add_panics_across_currencies() {
        let _ = usd(100).add(&eur(100));
    }

    #[test]
    #[should_panic(expected = "division by zero")]
    fn divide_by_zero_panics() {
        let _ = usd(100).divide(0);
    }

    #[test]
    fn equality_across_currencies_is_false_not_a_panic() {
        assert_ne!(usd(100), eur(100));
        assert_eq!(usd(100), usd(100));
    }

    #[test]
    fn min_max_and_sign_checks() {
        assert_eq!(usd(100).min(&usd(200)), usd(100));
        assert_eq!(usd(100).max(&usd(200)), usd(200));
        assert!(usd(100).less_than(&usd(200)));
        assert!(usd(200).greater_than(&usd(100)));
        assert!(Money::zero("eur").is_zero());
        assert!(usd(1).is_positive());
        assert!(usd(-1).is_negative());
        assert_eq!(usd(-1).abs(), usd(1));
        assert_eq!(usd(1).negate(), usd(-1));
    }

    #[test]
    fn formats_major_units() {
        assert_eq!(usd(4900).format_major(), "49.00");
        assert_eq!(usd(4905).format_major(), "49.05");
        assert_eq!(usd(-4905).format_major(), "-49.05");
        assert_eq!(jpy(100).format_major(), "100");
        assert_eq!(usd(5).format_major(), "0.05");
    }

    #[test]
    fn formats_with_symbol() {
        assert_eq!(usd(4900).to_string(), "$49.00");
        assert_eq!(eur(19900).to_string(), "\u{20ac}199.00");
        assert_eq!(jpy(100).to_string(), "\u{a5}100");
        assert_eq!(Money::new(500, "SEK").to_string(), "kr 5.00");
        assert_eq!(Money::new(500, "xyz").to_string(), "XYZ 5.00");
    }

    #[test]
    fn sum_of_empty_is_zero_usd() {
        assert_eq!(Money::sum(Vec::new()), Money::zero("usd"));
        assert_eq!(Money::sum(vec![eur(10), eur(20), eur(30)]), eur(60));
    }

    #[test]
    fn json_round_trips_amount_and_currency() {
        let m = usd(4900);
        let encoded = serde_json::to_value(&m).expect("encode");
        assert_eq!(encoded["amount"], 4900);
        assert_eq!(encoded["currency"], "usd");
        assert_eq!(encoded["display"], "$49.00");

        let decoded: Money = serde_json::from_value(encoded).expect("decode");
        assert_eq!(decoded, m);

        // A stale display string never wins over amount + currency.
        let stale: Money =
            serde_json::from_str(r#"{"amount":100,"currency":"usd","display":"$9.99"}"#)
                .expect("decode");
        assert_eq!(stale, usd(100));
    }
}

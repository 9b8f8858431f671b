//! Fixed-point money handling.
//!
//! Amounts travel through the API as [`Decimal`] (serialized as strings) and
//! are stored in SQLite as INTEGER cents so that balance updates can be done
//! with a single atomic `SET x = x - ?` without floating-point drift.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

use crate::error::{PosError, Result};

/// Convert a decimal amount to integer cents.
///
/// Rejects amounts with more than two fractional digits instead of rounding
/// them silently.
pub fn to_cents(amount: Decimal) -> Result<i64> {
    let normalized = amount.normalize();
    if normalized.scale() > 2 {
        return Err(PosError::validation(format!(
            "Amount {amount} has more than two decimal places"
        )));
    }
    (normalized * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| PosError::validation(format!("Amount {amount} is out of range")))
}

/// Convert stored cents back to a two-decimal amount.
pub fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// Parse an amount from a JSON value that may be a string or a number.
///
/// Numbers are re-parsed from their textual form so `12.1` stays exactly
/// `12.10` rather than passing through `f64`.
pub fn parse_amount(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

/// Unit price times quantity, in cents, with overflow checking.
pub fn line_total_cents(unit_cents: i64, quantity: i64) -> Result<i64> {
    unit_cents
        .checked_mul(quantity)
        .ok_or_else(|| PosError::validation("Order total is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cents_conversion_is_exact() {
        assert_eq!(to_cents(Decimal::new(5000, 2)).unwrap(), 5000);
        assert_eq!(to_cents(Decimal::from(500)).unwrap(), 50_000);
        assert_eq!(to_cents(Decimal::new(1210, 3)).unwrap(), 121);
        assert_eq!(from_cents(40_000), Decimal::from(400));
    }

    #[test]
    fn rejects_sub_cent_amounts() {
        let err = to_cents(Decimal::new(12345, 3)).unwrap_err();
        assert!(matches!(err, PosError::Validation(_)));
    }

    #[test]
    fn parses_numbers_without_float_drift() {
        let v: Value = serde_json::from_str("0.1").unwrap();
        assert_eq!(parse_amount(&v), Some(Decimal::new(1, 1)));
        assert_eq!(
            parse_amount(&Value::String(" 19.99 ".into())),
            Some(Decimal::new(1999, 2))
        );
        assert_eq!(parse_amount(&Value::Bool(true)), None);
    }

    #[test]
    fn line_total_checks_overflow() {
        assert_eq!(line_total_cents(5000, 2).unwrap(), 10_000);
        assert!(line_total_cents(i64::MAX, 2).is_err());
    }
}

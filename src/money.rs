//! Fixed-point price arithmetic: everything is quantized to two fractional
//! digits, truncated toward zero, at explicit round points.

use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;
use std::str::FromStr;

/// Truncate `value` to two fractional digits, rounding toward zero.
pub fn quantize2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::ToZero)
}

/// Parse any JSON-ish scalar (number or numeric string) into a `Decimal`.
/// Returns `None` on anything that doesn't parse, matching the original's
/// "never throw, just reject" parsing style.
pub fn parse_decimal(value: Option<&Value>) -> Option<Decimal> {
    let value = value?;
    match value {
        Value::Null => None,
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

pub fn format_price(value: Decimal) -> String {
    quantize2(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quantize_truncates_toward_zero() {
        assert_eq!(quantize2(dec!(1.239)), dec!(1.23));
        assert_eq!(quantize2(dec!(-1.239)), dec!(-1.23));
    }

    #[test]
    fn parse_decimal_rejects_garbage() {
        assert_eq!(parse_decimal(Some(&Value::String("abc".into()))), None);
        assert_eq!(
            parse_decimal(Some(&Value::String("1.50".into()))),
            Some(dec!(1.50))
        );
    }
}

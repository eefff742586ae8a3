use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Stored amounts use 1/1000-unit precision.
const SCALE: u32 = 3;

/// Converts a decimal monetary amount into signed miliunits. Exact for
/// inputs with at most three fractional digits; anything finer is rounded
/// half away from zero. Returns `None` when the scaled value overflows i64.
pub fn to_miliunits(amount: Decimal) -> Option<i64> {
    amount
        .checked_mul(Decimal::new(1000, 0))?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

pub fn from_miliunits(units: i64) -> Decimal {
    Decimal::new(units, SCALE)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn round_trips_amounts_with_three_fractional_digits() {
        for raw in ["0", "1", "-1", "12.34", "-12.34", "0.001", "-0.001", "1999.999"] {
            let amount = Decimal::from_str(raw).unwrap();
            let units = to_miliunits(amount).unwrap();
            assert_eq!(
                to_miliunits(from_miliunits(units)).unwrap(),
                units,
                "{raw} did not survive the round trip"
            );
            assert_eq!(from_miliunits(units), amount);
        }
    }

    #[test]
    fn expense_sign_is_preserved() {
        let units = to_miliunits(Decimal::from_str("-42.50").unwrap()).unwrap();
        assert_eq!(units, -42_500);
        assert!(units < 0);
    }

    #[test]
    fn income_sign_is_preserved() {
        assert_eq!(to_miliunits(Decimal::from_str("1250.75").unwrap()), Some(1_250_750));
    }

    #[test]
    fn sub_miliunit_precision_rounds_half_away_from_zero() {
        assert_eq!(to_miliunits(Decimal::from_str("0.0005").unwrap()), Some(1));
        assert_eq!(to_miliunits(Decimal::from_str("-0.0005").unwrap()), Some(-1));
        assert_eq!(to_miliunits(Decimal::from_str("0.0004").unwrap()), Some(0));
    }

    #[test]
    fn overflow_is_reported() {
        assert_eq!(to_miliunits(Decimal::MAX), None);
    }
}

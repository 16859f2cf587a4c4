//! Fixed-point helpers
//!
//! Every persisted price, quantity, balance and commission carries exactly
//! eight fractional digits. Products are truncated toward zero, never rounded
//! up, so a computed debit can not exceed what the inputs imply.

use crate::error::ExchangeError;
use rust_decimal::{Decimal, RoundingStrategy};

/// Number of fractional digits kept for money and quantities.
pub const SCALE: u32 = 8;

/// Truncates `value` to [`SCALE`] digits and pads it to exactly that scale.
pub fn scaled(value: Decimal) -> Decimal {
    let mut value = value.round_dp_with_strategy(SCALE, RoundingStrategy::ToZero);
    value.rescale(SCALE);
    value
}

/// `a * b` at eight digits.
pub fn product(a: Decimal, b: Decimal) -> Result<Decimal, ExchangeError> {
    a.checked_mul(b)
        .map(scaled)
        .ok_or_else(|| ExchangeError::InvalidInput(format!("{} * {} overflows", a, b)))
}

/// True when `value` needs no more than [`SCALE`] fractional digits.
pub fn fits_scale(value: Decimal) -> bool {
    value.normalize().scale() <= SCALE
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn products_truncate_toward_zero() {
        assert_eq!(product(dec!(0.33333333), dec!(0.5)).unwrap(), dec!(0.16666666));
        assert_eq!(product(dec!(5000), dec!(0.015)).unwrap().to_string(), "75.00000000");
    }

    #[test]
    fn scale_limit() {
        assert!(fits_scale(dec!(0.00000001)));
        assert!(fits_scale(dec!(1.100000000000)));
        assert!(!fits_scale(dec!(0.000000001)));
    }
}

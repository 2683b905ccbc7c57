//! Money calculation utilities using rust_decimal for precision
//!
//! All calculations are done using `Decimal` internally, then converted to `f64`
//! for storage/serialization. Every intermediate amount is rounded to 2 decimal
//! places, half away from zero.

use rust_decimal::prelude::*;

/// Rounding for monetary values (2 decimal places, half away from zero)
const DECIMAL_PLACES: u32 = 2;

/// Tolerance for monetary comparisons (0.01)
pub const MONEY_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Maximum allowed quantity per line
pub const MAX_QUANTITY: u32 = 9999;

/// Maximum allowed bonus amount per payment
pub const MAX_BONUS_AMOUNT: f64 = 1_000_000.0;

/// Convert f64 to Decimal for calculation
#[inline]
pub fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default()
}

/// Convert Decimal back to f64 for storage, rounded to 2 decimal places
#[inline]
pub fn to_f64(value: Decimal) -> f64 {
    round2(value).to_f64().unwrap_or_default()
}

/// Round to 2 decimal places, half away from zero
#[inline]
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero)
}

/// `amount × percent / 100`, rounded
#[inline]
pub fn percent_of(amount: Decimal, percent: Decimal) -> Decimal {
    round2(amount * percent / Decimal::ONE_HUNDRED)
}

/// Check two monetary values are equal within [`MONEY_TOLERANCE`]
#[inline]
pub fn money_eq(a: f64, b: f64) -> bool {
    (to_decimal(a) - to_decimal(b)).abs() < MONEY_TOLERANCE
}

/// Validate a requested bonus amount (finite, non-negative, bounded)
pub fn validate_bonus(requested: f64) -> Result<Decimal, String> {
    if !requested.is_finite() {
        return Err(format!("bonus must be a finite number, got {}", requested));
    }
    if requested < 0.0 {
        return Err(format!("bonus must be non-negative, got {}", requested));
    }
    if requested > MAX_BONUS_AMOUNT {
        return Err(format!(
            "bonus exceeds maximum allowed ({}), got {}",
            MAX_BONUS_AMOUNT, requested
        ));
    }
    Ok(round2(to_decimal(requested)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_half_away_from_zero() {
        assert_eq!(to_f64(Decimal::new(1005, 3)), 1.01);
        assert_eq!(to_f64(Decimal::new(-1005, 3)), -1.01);
        assert_eq!(to_f64(Decimal::new(1004, 3)), 1.0);
    }

    #[test]
    fn test_float_noise_is_absorbed() {
        // 0.1 + 0.2 = 0.30000000000000004 in f64
        let sum = to_decimal(0.1) + to_decimal(0.2);
        assert_eq!(to_f64(sum), 0.3);
        assert!(money_eq(0.1 + 0.2, 0.3));
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(Decimal::from(45), Decimal::from(10)), Decimal::new(450, 2));
        assert_eq!(
            percent_of(to_decimal(33.33), Decimal::from(15)),
            Decimal::new(500, 2)
        );
    }

    #[test]
    fn test_validate_bonus() {
        assert!(validate_bonus(f64::NAN).is_err());
        assert!(validate_bonus(-1.0).is_err());
        assert!(validate_bonus(MAX_BONUS_AMOUNT + 1.0).is_err());
        assert_eq!(validate_bonus(12.345).unwrap(), Decimal::new(1235, 2));
    }
}

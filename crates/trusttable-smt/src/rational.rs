//! Exact numbers for terms and models.
//!
//! Literals and model values are arbitrary-precision rationals, so table
//! values of any magnitude reach the solver unchanged.

use num::bigint::BigInt;
use num::rational::BigRational;
use num::traits::{self, One, Signed, ToPrimitive, Zero};

pub type Rational = BigRational;

pub fn from_i64(n: i64) -> Rational {
    Rational::from_integer(BigInt::from(n))
}

/// Convert a finite float through its shortest decimal representation,
/// so `0.1` becomes exactly `1/10`.
pub fn from_f64(value: f64) -> Option<Rational> {
    if !value.is_finite() {
        return None;
    }
    parse_decimal(&value.to_string())
}

/// Parse `-12`, `3.25` or `60.0`. Exponents are not accepted.
pub fn parse_decimal(text: &str) -> Option<Rational> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    let joined = format!("{whole}{frac}");
    let numer = BigInt::parse_bytes(joined.as_bytes(), 10)?;
    let denom = power_of_ten(frac.len());
    let value = Rational::new(numer, denom);
    Some(if negative { -value } else { value })
}

fn power_of_ten(exponent: usize) -> BigInt {
    traits::pow(BigInt::from(10u32), exponent)
}

pub fn to_f64(value: &Rational) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

/// The value as an `i64` when it is a whole number in range.
pub fn to_i64(value: &Rational) -> Option<i64> {
    if value.is_integer() {
        value.numer().to_i64()
    } else {
        None
    }
}

/// Exact decimal when the expansion terminates, otherwise `num/den`.
pub fn to_decimal_string(value: &Rational) -> String {
    if value.is_integer() {
        return value.numer().to_string();
    }
    let two = BigInt::from(2u32);
    let five = BigInt::from(5u32);
    let mut rest = value.denom().clone();
    let (mut twos, mut fives) = (0usize, 0usize);
    while (&rest % &two).is_zero() {
        rest /= &two;
        twos += 1;
    }
    while (&rest % &five).is_zero() {
        rest /= &five;
        fives += 1;
    }
    if !rest.is_one() {
        return format!("{}/{}", value.numer(), value.denom());
    }

    let places = twos.max(fives);
    let scaled = value * Rational::from_integer(power_of_ten(places));
    let digits = scaled.numer().abs().to_string();
    let digits = format!("{digits:0>width$}", width = places + 1);
    let (whole, frac) = digits.split_at(digits.len() - places);
    let sign = if value.is_negative() { "-" } else { "" };
    format!("{sign}{whole}.{}", frac.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ratio(n: i64, d: i64) -> Rational {
        Rational::new(BigInt::from(n), BigInt::from(d))
    }

    #[test]
    fn floats_convert_through_their_decimal_form() {
        assert_eq!(from_f64(0.1), Some(ratio(1, 10)));
        assert_eq!(from_f64(-33.33), Some(ratio(-3333, 100)));
        assert_eq!(from_f64(60.0), Some(from_i64(60)));
        assert_eq!(from_f64(f64::NAN), None);
    }

    #[test]
    fn large_values_stay_exact() {
        let big = from_f64(1e30).unwrap();
        let product = &big * &big;
        assert_eq!(product.numer().to_string().len(), 61);
        assert_eq!(&product / &big, big);
    }

    #[test]
    fn whole_numbers_convert_to_i64() {
        assert_eq!(to_i64(&from_i64(-42)), Some(-42));
        assert_eq!(to_i64(&ratio(1, 2)), None);
        assert_eq!(to_i64(&from_f64(1e30).unwrap()), None);
    }

    #[test]
    fn decimals_render_exactly_when_they_terminate() {
        assert_eq!(to_decimal_string(&ratio(121, 2)), "60.5");
        assert_eq!(to_decimal_string(&ratio(-1, 8)), "-0.125");
        assert_eq!(to_decimal_string(&from_i64(-3)), "-3");
        assert_eq!(to_decimal_string(&ratio(100, 3)), "100/3");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse_decimal("121.0"), Some(from_i64(121)));
        assert_eq!(parse_decimal(".5"), Some(ratio(1, 2)));
        assert_eq!(parse_decimal("1e3"), None);
        assert_eq!(parse_decimal("-"), None);
        assert_eq!(parse_decimal(""), None);
    }
}

// src/fixed_point.rs
//
// Signed fixed-point decimal on top of 256-bit scaled integers. Raw token balances
// routinely exceed 2^53, so all money-like ratios (profits, pool invariants, yields)
// go through this type instead of f64.

use ethers::types::{U256, U512};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Number of fractional decimal digits carried by every [`FixedPointDecimal`].
pub const SCALE_DECIMALS: u32 = 18;

/// 10^18 as a const `U256` (fits in the lowest limb).
const SCALE: U256 = U256([1_000_000_000_000_000_000, 0, 0, 0]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecimalError {
    #[error("fixed-point overflow")]
    Overflow,
    #[error("division by zero")]
    DivisionByZero,
    #[error("square root of negative value {0}")]
    NegativeSqrt(String),
    #[error("cannot represent negative value {0} as unsigned units")]
    NegativeUnits(String),
    #[error("invalid decimal literal: {0}")]
    Parse(String),
}

/// Exact signed decimal with 18 fractional digits.
///
/// Stored as sign + magnitude where `magnitude = |value| * 10^18`. Multiplication and
/// division widen to `U512` before rescaling, so intermediate products of two
/// full-size balances never overflow. Results are truncated toward zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FixedPointDecimal {
    negative: bool,
    magnitude: U256,
}

impl FixedPointDecimal {
    pub const ZERO: Self = Self {
        negative: false,
        magnitude: U256([0, 0, 0, 0]),
    };

    pub const ONE: Self = Self {
        negative: false,
        magnitude: SCALE,
    };

    fn from_parts(negative: bool, magnitude: U256) -> Self {
        Self {
            negative: negative && !magnitude.is_zero(),
            magnitude,
        }
    }

    pub fn from_integer(value: i64) -> Self {
        let magnitude = U256::from(value.unsigned_abs()) * SCALE;
        Self::from_parts(value < 0, magnitude)
    }

    /// Converts a raw on-chain amount with `decimals` fractional digits, e.g.
    /// `(1_500_000, 6)` becomes `1.5`. Digits beyond 18 decimals are truncated.
    pub fn from_units(raw: U256, decimals: u8) -> Result<Self, DecimalError> {
        let decimals = u32::from(decimals);
        let magnitude = if decimals <= SCALE_DECIMALS {
            raw.checked_mul(pow10(SCALE_DECIMALS - decimals)?)
                .ok_or(DecimalError::Overflow)?
        } else {
            raw / pow10(decimals - SCALE_DECIMALS)?
        };
        Ok(Self::from_parts(false, magnitude))
    }

    /// Inverse of [`from_units`](Self::from_units); fails for negative values.
    pub fn to_units(&self, decimals: u8) -> Result<U256, DecimalError> {
        if self.negative {
            return Err(DecimalError::NegativeUnits(self.to_string()));
        }
        let decimals = u32::from(decimals);
        if decimals <= SCALE_DECIMALS {
            Ok(self.magnitude / pow10(SCALE_DECIMALS - decimals)?)
        } else {
            self.magnitude
                .checked_mul(pow10(decimals - SCALE_DECIMALS)?)
                .ok_or(DecimalError::Overflow)
        }
    }

    pub fn is_zero(&self) -> bool {
        self.magnitude.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn abs(&self) -> Self {
        Self::from_parts(false, self.magnitude)
    }

    pub fn checked_add(&self, other: &Self) -> Result<Self, DecimalError> {
        if self.negative == other.negative {
            let magnitude = self
                .magnitude
                .checked_add(other.magnitude)
                .ok_or(DecimalError::Overflow)?;
            return Ok(Self::from_parts(self.negative, magnitude));
        }
        // Opposite signs: the larger magnitude wins the sign.
        if self.magnitude >= other.magnitude {
            Ok(Self::from_parts(
                self.negative,
                self.magnitude - other.magnitude,
            ))
        } else {
            Ok(Self::from_parts(
                other.negative,
                other.magnitude - self.magnitude,
            ))
        }
    }

    pub fn checked_sub(&self, other: &Self) -> Result<Self, DecimalError> {
        self.checked_add(&-*other)
    }

    pub fn checked_mul(&self, other: &Self) -> Result<Self, DecimalError> {
        let wide = self.magnitude.full_mul(other.magnitude) / U512::from(SCALE);
        let magnitude = U256::try_from(wide).map_err(|_| DecimalError::Overflow)?;
        Ok(Self::from_parts(self.negative != other.negative, magnitude))
    }

    pub fn checked_div(&self, other: &Self) -> Result<Self, DecimalError> {
        if other.is_zero() {
            return Err(DecimalError::DivisionByZero);
        }
        let wide = self.magnitude.full_mul(SCALE) / U512::from(other.magnitude);
        let magnitude = U256::try_from(wide).map_err(|_| DecimalError::Overflow)?;
        Ok(Self::from_parts(self.negative != other.negative, magnitude))
    }

    /// Floor square root, exact to the last fractional digit.
    pub fn sqrt(&self) -> Result<Self, DecimalError> {
        if self.negative {
            return Err(DecimalError::NegativeSqrt(self.to_string()));
        }
        // sqrt(m / 1e18) * 1e18 == sqrt(m * 1e18)
        let root = self.magnitude.full_mul(SCALE).integer_sqrt();
        let magnitude = U256::try_from(root).map_err(|_| DecimalError::Overflow)?;
        Ok(Self::from_parts(false, magnitude))
    }

    /// Sums an iterator, failing on the first overflow.
    pub fn checked_sum<'a, I>(values: I) -> Result<Self, DecimalError>
    where
        I: IntoIterator<Item = &'a Self>,
    {
        values
            .into_iter()
            .try_fold(Self::ZERO, |acc, value| acc.checked_add(value))
    }

    /// `|self - other| <= tolerance`
    pub fn approx_eq(&self, other: &Self, tolerance: &Self) -> bool {
        match self.checked_sub(other) {
            Ok(diff) => diff.abs() <= tolerance.abs(),
            Err(_) => false,
        }
    }

    /// Lossy conversion for presentation-only math (e.g. compounding with a
    /// fractional exponent).
    pub fn to_f64(&self) -> f64 {
        self.to_string().parse().unwrap_or_default()
    }

    pub fn to_decimal(&self) -> Result<rust_decimal::Decimal, DecimalError> {
        rust_decimal::Decimal::from_str(&self.to_string()).map_err(|_| DecimalError::Overflow)
    }
}

fn pow10(exponent: u32) -> Result<U256, DecimalError> {
    if exponent > 77 {
        return Err(DecimalError::Overflow);
    }
    Ok(U256::exp10(exponent as usize))
}

impl std::ops::Neg for FixedPointDecimal {
    type Output = Self;

    fn neg(self) -> Self {
        Self::from_parts(!self.negative, self.magnitude)
    }
}

impl Ord for FixedPointDecimal {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.negative, other.negative) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, false) => self.magnitude.cmp(&other.magnitude),
            (true, true) => other.magnitude.cmp(&self.magnitude),
        }
    }
}

impl PartialOrd for FixedPointDecimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<U256> for FixedPointDecimal {
    /// Treats the value as a whole number (0 decimals). Saturates on overflow.
    fn from(value: U256) -> Self {
        let magnitude = value.checked_mul(SCALE).unwrap_or(U256::MAX);
        Self::from_parts(false, magnitude)
    }
}

impl fmt::Display for FixedPointDecimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let integer = self.magnitude / SCALE;
        let fraction = self.magnitude % SCALE;
        if self.negative {
            write!(f, "-")?;
        }
        write!(f, "{}", integer)?;
        if !fraction.is_zero() {
            let digits = fraction.to_string();
            let padded = format!(
                "{}{}",
                "0".repeat(SCALE_DECIMALS as usize - digits.len()),
                digits
            );
            write!(f, ".{}", padded.trim_end_matches('0'))?;
        }
        Ok(())
    }
}

impl fmt::Debug for FixedPointDecimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedPointDecimal({})", self)
    }
}

impl FromStr for FixedPointDecimal {
    type Err = DecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (integer, fraction) = body.split_once('.').unwrap_or((body, ""));

        let is_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
        if (integer.is_empty() && fraction.is_empty()) || !is_digits(integer) || !is_digits(fraction)
        {
            return Err(DecimalError::Parse(s.to_string()));
        }

        let integer = if integer.is_empty() {
            U256::zero()
        } else {
            U256::from_dec_str(integer).map_err(|_| DecimalError::Parse(s.to_string()))?
        };
        let mut fraction: String = fraction.chars().take(SCALE_DECIMALS as usize).collect();
        while fraction.len() < SCALE_DECIMALS as usize {
            fraction.push('0');
        }
        let fraction =
            U256::from_dec_str(&fraction).map_err(|_| DecimalError::Parse(s.to_string()))?;

        let magnitude = integer
            .checked_mul(SCALE)
            .and_then(|scaled| scaled.checked_add(fraction))
            .ok_or(DecimalError::Overflow)?;
        Ok(Self::from_parts(negative, magnitude))
    }
}

impl Serialize for FixedPointDecimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FixedPointDecimal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

//! Exact rational helpers shared by pricing, evaluation and caching.
//!
//! Amounts on the ledger are 256-bit unsigned integers while every price and
//! fee computation runs on arbitrary-precision rationals. These helpers are
//! the only place the two representations meet.

use alloy::primitives::U256;
use num::bigint::Sign;
use num::{BigInt, BigRational, Signed, ToPrimitive};
use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RationalError {
	#[error("Invalid decimal '{0}': {1}")]
	InvalidDecimal(String, String),
	#[error("Value is not finite")]
	NotFinite,
}

/// Lifts a ledger amount into an exact rational.
pub fn rat_from_u256(value: U256) -> BigRational {
	BigRational::from_integer(BigInt::from_bytes_be(
		Sign::Plus,
		&value.to_be_bytes::<32>(),
	))
}

/// Truncates a rational toward zero and clamps it into the U256 range.
///
/// Negative values map to zero and values wider than 256 bits saturate.
pub fn rat_to_u256(value: &BigRational) -> U256 {
	if value.is_negative() {
		return U256::ZERO;
	}
	let (_, bytes) = value.to_integer().to_bytes_be();
	if bytes.len() > 32 {
		return U256::MAX;
	}
	U256::from_be_slice(&bytes)
}

pub fn rat_from_int(value: i64) -> BigRational {
	BigRational::from_integer(BigInt::from(value))
}

/// Parses a decimal literal such as `"0.85"` into an exact rational.
pub fn parse_decimal(input: &str) -> Result<BigRational, RationalError> {
	let decimal = Decimal::from_str(input.trim())
		.map_err(|e| RationalError::InvalidDecimal(input.to_string(), e.to_string()))?;
	Ok(decimal_to_rat(&decimal))
}

pub fn decimal_to_rat(decimal: &Decimal) -> BigRational {
	let numer = BigInt::from(decimal.mantissa());
	let denom = num::pow(BigInt::from(10), decimal.scale() as usize);
	BigRational::new(numer, denom)
}

/// Approximates the n-th root of a positive rational.
///
/// The root goes through `f64` and is converted back to an exact binary
/// fraction, so everything computed from the result stays exact.
pub fn nth_root(value: &BigRational, n: usize) -> Result<BigRational, RationalError> {
	let float = value.to_f64().ok_or(RationalError::NotFinite)?;
	if !float.is_finite() || n == 0 {
		return Err(RationalError::NotFinite);
	}
	let root = float.powf(1.0 / n as f64);
	BigRational::from_float(root).ok_or(RationalError::NotFinite)
}

pub fn min_rat(a: &BigRational, b: &BigRational) -> BigRational {
	if a <= b {
		a.clone()
	} else {
		b.clone()
	}
}

/// Integer ratio used for 10^decimals scaling.
pub fn pow10(exp: u32) -> BigRational {
	BigRational::from_integer(num::pow(BigInt::from(10), exp as usize))
}

/// Serde adapter storing a rational as its `numer/denom` string.
pub mod serde_rational {
	use num::BigRational;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(value: &BigRational, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&value.to_string())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<BigRational, D::Error>
	where
		D: Deserializer<'de>,
	{
		let raw = String::deserialize(deserializer)?;
		raw.parse::<BigRational>()
			.map_err(|e| serde::de::Error::custom(format!("invalid rational '{}': {}", raw, e)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_u256_conversion_floors() {
		let value = BigRational::new(BigInt::from(7), BigInt::from(2));
		assert_eq!(rat_to_u256(&value), U256::from(3u64));
		assert_eq!(rat_to_u256(&-value), U256::ZERO);
		assert_eq!(rat_from_u256(U256::from(42u64)), rat_from_int(42));
	}

	#[test]
	fn test_parse_decimal() {
		let parsed = parse_decimal("0.25").unwrap();
		assert_eq!(parsed, BigRational::new(BigInt::from(1), BigInt::from(4)));
		assert!(parse_decimal("abc").is_err());
	}

	#[test]
	fn test_nth_root() {
		let root = nth_root(&rat_from_int(16), 2).unwrap();
		assert_eq!(root, rat_from_int(4));
		assert!(nth_root(&rat_from_int(16), 0).is_err());
	}

	#[test]
	fn test_serde_rational_roundtrip_preserves_fraction() {
		#[derive(serde::Serialize, serde::Deserialize)]
		struct Wrapper {
			#[serde(with = "serde_rational")]
			value: BigRational,
		}

		let json = serde_json::to_string(&Wrapper {
			value: BigRational::new(BigInt::from(1), BigInt::from(3)),
		})
		.unwrap();
		assert_eq!(json, r#"{"value":"1/3"}"#);
		let back: Wrapper = serde_json::from_str(&json).unwrap();
		assert_eq!(back.value, BigRational::new(BigInt::from(1), BigInt::from(3)));
	}
}

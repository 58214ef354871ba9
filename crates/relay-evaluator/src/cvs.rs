//! Pricing sanity checks on integer amounts.

use crate::EvaluatorError;
use num::{BigInt, One, Signed, ToPrimitive, Zero};
use relay_types::{rat_from_u256, OrderState, Ring};

/// Fixed-point scale of the rate ratios.
pub const RATE_RATIO_SCALE: i64 = 10_000;

/// Whether two opposite orders can form a ring without loss: the product of
/// the sell amounts must cover the product of the buy amounts.
pub fn price_valid(a_to_b: &OrderState, b_to_a: &OrderState) -> bool {
	let a = &a_to_b.raw_order;
	let b = &b_to_a.raw_order;
	rat_from_u256(a.amount_s) * rat_from_u256(b.amount_s)
		>= rat_from_u256(a.amount_b) * rat_from_u256(b.amount_b)
}

/// Coefficient of variation squared of each order's `rate_amount_s /
/// amount_s`, scaled by [`RATE_RATIO_SCALE`].
///
/// Fails when an order's rate-adjusted sell amount exceeds its original one.
pub fn price_rate_cv_square(ring: &Ring) -> Result<BigInt, EvaluatorError> {
	let scale = BigInt::from(RATE_RATIO_SCALE);
	let mut ratios = Vec::with_capacity(ring.orders.len());

	for order in &ring.orders {
		let rate_amount_s = order.rate_amount_s.round().to_integer();
		let amount_s = rat_from_u256(order.order().amount_s).to_integer();
		if rate_amount_s > amount_s {
			return Err(EvaluatorError::Structural(format!(
				"rate amount of order {} exceeds its sell amount",
				order.hash()
			)));
		}
		if amount_s.is_zero() {
			return Err(EvaluatorError::Structural(format!(
				"order {} sells nothing",
				order.hash()
			)));
		}
		ratios.push(&scale * rate_amount_s / amount_s);
	}

	Ok(cv_square(&ratios, &scale))
}

/// `sum((r - avg)^2) * scale / avg * scale / avg / (n - 1)` in integer
/// division, `i64::MAX` when the average is not positive.
pub fn cv_square(ratios: &[BigInt], scale: &BigInt) -> BigInt {
	if ratios.len() < 2 {
		return BigInt::zero();
	}
	let length = BigInt::from(ratios.len());
	let avg = ratios.iter().fold(BigInt::zero(), |acc, r| acc + r) / &length;
	if !avg.is_positive() {
		return BigInt::from(i64::MAX);
	}

	let squares = ratios.iter().fold(BigInt::zero(), |acc, r| {
		let diff = r - &avg;
		acc + &diff * &diff
	});

	squares * scale / &avg * scale / &avg / (length - BigInt::one())
}

/// Saturating conversion for logging and threshold comparison.
pub fn cvs_as_i64(cvs: &BigInt) -> i64 {
	cvs.to_i64().unwrap_or(i64::MAX)
}

//! Ring evaluation.
//!
//! Given a ring of filled orders, the [`Evaluator`] computes the uniform
//! reduced rate, the mutually consistent fill amounts, the fee each order
//! pays and how it pays it, and finally the miner's expected profit net of
//! settlement gas. All arithmetic is exact except the n-th root of the
//! reduced rate.

use async_trait::async_trait;
use num::{BigInt, BigRational, One, Zero};
use relay_pricing::{GasPriceEvaluator, PricingError, PricingService};
use relay_types::{nth_root, rat_from_int, rat_from_u256, Address, ProtocolAddress, Ring};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub mod cvs;

pub use cvs::{price_rate_cv_square, price_valid};

/// Default gas budget for rings of two to four orders.
pub const DEFAULT_RING_GAS: u64 = 500_000;

#[derive(Debug, Error)]
pub enum EvaluatorError {
	/// The ring is malformed or fails a pricing rule. Never retried.
	#[error("Invalid ring: {0}")]
	Structural(String),
	#[error("Price feed error: {0}")]
	PriceFeed(#[from] PricingError),
	#[error("Balance lookup failed: {0}")]
	Balance(String),
}

impl EvaluatorError {
	pub fn is_structural(&self) -> bool {
		matches!(self, EvaluatorError::Structural(_))
	}
}

/// Spendable amount of a token for an owner through a spender.
#[async_trait]
pub trait BalanceProvider: Send + Sync {
	async fn available_amount(
		&self,
		owner: Address,
		token: Address,
		spender: Address,
	) -> Result<BigRational, EvaluatorError>;
}

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
	/// Miner address receiving fees.
	pub fee_receipt: Address,
	pub rate_ratio_cvs_threshold: i64,
	/// Gas budget keyed by the number of orders in the ring.
	pub gas_used_with_length: HashMap<usize, u64>,
	/// Share of gas cost covered by a subsidy; at or above one the cost is ignored.
	pub subsidy: BigRational,
	/// Share of the net fee the miner keeps.
	pub wallet_split: BigRational,
	pub min_gas_price: u128,
	pub max_gas_price: u128,
}

impl Default for EvaluatorConfig {
	fn default() -> Self {
		Self {
			fee_receipt: Address::ZERO,
			rate_ratio_cvs_threshold: cvs::RATE_RATIO_SCALE,
			gas_used_with_length: (2..=4).map(|len| (len, DEFAULT_RING_GAS)).collect(),
			subsidy: BigRational::zero(),
			wallet_split: BigRational::one(),
			min_gas_price: 1_000_000_000,
			max_gas_price: 50_000_000_000,
		}
	}
}

/// `1 / (prod(amount_s) / prod(amount_b))^(1/n)` over the original amounts.
///
/// Rings whose sells do not cover their buys are rejected. The result is
/// capped at one to absorb rounding of the root.
pub fn reduced_rate(ring: &Ring) -> Result<BigRational, EvaluatorError> {
	let (product_s, product_b) = ring.orders.iter().fold(
		(BigRational::one(), BigRational::one()),
		|(s, b), order| {
			(
				s * rat_from_u256(order.order().amount_s),
				b * rat_from_u256(order.order().amount_b),
			)
		},
	);
	if product_s.is_zero() || product_b.is_zero() {
		return Err(EvaluatorError::Structural(
			"ring contains an order with a zero amount".to_string(),
		));
	}

	let product_price = product_s / product_b;
	if product_price < BigRational::one() {
		return Err(EvaluatorError::Structural(
			"ring sells less than it buys".to_string(),
		));
	}

	let root = nth_root(&product_price, ring.orders.len())
		.map_err(|e| EvaluatorError::Structural(e.to_string()))?;
	if root.is_zero() {
		return Err(EvaluatorError::Structural("degenerate ring price".to_string()));
	}

	let rate = root.recip();
	Ok(if rate > BigRational::one() {
		BigRational::one()
	} else {
		rate
	})
}

pub struct Evaluator {
	config: EvaluatorConfig,
	real_cost_rate: BigRational,
	protocols: HashMap<Address, ProtocolAddress>,
	pricing: Arc<PricingService>,
	gas_prices: Arc<GasPriceEvaluator>,
	balances: Arc<dyn BalanceProvider>,
}

impl Evaluator {
	pub fn new(
		config: EvaluatorConfig,
		protocols: Vec<ProtocolAddress>,
		pricing: Arc<PricingService>,
		gas_prices: Arc<GasPriceEvaluator>,
		balances: Arc<dyn BalanceProvider>,
	) -> Self {
		let real_cost_rate = if config.subsidy >= BigRational::one() {
			BigRational::zero()
		} else {
			BigRational::one() - &config.subsidy
		};
		Self {
			config,
			real_cost_rate,
			protocols: protocols.into_iter().map(|p| (p.contract, p)).collect(),
			pricing,
			gas_prices,
			balances,
		}
	}

	pub fn fee_receipt(&self) -> Address {
		self.config.fee_receipt
	}

	pub fn config(&self) -> &EvaluatorConfig {
		&self.config
	}

	pub fn protocol(&self, contract: &Address) -> Option<&ProtocolAddress> {
		self.protocols.get(contract)
	}

	/// Prices the ring in place: reduced rate, fills, fees, profit.
	pub async fn compute_ring(&self, ring: &mut Ring) -> Result<(), EvaluatorError> {
		if ring.orders.len() < 2 {
			return Err(EvaluatorError::Structural(format!(
				"ring needs at least two orders, got {}",
				ring.orders.len()
			)));
		}

		ring.reduced_rate = reduced_rate(ring)?;
		let rate = ring.reduced_rate.clone();

		let mut min_volume_idx = 0;
		for idx in 0..ring.orders.len() {
			let (head, tail) = ring.orders.split_at_mut(idx);
			let previous = head.last();
			let order = &mut tail[0];

			let amount_s = rat_from_u256(order.order().amount_s);
			let amount_b = rat_from_u256(order.order().amount_b);
			order.s_price = &amount_s / &amount_b * &rate;
			order.b_price = order.s_price.recip();
			order.rate_amount_s = &amount_s * &rate;

			if order.order().buy_no_more_than_amount_b {
				order.available_amount_s = &order.s_price * &order.available_amount_b;
			} else {
				order.available_amount_b = &order.b_price * &order.available_amount_s;
			}

			order.fill_amount_s = match previous {
				Some(previous) if previous.fill_amount_b >= order.available_amount_s => {
					min_volume_idx = idx;
					order.available_amount_s.clone()
				}
				Some(previous) => previous.fill_amount_b.clone(),
				None => order.available_amount_s.clone(),
			};
			order.fill_amount_b = &order.fill_amount_s * &order.b_price;
		}

		// propagate the bottleneck in both directions
		for idx in (0..min_volume_idx).rev() {
			let next_fill_s = ring.orders[idx + 1].fill_amount_s.clone();
			let order = &mut ring.orders[idx];
			order.fill_amount_s = &next_fill_s * &order.s_price;
			order.fill_amount_b = next_fill_s;
		}
		for idx in min_volume_idx + 1..ring.orders.len() {
			let previous_fill_b = ring.orders[idx - 1].fill_amount_b.clone();
			let order = &mut ring.orders[idx];
			order.fill_amount_b = &previous_fill_b * &order.b_price;
			order.fill_amount_s = previous_fill_b;
		}

		self.compute_fee_of_ring_and_order(ring).await?;

		let variance = price_rate_cv_square(ring)?;
		if variance > BigInt::from(self.config.rate_ratio_cvs_threshold) {
			debug!(
				cvs = cvs::cvs_as_i64(&variance),
				threshold = self.config.rate_ratio_cvs_threshold,
				orders = ?ring.orders.iter().map(|o| o.hash()).collect::<Vec<_>>(),
				"Rate ratio variance above threshold"
			);
			return Err(EvaluatorError::Structural(
				"rate ratio variance above threshold".to_string(),
			));
		}
		Ok(())
	}

	async fn compute_fee_of_ring_and_order(&self, ring: &mut Ring) -> Result<(), EvaluatorError> {
		let protocol_address = ring.orders[0].order().protocol;
		let protocol = *self.protocols.get(&protocol_address).ok_or_else(|| {
			EvaluatorError::Structural(format!("unsupported protocol {}", protocol_address))
		})?;

		let mut fee_receipt_lrc = self
			.balances
			.available_amount(self.config.fee_receipt, protocol.lrc_token, protocol.delegate)
			.await?;

		let two = rat_from_int(2);
		let hundred = rat_from_int(100);
		ring.legal_fee = BigRational::zero();

		for order in ring.orders.iter_mut() {
			let raw = order.order().clone();
			let amount_s = rat_from_u256(raw.amount_s);
			let amount_b = rat_from_u256(raw.amount_b);

			let legal_saving = if raw.buy_no_more_than_amount_b {
				order.fee_s = &order.fill_amount_b * &amount_s / &amount_b - &order.fill_amount_s;
				self.pricing
					.legal_currency_value(raw.token_s, &order.fee_s)
					.await?
			} else {
				order.fee_s = &order.fill_amount_b - &order.fill_amount_b * &ring.reduced_rate;
				self.pricing
					.legal_currency_value(raw.token_b, &order.fee_s)
					.await?
			};

			order.lrc_fee = rat_from_u256(raw.lrc_fee) * &order.fill_amount_s / &amount_s;
			if order.available_lrc_balance <= order.lrc_fee {
				order.lrc_fee = order.available_lrc_balance.clone();
			}
			order.legal_lrc_fee = self
				.pricing
				.legal_currency_value(protocol.lrc_token, &order.lrc_fee)
				.await?;

			let split = rat_from_int(i64::from(raw.margin_split_percentage.min(100))) / &hundred;
			order.legal_fee_s = legal_saving * split;

			if &two * &order.legal_lrc_fee < order.legal_fee_s && fee_receipt_lrc > order.lrc_fee {
				order.fee_selection = 1;
				order.legal_fee_s = &order.legal_fee_s - &order.legal_lrc_fee;
				order.lrc_reward = order.legal_lrc_fee.clone();
				ring.legal_fee += &order.legal_fee_s;
				fee_receipt_lrc -= &order.lrc_fee;
			} else {
				order.fee_selection = 0;
				order.legal_fee_s = order.legal_lrc_fee.clone();
				order.lrc_reward = BigRational::zero();
				ring.legal_fee += &order.legal_lrc_fee;
			}

			debug!(
				order_hash = %raw.hash,
				fee_selection = order.fee_selection,
				lrc_fee = %order.lrc_fee,
				fee_s = %order.fee_s,
				legal_fee_s = %order.legal_fee_s,
				"Computed order fee"
			);
		}

		self.evaluate_received(ring).await
	}

	async fn evaluate_received(&self, ring: &mut Ring) -> Result<(), EvaluatorError> {
		ring.gas_price = self
			.gas_prices
			.evaluated_price(self.config.min_gas_price, self.config.max_gas_price)
			.await;
		ring.gas = *self
			.config
			.gas_used_with_length
			.get(&ring.orders.len())
			.ok_or_else(|| {
				EvaluatorError::Structural(format!(
					"no gas budget for rings of {} orders",
					ring.orders.len()
				))
			})?;

		let cost_wei =
			BigRational::from_integer(BigInt::from(ring.gas) * BigInt::from(ring.gas_price));
		let legal_cost = self.pricing.legal_currency_value_of_eth(&cost_wei).await?;
		ring.legal_cost = legal_cost * &self.real_cost_rate;
		ring.received = (&ring.legal_fee - &ring.legal_cost) * &self.config.wallet_split;

		debug!(
			legal_fee = %ring.legal_fee,
			legal_cost = %ring.legal_cost,
			received = %ring.received,
			gas = ring.gas,
			gas_price = ring.gas_price,
			"Evaluated ring"
		);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use relay_pricing::implementations::fixed::FixedPriceFeed;
	use relay_types::{FilledOrder, Order, OrderState, B256, U256};

	const LRC: Address = Address::repeat_byte(0x1c);
	const TOKEN_X: Address = Address::repeat_byte(0x0a);
	const TOKEN_Y: Address = Address::repeat_byte(0x0b);
	const PROTOCOL: Address = Address::repeat_byte(0x01);
	const FEE_RECEIPT: Address = Address::repeat_byte(0xfe);

	struct FixedBalances {
		fee_receipt_lrc: i64,
	}

	#[async_trait]
	impl BalanceProvider for FixedBalances {
		async fn available_amount(
			&self,
			owner: Address,
			_token: Address,
			_spender: Address,
		) -> Result<BigRational, EvaluatorError> {
			if owner == FEE_RECEIPT {
				Ok(rat_from_int(self.fee_receipt_lrc))
			} else {
				Ok(rat_from_int(1_000_000))
			}
		}
	}

	fn filled(
		token_s: Address,
		token_b: Address,
		amount_s: u64,
		amount_b: u64,
		lrc_fee: u64,
		split: u8,
	) -> FilledOrder {
		let mut order = Order {
			protocol: PROTOCOL,
			delegate_address: Address::repeat_byte(0x02),
			auth_addr: Address::ZERO,
			wallet_address: Address::ZERO,
			token_s,
			token_b,
			amount_s: U256::from(amount_s),
			amount_b: U256::from(amount_b),
			valid_since: 0,
			valid_until: u64::MAX,
			lrc_fee: U256::from(lrc_fee),
			buy_no_more_than_amount_b: false,
			margin_split_percentage: split,
			v: 27,
			r: B256::ZERO,
			s: B256::ZERO,
			owner: Address::repeat_byte(amount_s as u8),
			hash: B256::ZERO,
		};
		order.seal();
		FilledOrder::new(
			OrderState::new(order),
			rat_from_int(1_000),
			rat_from_int(1_000_000),
			LRC,
		)
	}

	fn evaluator(fee_receipt_lrc: i64, cvs_threshold: i64, token_price: i64) -> Evaluator {
		let feed = FixedPriceFeed::new(rat_from_int(2_000))
			.with_token(LRC, rat_from_int(1), 0)
			.with_token(TOKEN_X, rat_from_int(token_price), 0)
			.with_token(TOKEN_Y, rat_from_int(token_price), 0);
		let config = EvaluatorConfig {
			fee_receipt: FEE_RECEIPT,
			rate_ratio_cvs_threshold: cvs_threshold,
			wallet_split: BigRational::new(4.into(), 5.into()),
			min_gas_price: 1_000_000_000,
			max_gas_price: 1_000_000_000,
			..Default::default()
		};
		Evaluator::new(
			config,
			vec![ProtocolAddress {
				contract: PROTOCOL,
				delegate: Address::repeat_byte(0x02),
				lrc_token: LRC,
			}],
			Arc::new(PricingService::new(Box::new(feed))),
			Arc::new(GasPriceEvaluator::default()),
			Arc::new(FixedBalances { fee_receipt_lrc }),
		)
	}

	#[tokio::test]
	async fn test_matching_pair_is_profitable() {
		let evaluator = evaluator(0, 10_000, 1);
		let mut ring = Ring::new(vec![
			filled(TOKEN_X, TOKEN_Y, 300, 4000, 100, 50),
			filled(TOKEN_Y, TOKEN_X, 4000, 300, 100, 50),
		]);

		evaluator.compute_ring(&mut ring).await.unwrap();

		assert_eq!(ring.reduced_rate, BigRational::one());
		let (a, b) = (&ring.orders[0], &ring.orders[1]);
		assert_eq!(a.fill_amount_s, rat_from_int(300));
		assert_eq!(a.fill_amount_b, rat_from_int(4000));
		assert_eq!(b.fill_amount_s, a.fill_amount_b);
		assert_eq!(b.fill_amount_b, a.fill_amount_s);
		assert!(a.fill_amount_s <= a.available_amount_s);
		assert!(b.fill_amount_s <= b.available_amount_s);

		// both pay the LRC fee; gas costs 500000 gwei at 2000 per ether
		assert_eq!(ring.legal_fee, rat_from_int(200));
		assert_eq!(ring.legal_cost, rat_from_int(1));
		assert_eq!(ring.received, rat_from_int(199) * BigRational::new(4.into(), 5.into()));
		assert!(ring.received > BigRational::zero());
		assert_eq!(ring.gas, DEFAULT_RING_GAS);
	}

	#[tokio::test]
	async fn test_single_order_ring_rejected() {
		let evaluator = evaluator(0, 10_000, 1);
		let mut ring = Ring::new(vec![filled(TOKEN_X, TOKEN_Y, 300, 4000, 0, 0)]);
		assert!(evaluator
			.compute_ring(&mut ring)
			.await
			.unwrap_err()
			.is_structural());
	}

	#[tokio::test]
	async fn test_losing_ring_rejected() {
		let evaluator = evaluator(0, 10_000, 1);
		let mut ring = Ring::new(vec![
			filled(TOKEN_X, TOKEN_Y, 100, 200, 0, 0),
			filled(TOKEN_Y, TOKEN_X, 100, 100, 0, 0),
		]);
		assert!(evaluator
			.compute_ring(&mut ring)
			.await
			.unwrap_err()
			.is_structural());
	}

	#[tokio::test]
	async fn test_cvs_above_threshold_rejected() {
		let evaluator = evaluator(0, 10_000, 1);
		let mut ring = Ring::new(vec![
			filled(TOKEN_X, TOKEN_Y, 1, 1, 0, 0),
			filled(TOKEN_Y, TOKEN_X, 4, 1, 0, 0),
		]);
		let err = evaluator.compute_ring(&mut ring).await.unwrap_err();
		assert!(err.is_structural());
		assert_eq!(ring.reduced_rate, BigRational::new(1.into(), 2.into()));
	}

	#[tokio::test]
	async fn test_margin_split_needs_fee_receipt_lrc() {
		// spread ring: reduced rate 1/2
		let build = || {
			Ring::new(vec![
				filled(TOKEN_X, TOKEN_Y, 1, 1, 0, 100),
				filled(TOKEN_Y, TOKEN_X, 4, 1, 0, 100),
			])
		};

		let funded = evaluator(10, i64::MAX, 100);
		let mut ring = build();
		funded.compute_ring(&mut ring).await.unwrap();
		assert!(ring.orders.iter().all(|o| o.fee_selection == 1));
		// savings: 1 Y and 1/2 X at 100 each
		assert_eq!(ring.legal_fee, rat_from_int(150));
		assert_eq!(ring.fee_selections(), 0b11);

		let unfunded = evaluator(0, i64::MAX, 100);
		let mut ring = build();
		unfunded.compute_ring(&mut ring).await.unwrap();
		assert!(ring.orders.iter().all(|o| o.fee_selection == 0));
		assert_eq!(ring.legal_fee, BigRational::zero());
	}

	#[tokio::test]
	async fn test_lrc_fee_capped_by_balance() {
		let evaluator = evaluator(0, 10_000, 1);
		let mut a = filled(TOKEN_X, TOKEN_Y, 300, 4000, 5_000, 0);
		a.available_lrc_balance = rat_from_int(40);
		let b = filled(TOKEN_Y, TOKEN_X, 4000, 300, 0, 0);
		let mut ring = Ring::new(vec![a, b]);

		evaluator.compute_ring(&mut ring).await.unwrap();
		assert_eq!(ring.orders[0].lrc_fee, rat_from_int(40));
	}

	#[test]
	fn test_reduced_rate_in_unit_interval() {
		for (a, b) in [(300u64, 4000u64), (1, 1), (7, 3), (1_000_000, 999_999)] {
			let ring = Ring::new(vec![
				filled(TOKEN_X, TOKEN_Y, a, b, 0, 0),
				filled(TOKEN_Y, TOKEN_X, b + 1, a, 0, 0),
			]);
			let rate = reduced_rate(&ring).unwrap();
			assert!(rate > BigRational::zero());
			assert!(rate <= BigRational::one());
		}
	}
}

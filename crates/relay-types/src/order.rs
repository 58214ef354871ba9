//! Order types for the relay.
//!
//! An [`Order`] is the immutable signed intent, [`OrderState`] wraps it with
//! the mutable dealt/cancelled/split accounting, and [`FilledOrder`] is the
//! per-ring-attempt projection the evaluator fills in.

use alloy::primitives::{keccak256, Address, B256, U256};
use num::{BigRational, Zero};
use serde::{Deserialize, Serialize};

use crate::rational::{rat_from_u256, rat_to_u256};

/// A signed trade intent: sell up to `amount_s` of `token_s` for at least a
/// proportional `amount_b` of `token_b`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
	/// Settlement protocol implementation address.
	pub protocol: Address,
	/// Token transfer delegate bound to the protocol.
	pub delegate_address: Address,
	pub auth_addr: Address,
	pub wallet_address: Address,
	pub token_s: Address,
	pub token_b: Address,
	pub amount_s: U256,
	pub amount_b: U256,
	/// Unix seconds.
	pub valid_since: u64,
	/// Unix seconds.
	pub valid_until: u64,
	pub lrc_fee: U256,
	/// Caps the fill by the buy side instead of the sell side.
	pub buy_no_more_than_amount_b: bool,
	/// 0-100, share of the margin kept by the miner in margin-split mode.
	pub margin_split_percentage: u8,
	pub v: u8,
	pub r: B256,
	pub s: B256,
	pub owner: Address,
	#[serde(default)]
	pub hash: B256,
}

impl Order {
	/// Content hash over the signed order fields.
	pub fn generate_hash(&self) -> B256 {
		let mut packed = Vec::with_capacity(6 * 20 + 5 * 32 + 2);
		packed.extend_from_slice(self.delegate_address.as_slice());
		packed.extend_from_slice(self.owner.as_slice());
		packed.extend_from_slice(self.token_s.as_slice());
		packed.extend_from_slice(self.token_b.as_slice());
		packed.extend_from_slice(self.wallet_address.as_slice());
		packed.extend_from_slice(self.auth_addr.as_slice());
		packed.extend_from_slice(&self.amount_s.to_be_bytes::<32>());
		packed.extend_from_slice(&self.amount_b.to_be_bytes::<32>());
		packed.extend_from_slice(&U256::from(self.valid_since).to_be_bytes::<32>());
		packed.extend_from_slice(&U256::from(self.valid_until).to_be_bytes::<32>());
		packed.extend_from_slice(&self.lrc_fee.to_be_bytes::<32>());
		packed.push(self.buy_no_more_than_amount_b as u8);
		packed.push(self.margin_split_percentage);
		keccak256(&packed)
	}

	/// Sets `hash` from the order content, returning it.
	pub fn seal(&mut self) -> B256 {
		self.hash = self.generate_hash();
		self.hash
	}

	/// Original sell price `amount_s / amount_b`, `None` for a zero buy amount.
	pub fn sell_price(&self) -> Option<BigRational> {
		if self.amount_b.is_zero() {
			return None;
		}
		Some(rat_from_u256(self.amount_s) / rat_from_u256(self.amount_b))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OrderStatus {
	#[default]
	New,
	Partial,
	Finished,
	Cancelled,
	Cutoff,
	Expired,
}

impl OrderStatus {
	/// Whether the order book may still hand this order to a miner.
	pub fn is_matchable(&self) -> bool {
		matches!(self, OrderStatus::New | OrderStatus::Partial)
	}
}

/// Accounting wrapper around an [`Order`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderState {
	pub raw_order: Order,
	#[serde(default)]
	pub updated_block: u64,
	#[serde(default)]
	pub dealt_amount_s: U256,
	#[serde(default)]
	pub dealt_amount_b: U256,
	#[serde(default)]
	pub split_amount_s: U256,
	#[serde(default)]
	pub split_amount_b: U256,
	#[serde(default)]
	pub cancelled_amount_s: U256,
	#[serde(default)]
	pub cancelled_amount_b: U256,
	#[serde(default)]
	pub status: OrderStatus,
}

impl OrderState {
	pub fn new(mut order: Order) -> Self {
		if order.hash.is_zero() {
			order.seal();
		}
		Self {
			raw_order: order,
			updated_block: 0,
			dealt_amount_s: U256::ZERO,
			dealt_amount_b: U256::ZERO,
			split_amount_s: U256::ZERO,
			split_amount_b: U256::ZERO,
			cancelled_amount_s: U256::ZERO,
			cancelled_amount_b: U256::ZERO,
			status: OrderStatus::New,
		}
	}

	pub fn hash(&self) -> B256 {
		self.raw_order.hash
	}

	/// Remaining `(sell, buy)` amounts derived from the authoritative side.
	///
	/// The authoritative side is the buy side when `buy_no_more_than_amount_b`
	/// is set, the sell side otherwise. The other side follows at the order's
	/// original price. Never negative.
	pub fn remained_amount(&self) -> (BigRational, BigRational) {
		let order = &self.raw_order;
		if order.amount_s.is_zero() || order.amount_b.is_zero() {
			return (BigRational::zero(), BigRational::zero());
		}
		let amount_s = rat_from_u256(order.amount_s);
		let amount_b = rat_from_u256(order.amount_b);

		if order.buy_no_more_than_amount_b {
			let reduced = rat_from_u256(self.dealt_amount_b)
				+ rat_from_u256(self.cancelled_amount_b)
				+ rat_from_u256(self.split_amount_b);
			let remained_b = non_negative(&amount_b - reduced);
			let remained_s = &remained_b * &amount_s / &amount_b;
			(remained_s, remained_b)
		} else {
			let reduced = rat_from_u256(self.dealt_amount_s)
				+ rat_from_u256(self.cancelled_amount_s)
				+ rat_from_u256(self.split_amount_s);
			let remained_s = non_negative(&amount_s - reduced);
			let remained_b = &remained_s * &amount_b / &amount_s;
			(remained_s, remained_b)
		}
	}

	/// Adds a provisional fill to the dealt amounts.
	pub fn add_dealt(&mut self, fill_s: &BigRational, fill_b: &BigRational) {
		self.dealt_amount_s = self.dealt_amount_s.saturating_add(rat_to_u256(fill_s));
		self.dealt_amount_b = self.dealt_amount_b.saturating_add(rat_to_u256(fill_b));
	}
}

fn non_negative(value: BigRational) -> BigRational {
	if value < BigRational::zero() {
		BigRational::zero()
	} else {
		value
	}
}

/// Orders to park for a number of rounds when querying the order book.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderDelayList {
	pub order_hashes: Vec<B256>,
	/// Round number until which the listed orders stay hidden.
	pub delayed_count: i64,
}

/// Projection of an [`OrderState`] inside one ring evaluation.
#[derive(Debug, Clone)]
pub struct FilledOrder {
	pub order_state: OrderState,
	/// 0 = LRC fee, 1 = margin split.
	pub fee_selection: u8,
	pub rate_amount_s: BigRational,
	pub available_amount_s: BigRational,
	pub available_amount_b: BigRational,
	pub fill_amount_s: BigRational,
	pub fill_amount_b: BigRational,
	pub lrc_reward: BigRational,
	pub lrc_fee: BigRational,
	pub legal_lrc_fee: BigRational,
	pub fee_s: BigRational,
	pub legal_fee_s: BigRational,
	/// Ring-effective sell price.
	pub s_price: BigRational,
	/// Ring-effective buy price, the inverse of `s_price`.
	pub b_price: BigRational,
	pub available_lrc_balance: BigRational,
	pub available_token_s_balance: BigRational,
}

impl FilledOrder {
	/// Builds the projection for a fresh ring attempt.
	///
	/// The available sell amount is capped by the owner's token-S balance and
	/// the buy side re-derived at the original price, then the non-authoritative
	/// side is recomputed. When the order buys LRC its own proceeds may pay the
	/// fee, so a short LRC balance is raised to the available buy amount.
	pub fn new(
		order_state: OrderState,
		lrc_balance: BigRational,
		token_s_balance: BigRational,
		lrc_token: Address,
	) -> Self {
		let (mut available_s, mut available_b) = order_state.remained_amount();
		let order = &order_state.raw_order;
		let mut available_lrc_balance = lrc_balance.clone();

		if let Some(sell_price) = order.sell_price().filter(|p| !p.is_zero()) {
			if available_s > token_s_balance {
				available_s = token_s_balance.clone();
				available_b = &available_s / &sell_price;
			}
			if order.buy_no_more_than_amount_b {
				available_s = &available_b * &sell_price;
			} else {
				available_b = &available_s / &sell_price;
			}
		}

		if order.token_b == lrc_token && lrc_balance < available_b {
			available_lrc_balance = available_b.clone();
		}

		Self {
			order_state,
			fee_selection: 0,
			rate_amount_s: BigRational::zero(),
			available_amount_s: available_s,
			available_amount_b: available_b,
			fill_amount_s: BigRational::zero(),
			fill_amount_b: BigRational::zero(),
			lrc_reward: BigRational::zero(),
			lrc_fee: BigRational::zero(),
			legal_lrc_fee: BigRational::zero(),
			fee_s: BigRational::zero(),
			legal_fee_s: BigRational::zero(),
			s_price: BigRational::zero(),
			b_price: BigRational::zero(),
			available_lrc_balance,
			available_token_s_balance: token_s_balance,
		}
	}

	pub fn order(&self) -> &Order {
		&self.order_state.raw_order
	}

	pub fn hash(&self) -> B256 {
		self.order_state.raw_order.hash
	}
}

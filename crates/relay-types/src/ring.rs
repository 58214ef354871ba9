//! Ring types.
//!
//! A ring is a cyclic sequence of filled orders where each order's buy token
//! is the next order's sell token.

use alloy::primitives::{keccak256, Address, Bytes, B256};
use num::{BigRational, Zero};

use crate::order::FilledOrder;

#[derive(Debug, Clone)]
pub struct Ring {
	pub orders: Vec<FilledOrder>,
	/// Uniform discount applied to every order so the cycle balances.
	pub reduced_rate: BigRational,
	/// Miner fee income in the reference currency.
	pub legal_fee: BigRational,
	/// Estimated settlement cost in the reference currency.
	pub legal_cost: BigRational,
	/// Net miner profit.
	pub received: BigRational,
	pub gas: u64,
	pub gas_price: u128,
	pub hash: B256,
}

impl Ring {
	pub fn new(orders: Vec<FilledOrder>) -> Self {
		Self {
			orders,
			reduced_rate: BigRational::zero(),
			legal_fee: BigRational::zero(),
			legal_cost: BigRational::zero(),
			received: BigRational::zero(),
			gas: 0,
			gas_price: 0,
			hash: B256::ZERO,
		}
	}

	fn xor_order_hashes(&self) -> B256 {
		self.orders
			.iter()
			.fold(B256::ZERO, |acc, order| acc ^ order.hash())
	}

	/// Bitmap with bit `i` set when order `i` uses margin split.
	pub fn fee_selections(&self) -> u16 {
		self.orders
			.iter()
			.enumerate()
			.fold(0u16, |acc, (idx, order)| {
				acc | (u16::from(order.fee_selection & 1) << idx)
			})
	}

	/// Hash identifying this exact submission: order set, fee receipt and
	/// fee selections.
	pub fn generate_hash(&self, fee_receipt: Address) -> B256 {
		let mut packed = Vec::with_capacity(32 + 20 + 2);
		packed.extend_from_slice(self.xor_order_hashes().as_slice());
		packed.extend_from_slice(fee_receipt.as_slice());
		packed.extend_from_slice(&self.fee_selections().to_be_bytes());
		keccak256(&packed)
	}

	/// Identifier of the order set alone, stable across fee-selection changes.
	pub fn generate_unique_id(&self) -> B256 {
		keccak256(self.xor_order_hashes())
	}

	/// Earliest time every order in the ring is valid.
	pub fn valid_since_time(&self) -> u64 {
		self.orders
			.iter()
			.map(|order| order.order().valid_since)
			.max()
			.unwrap_or(0)
	}
}

/// Identifier of an order set by its member hashes.
pub fn unique_id_of(order_hashes: &[B256]) -> B256 {
	keccak256(
		order_hashes
			.iter()
			.fold(B256::ZERO, |acc, hash| acc ^ *hash),
	)
}

/// A finalized ring ready to be signed and broadcast.
#[derive(Debug, Clone)]
pub struct RingSubmitInfo {
	pub raw_ring: Ring,
	pub protocol_address: Address,
	pub orders_count: usize,
	/// ABI-encoded settlement call.
	pub protocol_data: Bytes,
	pub protocol_gas: u64,
	pub protocol_gas_price: u128,
	/// Sender selected for this submission.
	pub miner: Address,
	pub ring_hash: B256,
	pub unique_id: B256,
	pub submit_tx_hash: Option<B256>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::order::{Order, OrderState};
	use crate::rational::rat_from_int;
	use alloy::primitives::U256;

	fn filled(seed: u8, valid_since: u64) -> FilledOrder {
		let mut order = Order {
			protocol: Address::ZERO,
			delegate_address: Address::ZERO,
			auth_addr: Address::ZERO,
			wallet_address: Address::ZERO,
			token_s: Address::repeat_byte(seed),
			token_b: Address::repeat_byte(seed.wrapping_add(1)),
			amount_s: U256::from(100u64),
			amount_b: U256::from(100u64),
			valid_since,
			valid_until: u64::MAX,
			lrc_fee: U256::ZERO,
			buy_no_more_than_amount_b: false,
			margin_split_percentage: 0,
			v: 0,
			r: B256::ZERO,
			s: B256::ZERO,
			owner: Address::repeat_byte(seed),
			hash: B256::ZERO,
		};
		order.seal();
		FilledOrder::new(
			OrderState::new(order),
			rat_from_int(0),
			rat_from_int(100),
			Address::ZERO,
		)
	}

	#[test]
	fn test_unique_id_ignores_order_and_fee_selection() {
		let mut ring = Ring::new(vec![filled(1, 10), filled(2, 20)]);
		let reversed = Ring::new(vec![filled(2, 20), filled(1, 10)]);
		let fee_receipt = Address::repeat_byte(0x99);

		let before = ring.generate_hash(fee_receipt);
		assert_eq!(ring.generate_unique_id(), reversed.generate_unique_id());

		ring.orders[1].fee_selection = 1;
		assert_eq!(ring.fee_selections(), 0b10);
		assert_ne!(ring.generate_hash(fee_receipt), before);
		assert_eq!(ring.generate_unique_id(), reversed.generate_unique_id());

		let hashes: Vec<B256> = ring.orders.iter().map(|o| o.hash()).collect();
		assert_eq!(unique_id_of(&hashes), ring.generate_unique_id());
	}

	#[test]
	fn test_valid_since_is_latest_order() {
		let ring = Ring::new(vec![filled(1, 10), filled(2, 20)]);
		assert_eq!(ring.valid_since_time(), 20);
	}
}

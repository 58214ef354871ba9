//! Order book collaborator for the matcher.
//!
//! The order book owns order persistence and lifecycle. The relay only
//! consumes the queries defined by [`OrderBookInterface`]: pulling orders
//! eligible for a matching round, and judging whether an order or an amount
//! is too small to be worth settling.

use async_trait::async_trait;
use num::BigRational;
use relay_pricing::PricingError;
use relay_types::{Address, ConfigSchema, OrderDelayList, OrderState};
use thiserror::Error;

pub mod implementations {
	pub mod memory;
}

#[derive(Debug, Error)]
pub enum OrderBookError {
	#[error("Pricing error: {0}")]
	Pricing(#[from] PricingError),
	#[error("Failed to load orders: {0}")]
	Load(String),
	#[error("Invalid configuration: {0}")]
	Config(String),
}

/// Selection window for [`OrderBookInterface::miner_orders`].
///
/// Orders carry a round mark set when they are parked; only orders whose mark
/// lies in `since_round..=until_round` are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinerOrderQuery {
	pub delegate: Address,
	pub token_s: Address,
	pub token_b: Address,
	pub limit: usize,
	/// Seconds an order must remain valid for after now.
	pub reserved_time: u64,
	pub since_round: i64,
	pub until_round: i64,
}

#[async_trait]
pub trait OrderBookInterface: Send + Sync {
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Orders selling `token_s` for `token_b`, best price first.
	///
	/// When `exclude` is given its orders are first parked until round
	/// `exclude.delayed_count`.
	async fn miner_orders(
		&self,
		query: MinerOrderQuery,
		exclude: Option<&OrderDelayList>,
	) -> Result<Vec<OrderState>, OrderBookError>;

	/// Whether the remaining sell amount is worth less than the dust value.
	async fn is_order_full_finished(&self, state: &OrderState) -> Result<bool, OrderBookError>;

	async fn is_value_dusted(
		&self,
		token: Address,
		amount: &BigRational,
	) -> Result<bool, OrderBookError>;
}

pub struct OrderBookService {
	backend: Box<dyn OrderBookInterface>,
}

impl OrderBookService {
	pub fn new(backend: Box<dyn OrderBookInterface>) -> Self {
		Self { backend }
	}

	pub async fn miner_orders(
		&self,
		query: MinerOrderQuery,
		exclude: Option<&OrderDelayList>,
	) -> Result<Vec<OrderState>, OrderBookError> {
		self.backend.miner_orders(query, exclude).await
	}

	pub async fn is_order_full_finished(&self, state: &OrderState) -> Result<bool, OrderBookError> {
		self.backend.is_order_full_finished(state).await
	}

	pub async fn is_value_dusted(
		&self,
		token: Address,
		amount: &BigRational,
	) -> Result<bool, OrderBookError> {
		self.backend.is_value_dusted(token, amount).await
	}
}

//! In-memory order book, optionally seeded from a JSON file of signed orders.

use crate::{MinerOrderQuery, OrderBookError, OrderBookInterface};
use async_trait::async_trait;
use num::BigRational;
use relay_pricing::PricingService;
use relay_types::{
	parse_decimal, validate_decimal, Address, ConfigSchema, Field, FieldType, Order,
	OrderDelayList, OrderState, Schema, ValidationError, B256,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

struct Entry {
	state: OrderState,
	/// Round until which the order is parked; zero when never parked.
	mark: i64,
}

pub struct MemoryOrderBook {
	orders: RwLock<HashMap<B256, Entry>>,
	pricing: Arc<PricingService>,
	dust_value: BigRational,
}

impl MemoryOrderBook {
	pub fn new(pricing: Arc<PricingService>, dust_value: BigRational) -> Self {
		Self {
			orders: RwLock::new(HashMap::new()),
			pricing,
			dust_value,
		}
	}

	pub fn with_orders(self, orders: Vec<OrderState>) -> Self {
		let map = orders
			.into_iter()
			.map(|state| (state.hash(), Entry { state, mark: 0 }))
			.collect();
		Self {
			orders: RwLock::new(map),
			..self
		}
	}

	/// Inserts or replaces an order, keeping its round mark.
	pub async fn upsert(&self, state: OrderState) {
		let mut orders = self.orders.write().await;
		let hash = state.hash();
		match orders.get_mut(&hash) {
			Some(entry) => entry.state = state,
			None => {
				orders.insert(hash, Entry { state, mark: 0 });
			}
		}
	}

	pub async fn get(&self, hash: &B256) -> Option<OrderState> {
		self.orders.read().await.get(hash).map(|e| e.state.clone())
	}
}

pub struct MemoryOrderBookSchema;

impl ConfigSchema for MemoryOrderBookSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![],
			vec![
				Field::new("dust_value", FieldType::String).with_validator(validate_decimal),
				Field::new("orders_file", FieldType::String),
			],
		);
		schema.validate(config)
	}
}

#[async_trait]
impl OrderBookInterface for MemoryOrderBook {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryOrderBookSchema)
	}

	async fn miner_orders(
		&self,
		query: MinerOrderQuery,
		exclude: Option<&OrderDelayList>,
	) -> Result<Vec<OrderState>, OrderBookError> {
		let mut orders = self.orders.write().await;

		if let Some(delay) = exclude {
			for hash in &delay.order_hashes {
				if let Some(entry) = orders.get_mut(hash) {
					entry.mark = delay.delayed_count;
				}
			}
			if !delay.order_hashes.is_empty() {
				debug!(
					count = delay.order_hashes.len(),
					until_round = delay.delayed_count,
					"Parked orders"
				);
			}
		}

		let now = chrono::Utc::now().timestamp().max(0) as u64;
		let deadline = now.saturating_add(query.reserved_time);

		let mut selected: Vec<(BigRational, &OrderState)> = orders
			.values()
			.filter(|entry| entry.mark >= query.since_round && entry.mark <= query.until_round)
			.map(|entry| &entry.state)
			.filter(|state| {
				let order = &state.raw_order;
				state.status.is_matchable()
					&& order.delegate_address == query.delegate
					&& order.token_s == query.token_s
					&& order.token_b == query.token_b
					&& order.valid_since <= now
					&& order.valid_until >= deadline
			})
			.filter_map(|state| state.raw_order.sell_price().map(|price| (price, state)))
			.collect();

		selected.sort_by(|(pa, a), (pb, b)| pb.cmp(pa).then_with(|| a.hash().cmp(&b.hash())));

		Ok(selected
			.into_iter()
			.take(query.limit)
			.map(|(_, state)| state.clone())
			.collect())
	}

	async fn is_order_full_finished(&self, state: &OrderState) -> Result<bool, OrderBookError> {
		let (remained_s, _) = state.remained_amount();
		self.is_value_dusted(state.raw_order.token_s, &remained_s)
			.await
	}

	async fn is_value_dusted(
		&self,
		token: Address,
		amount: &BigRational,
	) -> Result<bool, OrderBookError> {
		let value = self.pricing.legal_currency_value(token, amount).await?;
		Ok(value <= self.dust_value)
	}
}

fn load_orders(path: &str) -> Result<Vec<OrderState>, OrderBookError> {
	let content = std::fs::read_to_string(path)
		.map_err(|e| OrderBookError::Load(format!("{}: {}", path, e)))?;
	let orders: Vec<Order> =
		serde_json::from_str(&content).map_err(|e| OrderBookError::Load(e.to_string()))?;
	Ok(orders.into_iter().map(OrderState::new).collect())
}

/// Factory function to create an in-memory order book from configuration.
///
/// Configuration parameters:
/// - `dust_value`: reference-currency value at or below which an amount is dust (default "0")
/// - `orders_file`: optional JSON array of signed orders loaded at startup
pub fn create_orderbook(
	config: &toml::Value,
	pricing: Arc<PricingService>,
) -> Result<Box<dyn OrderBookInterface>, OrderBookError> {
	MemoryOrderBookSchema
		.validate(config)
		.map_err(|e| OrderBookError::Config(e.to_string()))?;

	let dust_value = parse_decimal(
		config
			.get("dust_value")
			.and_then(|v| v.as_str())
			.unwrap_or("0"),
	)
	.map_err(|e| OrderBookError::Config(e.to_string()))?;

	let mut book = MemoryOrderBook::new(pricing, dust_value);
	if let Some(path) = config.get("orders_file").and_then(|v| v.as_str()) {
		let orders = load_orders(path)?;
		info!(path, count = orders.len(), "Loaded orders");
		book = book.with_orders(orders);
	}

	Ok(Box::new(book))
}

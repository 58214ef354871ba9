//! Relay assembly and runtime.
//!
//! [`RelayBuilder`] turns a [`relay_config::Config`] plus a set of named
//! backend factories into a [`RelayEngine`]; the engine runs the matcher,
//! submitter and their pollers as background tasks until shut down.

mod builder;
mod engine;
mod error;

pub use builder::RelayBuilder;
pub use engine::{EngineIntervals, RelayEngine};
pub use error::RelayError;

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use relay_account::implementations::local::create_account;
	use relay_config::{Config, ConfigLoader};
	use relay_delivery::{DeliveryError, DeliveryInterface, ReceiptInfo};
	use relay_orderbook::implementations::memory::MemoryOrderBook;
	use relay_orderbook::OrderBookInterface;
	use relay_pricing::implementations::fixed::create_price_feed;
	use relay_storage::implementations::memory::create_storage;
	use relay_submitter::SubmitterError;
	use relay_types::{
		rat_from_int, Address, BlockEvent, BlockView, Bytes, ConfigSchema, Order, OrderState, B256,
		U256,
	};
	use std::sync::{Arc, Mutex};
	use std::time::Duration;

	const TOKEN_X: Address = Address::repeat_byte(0x0a);
	const TOKEN_Y: Address = Address::repeat_byte(0x0b);
	const PROTOCOL: Address = Address::repeat_byte(0x01);
	const DELEGATE: Address = Address::repeat_byte(0x02);
	const FEE_RECEIPT: Address = Address::repeat_byte(0xfe);

	const CONFIG: &str = r#"
[relay]
name = "engine-test"
chain_id = 1

[storage]
backend = "memory"

[accounts]
keys = [{ private_key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80" }]

[delivery]
backend = "fake"

[pricing]
backend = "fixed"

[pricing.config]
eth_price = "2000"
tokens = [
	{ address = "0x1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c", price = "1", decimals = 0 },
	{ address = "0x0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a", price = "1", decimals = 0 },
	{ address = "0x0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b", price = "1", decimals = 0 },
]

[orderbook]
backend = "memory"

[miner]
fee_receipt = "0xfefefefefefefefefefefefefefefefefefefefe"
min_gas_price = 1000000000
max_gas_price = 1000000000
senders = [{ address = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266", max_pending_count = 10 }]

[matcher]
round_duration_secs = 1
block_poll_secs = 1
receipt_poll_secs = 1
mined_poll_secs = 1

[[protocols]]
contract = "0x0101010101010101010101010101010101010101"
delegate = "0x0202020202020202020202020202020202020202"
lrc_token = "0x1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c"

[[markets]]
token_a = "0x0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a"
token_b = "0x0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b"
"#;

	/// A ledger that mines every transaction it accepts.
	#[derive(Default)]
	struct Ledger {
		sent: Mutex<Vec<B256>>,
	}

	struct FakeLedger(Arc<Ledger>);

	#[async_trait]
	impl DeliveryInterface for FakeLedger {
		fn config_schema(&self) -> Box<dyn ConfigSchema> {
			unimplemented!()
		}

		fn chain_id(&self) -> u64 {
			1
		}

		async fn estimate_gas(&self, _: Address, _: Address, _: &Bytes) -> Result<u64, DeliveryError> {
			Ok(300_000)
		}

		async fn gas_price(&self) -> Result<u128, DeliveryError> {
			Ok(1_000_000_000)
		}

		async fn send_raw_transaction(&self, _: &Bytes) -> Result<B256, DeliveryError> {
			let mut sent = self.0.sent.lock().unwrap();
			let hash = B256::from(U256::from(sent.len() + 1));
			sent.push(hash);
			Ok(hash)
		}

		async fn transaction_count(&self, _: Address, _: BlockView) -> Result<u64, DeliveryError> {
			Ok(0)
		}

		async fn balance_and_allowance(
			&self,
			owner: Address,
			_: Address,
			_: Address,
		) -> Result<(U256, U256), DeliveryError> {
			if owner == FEE_RECEIPT {
				Ok((U256::ZERO, U256::ZERO))
			} else {
				Ok((U256::from(1_000_000u64), U256::from(1_000_000u64)))
			}
		}

		async fn latest_block(&self) -> Result<BlockEvent, DeliveryError> {
			Ok(BlockEvent {
				number: 7,
				timestamp: 1_700_000_000,
				gas_prices: vec![1_000_000_000],
			})
		}

		async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<ReceiptInfo>, DeliveryError> {
			let mined = self.0.sent.lock().unwrap().contains(&tx_hash);
			Ok(mined.then_some(ReceiptInfo {
				block_number: 8,
				gas_used: 250_000,
				success: true,
			}))
		}
	}

	fn order(owner: u8, token_s: Address, token_b: Address, amount_s: u64, amount_b: u64) -> OrderState {
		let mut order = Order {
			protocol: PROTOCOL,
			delegate_address: DELEGATE,
			auth_addr: Address::ZERO,
			wallet_address: Address::ZERO,
			token_s,
			token_b,
			amount_s: U256::from(amount_s),
			amount_b: U256::from(amount_b),
			valid_since: 0,
			valid_until: u64::MAX,
			lrc_fee: U256::from(100u64),
			buy_no_more_than_amount_b: false,
			margin_split_percentage: 50,
			v: 27,
			r: B256::ZERO,
			s: B256::ZERO,
			owner: Address::repeat_byte(owner),
			hash: B256::ZERO,
		};
		order.seal();
		OrderState::new(order)
	}

	fn config() -> Config {
		ConfigLoader::new().parse(CONFIG).unwrap()
	}

	fn builder(config: Config, ledger: Arc<Ledger>, orders: Vec<OrderState>) -> RelayBuilder {
		RelayBuilder::new(config)
			.with_storage_factory("memory", create_storage)
			.with_account_factory("local", create_account)
			.with_delivery_factory("fake", move |_| {
				Ok(Box::new(FakeLedger(ledger.clone())) as Box<dyn DeliveryInterface>)
			})
			.with_pricing_factory("fixed", create_price_feed)
			.with_orderbook_factory("memory", move |_, pricing| {
				Ok(Box::new(
					MemoryOrderBook::new(pricing, rat_from_int(0)).with_orders(orders.clone()),
				) as Box<dyn OrderBookInterface>)
			})
	}

	#[tokio::test]
	async fn test_build_rejects_unknown_backend() {
		let mut config = config();
		config.storage.backend = "redis".to_string();

		let result = builder(config, Arc::default(), vec![]).build().await;
		assert!(matches!(result, Err(RelayError::Config(msg)) if msg.contains("redis")));
	}

	#[tokio::test]
	async fn test_build_rejects_sender_without_key() {
		let mut config = config();
		config.miner.senders[0].address = Address::repeat_byte(0x77);

		let result = builder(config, Arc::default(), vec![]).build().await;
		assert!(matches!(
			result,
			Err(RelayError::Submitter(SubmitterError::Config(_)))
		));
	}

	#[tokio::test]
	async fn test_engine_cannot_start_twice() {
		let engine = builder(config(), Arc::default(), vec![]).build().await.unwrap();

		engine.start().await.unwrap();
		assert!(matches!(engine.start().await, Err(RelayError::Lifecycle(_))));
		engine.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn test_engine_submits_and_settles_ring() {
		let ledger = Arc::new(Ledger::default());
		let orders = vec![
			order(1, TOKEN_X, TOKEN_Y, 300, 4000),
			order(2, TOKEN_Y, TOKEN_X, 4000, 300),
		];
		let engine = builder(config(), ledger.clone(), orders).build().await.unwrap();
		assert_eq!(engine.matcher().market_count().await, 1);

		engine.start().await.unwrap();

		let mut settled = false;
		for _ in 0..100 {
			tokio::time::sleep(Duration::from_millis(100)).await;
			let sent = !ledger.sent.lock().unwrap().is_empty();
			if sent && engine.cache().last_mined_record_id().await.unwrap() >= 1 {
				settled = true;
				break;
			}
		}
		engine.shutdown().await.unwrap();

		assert!(settled, "ring was not submitted and indexed in time");
		assert_eq!(engine.submitter().current_block_time(), 1_700_000_000);
	}
}

//! Spendable balances seen by the matcher.

use async_trait::async_trait;
use num::BigRational;
use relay_cache::DedupCache;
use relay_delivery::DeliveryService;
use relay_evaluator::{BalanceProvider, EvaluatorError};
use relay_types::{rat_from_u256, Address};
use std::sync::Arc;
use tracing::debug;

/// Balance capped by allowance, minus what pending rings already committed.
pub struct AccountBalances {
	delivery: Arc<DeliveryService>,
	cache: Arc<DedupCache>,
}

impl AccountBalances {
	pub fn new(delivery: Arc<DeliveryService>, cache: Arc<DedupCache>) -> Self {
		Self { delivery, cache }
	}
}

#[async_trait]
impl BalanceProvider for AccountBalances {
	async fn available_amount(
		&self,
		owner: Address,
		token: Address,
		spender: Address,
	) -> Result<BigRational, EvaluatorError> {
		let (balance, allowance) = self
			.delivery
			.balance_and_allowance(owner, token, spender)
			.await
			.map_err(|e| EvaluatorError::Balance(e.to_string()))?;
		let matched = self
			.cache
			.filled_amount_s(&owner, &token)
			.await
			.map_err(|e| EvaluatorError::Balance(e.to_string()))?;

		let available = rat_from_u256(balance.min(allowance)) - &matched;
		debug!(
			owner = %owner,
			token = %token,
			balance = %balance,
			allowance = %allowance,
			matched = %matched,
			"Available amount"
		);
		Ok(available)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use relay_account::AccountService;
	use relay_cache::DEFAULT_CACHE_TTL;
	use relay_delivery::{DeliveryError, DeliveryInterface, ReceiptInfo};
	use relay_storage::implementations::memory::MemoryStorage;
	use relay_storage::StorageService;
	use relay_types::{
		rat_from_int, BlockEvent, BlockView, Bytes, ConfigSchema, FilledOrder, Order, OrderState,
		Ring, RingSubmitInfo, B256, U256,
	};

	struct TokenLedger {
		balance: u64,
		allowance: u64,
	}

	#[async_trait]
	impl DeliveryInterface for TokenLedger {
		fn config_schema(&self) -> Box<dyn ConfigSchema> {
			unimplemented!()
		}

		fn chain_id(&self) -> u64 {
			1
		}

		async fn estimate_gas(&self, _: Address, _: Address, _: &Bytes) -> Result<u64, DeliveryError> {
			Ok(0)
		}

		async fn gas_price(&self) -> Result<u128, DeliveryError> {
			Ok(0)
		}

		async fn send_raw_transaction(&self, _: &Bytes) -> Result<B256, DeliveryError> {
			Err(DeliveryError::Broadcast("unused".into()))
		}

		async fn transaction_count(&self, _: Address, _: BlockView) -> Result<u64, DeliveryError> {
			Ok(0)
		}

		async fn balance_and_allowance(
			&self,
			_: Address,
			_: Address,
			_: Address,
		) -> Result<(U256, U256), DeliveryError> {
			Ok((U256::from(self.balance), U256::from(self.allowance)))
		}

		async fn latest_block(&self) -> Result<BlockEvent, DeliveryError> {
			Err(DeliveryError::Network("unused".into()))
		}

		async fn transaction_receipt(&self, _: B256) -> Result<Option<ReceiptInfo>, DeliveryError> {
			Ok(None)
		}
	}

	fn pending_ring(owner: Address, token_s: Address, fill_s: i64) -> RingSubmitInfo {
		let mut order = Order {
			protocol: Address::ZERO,
			delegate_address: Address::ZERO,
			auth_addr: Address::ZERO,
			wallet_address: Address::ZERO,
			token_s,
			token_b: Address::repeat_byte(0x0b),
			amount_s: U256::from(1_000u64),
			amount_b: U256::from(1_000u64),
			valid_since: 0,
			valid_until: u64::MAX,
			lrc_fee: U256::ZERO,
			buy_no_more_than_amount_b: false,
			margin_split_percentage: 0,
			v: 27,
			r: B256::ZERO,
			s: B256::ZERO,
			owner,
			hash: B256::ZERO,
		};
		order.seal();
		let mut filled = FilledOrder::new(
			OrderState::new(order),
			rat_from_int(0),
			rat_from_int(1_000),
			Address::ZERO,
		);
		filled.fill_amount_s = rat_from_int(fill_s);
		filled.fill_amount_b = rat_from_int(fill_s);
		let ring = Ring::new(vec![filled]);
		RingSubmitInfo {
			protocol_address: Address::ZERO,
			orders_count: 1,
			protocol_data: Bytes::new(),
			protocol_gas: 0,
			protocol_gas_price: 0,
			miner: Address::ZERO,
			ring_hash: B256::repeat_byte(0x44),
			unique_id: ring.generate_unique_id(),
			submit_tx_hash: None,
			raw_ring: ring,
		}
	}

	#[tokio::test]
	async fn test_available_is_capped_by_allowance_and_pending_fills() {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let cache = Arc::new(DedupCache::new(storage, DEFAULT_CACHE_TTL));
		let delivery = Arc::new(DeliveryService::new(
			Box::new(TokenLedger {
				balance: 900,
				allowance: 500,
			}),
			Arc::new(AccountService::new(vec![])),
		));
		let balances = AccountBalances::new(delivery, cache.clone());

		let owner = Address::repeat_byte(0x05);
		let token = Address::repeat_byte(0x0a);
		let spender = Address::repeat_byte(0x02);
		assert_eq!(
			balances.available_amount(owner, token, spender).await.unwrap(),
			rat_from_int(500)
		);

		cache.add_mined_ring(&pending_ring(owner, token, 120)).await.unwrap();
		assert_eq!(
			balances.available_amount(owner, token, spender).await.unwrap(),
			rat_from_int(380)
		);
	}
}

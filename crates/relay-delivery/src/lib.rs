//! Ledger access for the relay.
//!
//! [`DeliveryInterface`] is the contract the relay consumes from a ledger
//! node: gas estimation, raw transaction broadcast, transaction counts,
//! token balances and blocks. [`DeliveryService`] adds transaction signing
//! through the sender accounts and a bounded retry for read calls.

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use relay_account::{AccountError, AccountService};
use relay_types::{
	Address, BlockEvent, BlockView, Bytes, ConfigSchema, Transaction, B256, U256,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub mod implementations {
	pub mod evm {
		pub mod alloy;
	}
}

#[derive(Debug, Error)]
pub enum DeliveryError {
	#[error("Network error: {0}")]
	Network(String),
	#[error("Gas estimation failed: {0}")]
	Estimation(String),
	#[error("Broadcast failed: {0}")]
	Broadcast(String),
	#[error("Account error: {0}")]
	Account(#[from] AccountError),
	#[error("Invalid configuration: {0}")]
	Config(String),
}

/// Outcome of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptInfo {
	pub block_number: u64,
	pub gas_used: u64,
	pub success: bool,
}

#[async_trait]
pub trait DeliveryInterface: Send + Sync {
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	fn chain_id(&self) -> u64;

	/// Gas a call would consume if mined now. Reverting calls fail.
	async fn estimate_gas(&self, from: Address, to: Address, data: &Bytes)
		-> Result<u64, DeliveryError>;

	async fn gas_price(&self) -> Result<u128, DeliveryError>;

	async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256, DeliveryError>;

	async fn transaction_count(&self, address: Address, view: BlockView)
		-> Result<u64, DeliveryError>;

	/// ERC20 `(balanceOf(owner), allowance(owner, spender))`.
	async fn balance_and_allowance(
		&self,
		owner: Address,
		token: Address,
		spender: Address,
	) -> Result<(U256, U256), DeliveryError>;

	async fn latest_block(&self) -> Result<BlockEvent, DeliveryError>;

	async fn transaction_receipt(&self, tx_hash: B256)
		-> Result<Option<ReceiptInfo>, DeliveryError>;
}

/// Default number of attempts for read calls.
pub const DEFAULT_MAX_ATTEMPTS: usize = 2;

/// Exponential policy starting at `initial`, giving up after 30 seconds.
fn retry_policy(initial: Duration) -> ExponentialBackoff {
	ExponentialBackoff {
		initial_interval: initial,
		current_interval: initial,
		max_elapsed_time: Some(Duration::from_secs(30)),
		..Default::default()
	}
}

pub struct DeliveryService {
	provider: Box<dyn DeliveryInterface>,
	accounts: Arc<AccountService>,
	max_attempts: usize,
	backoff: ExponentialBackoff,
}

impl DeliveryService {
	pub fn new(provider: Box<dyn DeliveryInterface>, accounts: Arc<AccountService>) -> Self {
		Self {
			provider,
			accounts,
			max_attempts: DEFAULT_MAX_ATTEMPTS,
			backoff: retry_policy(Duration::from_millis(200)),
		}
	}

	pub fn with_retry(mut self, max_attempts: usize, retry_delay: Duration) -> Self {
		self.max_attempts = max_attempts.max(1);
		self.backoff = retry_policy(retry_delay);
		self
	}

	pub fn accounts(&self) -> &Arc<AccountService> {
		&self.accounts
	}

	pub fn chain_id(&self) -> u64 {
		self.provider.chain_id()
	}

	/// Runs a read call up to `max_attempts` times, backing off exponentially
	/// between attempts.
	async fn retry_call<T, F, Fut>(&self, op: &str, call: F) -> Result<T, DeliveryError>
	where
		F: Fn() -> Fut,
		Fut: Future<Output = Result<T, DeliveryError>>,
	{
		let mut backoff = self.backoff.clone();
		backoff.reset();
		let mut attempts = 0;

		loop {
			match call().await {
				Ok(value) => return Ok(value),
				Err(e) => {
					attempts += 1;
					if attempts >= self.max_attempts {
						return Err(e);
					}
					let Some(delay) = backoff.next_backoff() else {
						warn!(op, attempts, error = %e, "Ledger call failed, backoff exhausted");
						return Err(e);
					};
					warn!(op, attempts, ?delay, error = %e, "Ledger call failed, retrying");
					tokio::time::sleep(delay).await;
				}
			}
		}
	}

	/// Dry-runs a call and returns `(gas, gas_price)`.
	pub async fn estimate_gas(
		&self,
		from: Address,
		to: Address,
		data: &Bytes,
	) -> Result<(u64, u128), DeliveryError> {
		let gas = self
			.retry_call("estimate_gas", || self.provider.estimate_gas(from, to, data))
			.await?;
		let gas_price = self
			.retry_call("gas_price", || self.provider.gas_price())
			.await?;
		Ok((gas, gas_price))
	}

	pub async fn transaction_count(
		&self,
		address: Address,
		view: BlockView,
	) -> Result<u64, DeliveryError> {
		self.retry_call("transaction_count", || {
			self.provider.transaction_count(address, view)
		})
		.await
	}

	pub async fn balance_and_allowance(
		&self,
		owner: Address,
		token: Address,
		spender: Address,
	) -> Result<(U256, U256), DeliveryError> {
		self.retry_call("balance_and_allowance", || {
			self.provider.balance_and_allowance(owner, token, spender)
		})
		.await
	}

	pub async fn latest_block(&self) -> Result<BlockEvent, DeliveryError> {
		self.retry_call("latest_block", || self.provider.latest_block())
			.await
	}

	pub async fn transaction_receipt(
		&self,
		tx_hash: B256,
	) -> Result<Option<ReceiptInfo>, DeliveryError> {
		self.retry_call("transaction_receipt", || {
			self.provider.transaction_receipt(tx_hash)
		})
		.await
	}

	/// Signs a legacy transaction with `sender` and broadcasts it once.
	///
	/// Broadcast is not retried here; the caller owns the nonce and decides.
	#[allow(clippy::too_many_arguments)]
	pub async fn sign_and_send_transaction(
		&self,
		sender: Address,
		to: Address,
		gas: u64,
		gas_price: u128,
		value: U256,
		data: Bytes,
		nonce: u64,
	) -> Result<B256, DeliveryError> {
		let tx = Transaction {
			to,
			data,
			value,
			chain_id: self.provider.chain_id(),
			nonce,
			gas_limit: gas,
			gas_price,
		};
		let raw = self.accounts.sign(&sender, &tx).await?;
		let tx_hash = self.provider.send_raw_transaction(&raw).await?;
		debug!(sender = %sender, nonce, tx_hash = %tx_hash, "Broadcast transaction");
		Ok(tx_hash)
	}
}

//! Sender accounts for ring submission.
//!
//! The submitter rotates between several sender addresses. Each one is
//! backed by an [`AccountInterface`] that signs legacy transactions and
//! returns the raw encoded bytes ready for broadcast.

use async_trait::async_trait;
use relay_types::{Address, Bytes, ConfigSchema, Transaction};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

pub mod implementations {
	pub mod local;
}

#[derive(Debug, Error)]
pub enum AccountError {
	#[error("Signing failed: {0}")]
	SigningFailed(String),
	#[error("Invalid key: {0}")]
	InvalidKey(String),
	#[error("Unknown sender: {0}")]
	UnknownSender(Address),
}

#[async_trait]
pub trait AccountInterface: Send + Sync {
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	fn address(&self) -> Address;

	/// Signs the transaction and returns its raw encoding.
	async fn sign_transaction(&self, tx: &Transaction) -> Result<Bytes, AccountError>;
}

/// All sender accounts, indexed by address.
pub struct AccountService {
	accounts: HashMap<Address, Box<dyn AccountInterface>>,
}

impl AccountService {
	pub fn new(accounts: Vec<Box<dyn AccountInterface>>) -> Self {
		let accounts: HashMap<_, _> = accounts
			.into_iter()
			.map(|account| (account.address(), account))
			.collect();
		debug!(accounts = accounts.len(), "Loaded sender accounts");
		Self { accounts }
	}

	pub fn contains(&self, address: &Address) -> bool {
		self.accounts.contains_key(address)
	}

	pub fn addresses(&self) -> Vec<Address> {
		self.accounts.keys().copied().collect()
	}

	pub async fn sign(&self, sender: &Address, tx: &Transaction) -> Result<Bytes, AccountError> {
		let Some(account) = self.accounts.get(sender) else {
			warn!(sender = %sender, "No signing key for sender");
			return Err(AccountError::UnknownSender(*sender));
		};
		account.sign_transaction(tx).await
	}
}

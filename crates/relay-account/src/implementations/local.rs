//! Local private key wallet backed by alloy's signer.

use crate::{AccountError, AccountInterface};
use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSigner;
use alloy::primitives::TxKind;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use relay_types::{
	validate_private_key, Address, Bytes, ConfigSchema, Field, FieldType, Schema, Transaction,
	ValidationError,
};
use tracing::debug;

/// Signs with a private key held in process memory.
pub struct LocalWallet {
	signer: PrivateKeySigner,
}

impl LocalWallet {
	/// Creates a wallet from a hex private key, with or without `0x`.
	pub fn new(private_key_hex: &str) -> Result<Self, AccountError> {
		let signer = private_key_hex
			.parse::<PrivateKeySigner>()
			.map_err(|e| AccountError::InvalidKey(format!("Invalid private key: {}", e)))?;

		Ok(Self { signer })
	}
}

pub struct LocalWalletSchema;

impl ConfigSchema for LocalWalletSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![Field::new("private_key", FieldType::String).with_validator(validate_private_key)],
			vec![],
		);
		schema.validate(config)
	}
}

#[async_trait]
impl AccountInterface for LocalWallet {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(LocalWalletSchema)
	}

	fn address(&self) -> Address {
		self.signer.address()
	}

	async fn sign_transaction(&self, tx: &Transaction) -> Result<Bytes, AccountError> {
		let mut legacy_tx = TxLegacy {
			chain_id: Some(tx.chain_id),
			nonce: tx.nonce,
			gas_price: tx.gas_price,
			gas_limit: tx.gas_limit,
			to: TxKind::Call(tx.to),
			value: tx.value,
			input: tx.data.clone(),
		};

		let signature = self
			.signer
			.sign_transaction(&mut legacy_tx)
			.await
			.map_err(|e| AccountError::SigningFailed(format!("Failed to sign transaction: {}", e)))?;

		let envelope = TxEnvelope::from(legacy_tx.into_signed(signature));
		debug!(
			sender = %self.signer.address(),
			nonce = tx.nonce,
			tx_hash = %envelope.tx_hash(),
			"Signed transaction"
		);
		Ok(Bytes::from(envelope.encoded_2718()))
	}
}

/// Factory function to create a local wallet from configuration.
///
/// Configuration parameters:
/// - `private_key`: 32-byte hex key
pub fn create_account(config: &toml::Value) -> Result<Box<dyn AccountInterface>, AccountError> {
	LocalWalletSchema
		.validate(config)
		.map_err(|e| AccountError::InvalidKey(e.to_string()))?;

	let private_key = config
		.get("private_key")
		.and_then(|v| v.as_str())
		.ok_or_else(|| AccountError::InvalidKey("private_key is required".to_string()))?;

	Ok(Box::new(LocalWallet::new(private_key)?))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::AccountService;
	use alloy::primitives::U256;
	use std::sync::{Arc, Mutex};

	// Well-known development key, never used on a real network.
	const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

	fn transaction(nonce: u64) -> Transaction {
		Transaction {
			to: Address::repeat_byte(0x11),
			data: Bytes::from(vec![0xde, 0xad]),
			value: U256::ZERO,
			chain_id: 1,
			nonce,
			gas_limit: 500_000,
			gas_price: 1_000_000_000,
		}
	}

	#[tokio::test]
	async fn test_sign_is_deterministic_per_nonce() {
		let wallet = LocalWallet::new(TEST_KEY).unwrap();
		assert_eq!(
			wallet.address(),
			"0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
				.parse::<Address>()
				.unwrap()
		);

		let first = wallet.sign_transaction(&transaction(0)).await.unwrap();
		let again = wallet.sign_transaction(&transaction(0)).await.unwrap();
		let next = wallet.sign_transaction(&transaction(1)).await.unwrap();
		assert_eq!(first, again);
		assert_ne!(first, next);
	}

	/// Collects formatted log lines for assertions.
	#[derive(Clone, Default)]
	struct LogCapture(Arc<Mutex<Vec<u8>>>);

	impl std::io::Write for LogCapture {
		fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
			self.0.lock().unwrap().extend_from_slice(buf);
			Ok(buf.len())
		}

		fn flush(&mut self) -> std::io::Result<()> {
			Ok(())
		}
	}

	impl LogCapture {
		fn contents(&self) -> String {
			String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
		}
	}

	#[tokio::test]
	async fn test_service_rejects_unknown_sender() {
		let logs = LogCapture::default();
		let writer = logs.clone();
		let subscriber = tracing_subscriber::fmt()
			.with_max_level(tracing::Level::DEBUG)
			.with_ansi(false)
			.with_writer(move || writer.clone())
			.finish();
		let _guard = tracing::subscriber::set_default(subscriber);

		let service = AccountService::new(vec![Box::new(LocalWallet::new(TEST_KEY).unwrap())]);
		let unknown = Address::repeat_byte(0x22);

		assert!(matches!(
			service.sign(&unknown, &transaction(0)).await,
			Err(AccountError::UnknownSender(addr)) if addr == unknown
		));
		let known = service.addresses()[0];
		service.sign(&known, &transaction(4)).await.unwrap();

		let output = logs.contents();
		assert!(output.contains("No signing key for sender"));
		assert!(output.contains("Signed transaction"));
	}

	#[test]
	fn test_factory_validates_key() {
		let bad: toml::Value = toml::from_str(r#"private_key = "0x1234""#).unwrap();
		assert!(create_account(&bad).is_err());

		let good: toml::Value = toml::from_str(&format!("private_key = \"{}\"", TEST_KEY)).unwrap();
		assert!(create_account(&good).is_ok());
	}
}

//! Ledger access over JSON-RPC using alloy.

use crate::{DeliveryError, DeliveryInterface, ReceiptInfo};
use alloy::consensus::Transaction as _;
use alloy::eips::BlockNumberOrTag;
use alloy::network::{Ethereum, TransactionBuilder};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::sol;
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use relay_types::{
	Address, BlockEvent, BlockView, Bytes, ConfigSchema, Field, FieldType, Schema,
	ValidationError, B256, U256,
};

sol! {
	function balanceOf(address owner) external view returns (uint256);
	function allowance(address owner, address spender) external view returns (uint256);
}

/// Shortens a hash for log lines.
fn truncate_hash(hash: &B256) -> String {
	let hash_str = format!("{:x}", hash);
	format!("{}..", &hash_str[..8])
}

pub struct AlloyDelivery {
	provider: Box<dyn Provider<Ethereum>>,
	chain_id: u64,
}

impl AlloyDelivery {
	pub fn new(rpc_url: &str, chain_id: u64) -> Result<Self, DeliveryError> {
		let url = rpc_url
			.parse()
			.map_err(|e| DeliveryError::Config(format!("Invalid RPC URL: {}", e)))?;

		let provider = ProviderBuilder::new().connect_http(url);

		Ok(Self {
			provider: Box::new(provider),
			chain_id,
		})
	}

	async fn erc20_call(&self, token: Address, input: Vec<u8>) -> Result<Bytes, DeliveryError> {
		let request = TransactionRequest::default()
			.with_to(token)
			.with_input(input);
		self.provider
			.call(request)
			.await
			.map_err(|e| DeliveryError::Network(format!("eth_call to {} failed: {}", token, e)))
	}
}

pub struct AlloyDeliverySchema;

impl ConfigSchema for AlloyDeliverySchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![
				Field::new("rpc_url", FieldType::String).with_validator(|value| {
					let url = value.as_str().unwrap_or_default();
					if url.starts_with("http://") || url.starts_with("https://") {
						Ok(())
					} else {
						Err("RPC URL must start with http:// or https://".to_string())
					}
				}),
				Field::new(
					"chain_id",
					FieldType::Integer {
						min: Some(1),
						max: None,
					},
				),
			],
			vec![],
		);

		schema.validate(config)
	}
}

#[async_trait]
impl DeliveryInterface for AlloyDelivery {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(AlloyDeliverySchema)
	}

	fn chain_id(&self) -> u64 {
		self.chain_id
	}

	async fn estimate_gas(
		&self,
		from: Address,
		to: Address,
		data: &Bytes,
	) -> Result<u64, DeliveryError> {
		let request = TransactionRequest::default()
			.with_from(from)
			.with_to(to)
			.with_input(data.clone());
		self.provider
			.estimate_gas(request)
			.await
			.map_err(|e| DeliveryError::Estimation(e.to_string()))
	}

	async fn gas_price(&self) -> Result<u128, DeliveryError> {
		self.provider
			.get_gas_price()
			.await
			.map_err(|e| DeliveryError::Network(format!("Failed to get gas price: {}", e)))
	}

	async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256, DeliveryError> {
		let pending = self
			.provider
			.send_raw_transaction(raw)
			.await
			.map_err(|e| DeliveryError::Broadcast(e.to_string()))?;

		let tx_hash = *pending.tx_hash();
		tracing::info!(tx_hash = %truncate_hash(&tx_hash), "Submitted transaction");
		Ok(tx_hash)
	}

	async fn transaction_count(
		&self,
		address: Address,
		view: BlockView,
	) -> Result<u64, DeliveryError> {
		let call = self.provider.get_transaction_count(address);
		let result = match view {
			BlockView::Latest => call.latest().await,
			BlockView::Pending => call.pending().await,
		};
		result.map_err(|e| DeliveryError::Network(format!("Failed to get nonce: {}", e)))
	}

	async fn balance_and_allowance(
		&self,
		owner: Address,
		token: Address,
		spender: Address,
	) -> Result<(U256, U256), DeliveryError> {
		let raw_balance = self
			.erc20_call(token, balanceOfCall { owner }.abi_encode())
			.await?;
		let raw_allowance = self
			.erc20_call(token, allowanceCall { owner, spender }.abi_encode())
			.await?;

		let balance = balanceOfCall::abi_decode_returns(&raw_balance)
			.map_err(|e| DeliveryError::Network(format!("Bad balanceOf result: {}", e)))?;
		let allowance = allowanceCall::abi_decode_returns(&raw_allowance)
			.map_err(|e| DeliveryError::Network(format!("Bad allowance result: {}", e)))?;
		Ok((balance, allowance))
	}

	async fn latest_block(&self) -> Result<BlockEvent, DeliveryError> {
		let block = self
			.provider
			.get_block_by_number(BlockNumberOrTag::Latest)
			.full()
			.await
			.map_err(|e| DeliveryError::Network(format!("Failed to get block: {}", e)))?
			.ok_or_else(|| DeliveryError::Network("Latest block not available".to_string()))?;

		let gas_prices = block
			.transactions
			.txns()
			.map(|tx| tx.gas_price().unwrap_or_else(|| tx.max_fee_per_gas()))
			.collect();

		Ok(BlockEvent {
			number: block.header.number,
			timestamp: block.header.timestamp,
			gas_prices,
		})
	}

	async fn transaction_receipt(
		&self,
		tx_hash: B256,
	) -> Result<Option<ReceiptInfo>, DeliveryError> {
		let receipt = self
			.provider
			.get_transaction_receipt(tx_hash)
			.await
			.map_err(|e| DeliveryError::Network(format!("Failed to get receipt: {}", e)))?;

		Ok(receipt.map(|receipt| ReceiptInfo {
			block_number: receipt.block_number.unwrap_or(0),
			gas_used: receipt.gas_used,
			success: receipt.status(),
		}))
	}
}

/// Factory function to create an HTTP ledger connection from configuration.
///
/// Configuration parameters:
/// - `rpc_url`: The HTTP RPC endpoint URL
/// - `chain_id`: The chain id transactions are signed for
pub fn create_http_delivery(
	config: &toml::Value,
) -> Result<Box<dyn DeliveryInterface>, DeliveryError> {
	AlloyDeliverySchema
		.validate(config)
		.map_err(|e| DeliveryError::Config(e.to_string()))?;

	let rpc_url = config
		.get("rpc_url")
		.and_then(|v| v.as_str())
		.ok_or_else(|| DeliveryError::Config("rpc_url is required".to_string()))?;
	let chain_id = config
		.get("chain_id")
		.and_then(|v| v.as_integer())
		.ok_or_else(|| DeliveryError::Config("chain_id is required".to_string()))?;

	Ok(Box::new(AlloyDelivery::new(rpc_url, chain_id as u64)?))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_schema_rejects_bad_url() {
		let config: toml::Value = toml::from_str(
			r#"
rpc_url = "ws://localhost:8545"
chain_id = 1
"#,
		)
		.unwrap();
		assert!(create_http_delivery(&config).is_err());
	}

	#[test]
	fn test_erc20_call_encoding() {
		let owner = Address::repeat_byte(0x01);
		let encoded = balanceOfCall { owner }.abi_encode();
		// selector + one word
		assert_eq!(encoded.len(), 4 + 32);
		assert_eq!(&encoded[..4], &[0x70, 0xa0, 0x82, 0x31]);
	}

	#[test]
	fn test_truncate_hash() {
		assert_eq!(truncate_hash(&B256::repeat_byte(0xab)), "abababab..");
	}
}

//! Ledger-facing transaction and protocol types.

use alloy::primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

/// An unsigned legacy transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
	pub to: Address,
	pub data: Bytes,
	pub value: U256,
	pub chain_id: u64,
	pub nonce: u64,
	pub gas_limit: u64,
	pub gas_price: u128,
}

/// Which view of the account state a transaction-count query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockView {
	Latest,
	Pending,
}

/// Addresses of one deployed settlement protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolAddress {
	/// Ring settlement contract.
	pub contract: Address,
	/// Token transfer delegate the owners approve.
	pub delegate: Address,
	pub lrc_token: Address,
}

/// Unordered token pair traded by one market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenPair {
	pub token_a: Address,
	pub token_b: Address,
}

/// What to do when every sender has too many pending transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
	/// Use the first configured sender anyway.
	#[default]
	FirstConfigured,
	/// Refuse to submit until a sender frees up.
	None,
}

/// A sender account and the number of unmined transactions it may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderAddress {
	pub address: Address,
	pub max_pending_count: u64,
}

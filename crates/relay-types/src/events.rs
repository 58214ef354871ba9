//! Messages exchanged over the relay's typed channels.

use alloy::primitives::B256;
use serde::{Deserialize, Serialize};

use crate::ring::RingSubmitInfo;

/// Rings matched in one market round, handed to the submitter together.
pub type RingBatch = Vec<RingSubmitInfo>;

/// On-chain fate of a ring submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
	Unknown,
	Pending,
	Success,
	Failed,
}

impl TxStatus {
	/// Terminal statuses release the ring from the dedup cache.
	pub fn is_terminal(&self) -> bool {
		!matches!(self, TxStatus::Pending)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSubmitResult {
	pub ring_hash: B256,
	pub unique_id: B256,
	pub tx_hash: B256,
	pub status: TxStatus,
	pub ring_index: Option<u64>,
	pub block_number: Option<u64>,
	pub used_gas: Option<u64>,
	pub error: Option<String>,
}

/// A new block observed on the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEvent {
	pub number: u64,
	/// Unix seconds.
	pub timestamp: u64,
	/// Gas prices paid by the block's transactions.
	pub gas_prices: Vec<u128>,
}

//! Durable submission records.
//!
//! Every submitted ring leaves a [`SubmitRecord`] and one
//! [`FilledOrderRecord`] per order. Mined transactions are appended as
//! [`RingMinedRecord`]s with increasing ids, which the submitter reads back
//! through a resumable cursor.

use async_trait::async_trait;
use num::BigRational;
use relay_storage::{StorageError, StorageService};
use relay_types::{
	serde_rational, Address, Bytes, FilledOrder, RingSubmitInfo, RingSubmitResult, TxStatus, B256,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

const SUBMIT_INFO_NS: &str = "ring_submit_info";
const SUBMIT_TX_NS: &str = "ring_submit_tx";
const FILLED_ORDER_NS: &str = "filled_order";
const RING_MINED_NS: &str = "ring_mined";
const RING_MINED_TX_NS: &str = "ring_mined_tx";
const RING_MINED_SEQ_NS: &str = "ring_mined_seq";
const RING_MINED_SEQ_ID: &str = "last";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRecord {
	pub ring_hash: B256,
	pub unique_id: B256,
	pub protocol_address: Address,
	pub orders_count: usize,
	pub protocol_data: Bytes,
	pub protocol_gas: u64,
	pub protocol_gas_price: u128,
	pub miner: Address,
	pub tx_hash: Option<B256>,
	pub status: TxStatus,
	pub block_number: Option<u64>,
	pub used_gas: Option<u64>,
	pub error: Option<String>,
	#[serde(with = "serde_rational")]
	pub received: BigRational,
	#[serde(with = "serde_rational")]
	pub legal_fee: BigRational,
	/// Unix seconds.
	pub created_at: i64,
}

impl SubmitRecord {
	pub fn new(info: &RingSubmitInfo, status: TxStatus, error: Option<String>) -> Self {
		Self {
			ring_hash: info.ring_hash,
			unique_id: info.unique_id,
			protocol_address: info.protocol_address,
			orders_count: info.orders_count,
			protocol_data: info.protocol_data.clone(),
			protocol_gas: info.protocol_gas,
			protocol_gas_price: info.protocol_gas_price,
			miner: info.miner,
			tx_hash: info.submit_tx_hash,
			status,
			block_number: None,
			used_gas: None,
			error,
			received: info.raw_ring.received.clone(),
			legal_fee: info.raw_ring.legal_fee.clone(),
			created_at: chrono::Utc::now().timestamp(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilledOrderRecord {
	pub ring_hash: B256,
	pub order_hash: B256,
	pub owner: Address,
	pub token_s: Address,
	pub token_b: Address,
	pub fee_selection: u8,
	#[serde(with = "serde_rational")]
	pub fill_amount_s: BigRational,
	#[serde(with = "serde_rational")]
	pub fill_amount_b: BigRational,
	#[serde(with = "serde_rational")]
	pub rate_amount_s: BigRational,
	#[serde(with = "serde_rational")]
	pub lrc_fee: BigRational,
	#[serde(with = "serde_rational")]
	pub lrc_reward: BigRational,
	#[serde(with = "serde_rational")]
	pub fee_s: BigRational,
	#[serde(with = "serde_rational")]
	pub legal_fee_s: BigRational,
}

impl FilledOrderRecord {
	pub fn new(ring_hash: B256, filled: &FilledOrder) -> Self {
		let order = filled.order();
		Self {
			ring_hash,
			order_hash: order.hash,
			owner: order.owner,
			token_s: order.token_s,
			token_b: order.token_b,
			fee_selection: filled.fee_selection,
			fill_amount_s: filled.fill_amount_s.clone(),
			fill_amount_b: filled.fill_amount_b.clone(),
			rate_amount_s: filled.rate_amount_s.clone(),
			lrc_fee: filled.lrc_fee.clone(),
			lrc_reward: filled.lrc_reward.clone(),
			fee_s: filled.fee_s.clone(),
			legal_fee_s: filled.legal_fee_s.clone(),
		}
	}
}

/// Outcome of a mined settlement transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingMinedRecord {
	/// Assigned on append, strictly increasing.
	#[serde(default)]
	pub id: u64,
	pub tx_hash: B256,
	pub block_number: u64,
	pub used_gas: u64,
	pub status: TxStatus,
	pub error: Option<String>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
	async fn save_submit_info(&self, record: &SubmitRecord) -> Result<(), StorageError>;

	async fn save_filled_order(&self, record: &FilledOrderRecord) -> Result<(), StorageError>;

	/// Applies a submission result to the stored record, if any.
	async fn update_result(&self, result: &RingSubmitResult) -> Result<(), StorageError>;

	async fn submit_info(&self, ring_hash: &B256) -> Result<Option<SubmitRecord>, StorageError>;

	/// Records of every ring sent in `tx_hash`.
	async fn ring_infos_by_tx(&self, tx_hash: &B256) -> Result<Vec<SubmitRecord>, StorageError>;

	/// Records still waiting for their transaction to be mined.
	async fn pending_submit_infos(&self) -> Result<Vec<SubmitRecord>, StorageError>;

	/// Appends a mined record and returns its id, or `None` when the
	/// transaction was already recorded.
	async fn append_ring_mined(&self, record: RingMinedRecord)
		-> Result<Option<u64>, StorageError>;

	/// Up to `limit` mined records with an id above `after_id`, ascending.
	async fn ring_mined_records(
		&self,
		after_id: u64,
		limit: usize,
	) -> Result<Vec<RingMinedRecord>, StorageError>;
}

fn hex_id(hash: &B256) -> String {
	format!("{:#x}", hash)
}

fn mined_id(id: u64) -> String {
	format!("{:020}", id)
}

/// [`RecordStore`] on top of the relay's key-value storage. Records carry
/// no time-to-live.
pub struct StorageRecordStore {
	storage: Arc<StorageService>,
	append_lock: Mutex<()>,
}

impl StorageRecordStore {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self {
			storage,
			append_lock: Mutex::new(()),
		}
	}
}

#[async_trait]
impl RecordStore for StorageRecordStore {
	async fn save_submit_info(&self, record: &SubmitRecord) -> Result<(), StorageError> {
		let ring_id = hex_id(&record.ring_hash);
		self.storage.store(SUBMIT_INFO_NS, &ring_id, record).await?;
		if let Some(tx_hash) = record.tx_hash.filter(|hash| !hash.is_zero()) {
			self.storage
				.set_add(SUBMIT_TX_NS, &hex_id(&tx_hash), &[ring_id], None)
				.await?;
		}
		Ok(())
	}

	async fn save_filled_order(&self, record: &FilledOrderRecord) -> Result<(), StorageError> {
		let id = format!(
			"{}_{}",
			hex_id(&record.ring_hash),
			hex_id(&record.order_hash)
		);
		self.storage.store(FILLED_ORDER_NS, &id, record).await
	}

	async fn update_result(&self, result: &RingSubmitResult) -> Result<(), StorageError> {
		let Some(mut record) = self.submit_info(&result.ring_hash).await? else {
			return Ok(());
		};
		record.status = result.status;
		if !result.tx_hash.is_zero() {
			record.tx_hash = Some(result.tx_hash);
		}
		record.block_number = result.block_number.or(record.block_number);
		record.used_gas = result.used_gas.or(record.used_gas);
		record.error = result.error.clone().or(record.error);
		self.save_submit_info(&record).await
	}

	async fn submit_info(&self, ring_hash: &B256) -> Result<Option<SubmitRecord>, StorageError> {
		self.storage
			.retrieve_optional(SUBMIT_INFO_NS, &hex_id(ring_hash))
			.await
	}

	async fn ring_infos_by_tx(&self, tx_hash: &B256) -> Result<Vec<SubmitRecord>, StorageError> {
		let ring_ids = self
			.storage
			.set_members(SUBMIT_TX_NS, &hex_id(tx_hash))
			.await?;
		let mut records = Vec::with_capacity(ring_ids.len());
		for ring_id in ring_ids {
			if let Some(record) = self
				.storage
				.retrieve_optional::<SubmitRecord>(SUBMIT_INFO_NS, &ring_id)
				.await?
			{
				records.push(record);
			}
		}
		Ok(records)
	}

	async fn pending_submit_infos(&self) -> Result<Vec<SubmitRecord>, StorageError> {
		let mut records = Vec::new();
		for ring_id in self.storage.list_ids(SUBMIT_INFO_NS).await? {
			if let Some(record) = self
				.storage
				.retrieve_optional::<SubmitRecord>(SUBMIT_INFO_NS, &ring_id)
				.await?
			{
				if record.status == TxStatus::Pending && record.tx_hash.is_some() {
					records.push(record);
				}
			}
		}
		Ok(records)
	}

	async fn append_ring_mined(
		&self,
		mut record: RingMinedRecord,
	) -> Result<Option<u64>, StorageError> {
		let _guard = self.append_lock.lock().await;
		let tx_id = hex_id(&record.tx_hash);
		if self.storage.exists(RING_MINED_TX_NS, &tx_id).await? {
			return Ok(None);
		}

		let last: u64 = self
			.storage
			.retrieve_optional(RING_MINED_SEQ_NS, RING_MINED_SEQ_ID)
			.await?
			.unwrap_or(0);
		record.id = last + 1;

		self.storage
			.store(RING_MINED_NS, &mined_id(record.id), &record)
			.await?;
		self.storage
			.store(RING_MINED_TX_NS, &tx_id, &record.id)
			.await?;
		self.storage
			.store(RING_MINED_SEQ_NS, RING_MINED_SEQ_ID, &record.id)
			.await?;
		Ok(Some(record.id))
	}

	async fn ring_mined_records(
		&self,
		after_id: u64,
		limit: usize,
	) -> Result<Vec<RingMinedRecord>, StorageError> {
		let mut ids: Vec<u64> = self
			.storage
			.list_ids(RING_MINED_NS)
			.await?
			.iter()
			.filter_map(|id| id.parse().ok())
			.filter(|id| *id > after_id)
			.collect();
		ids.sort_unstable();
		ids.truncate(limit);

		let mut records = Vec::with_capacity(ids.len());
		for id in ids {
			records.push(self.storage.retrieve(RING_MINED_NS, &mined_id(id)).await?);
		}
		Ok(records)
	}
}

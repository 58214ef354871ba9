//! Ring submission.
//!
//! The [`Submitter`] turns evaluated rings into signed settlement
//! transactions. It owns the sender address pool and each sender's cached
//! nonce, persists every submission, and republishes the on-chain fate of a
//! ring as [`RingSubmitResult`]s once the receipt indexer has recorded it.

use relay_cache::{CacheError, DedupCache};
use relay_delivery::{DeliveryError, DeliveryService};
use relay_storage::StorageError;
use relay_types::{
	Address, BlockView, Ring, RingBatch, RingSubmitInfo, RingSubmitResult, TxStatus, B256, U256,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

pub mod encoding;
pub mod records;

pub use encoding::encode_submit_ring;
pub use records::{FilledOrderRecord, RecordStore, RingMinedRecord, StorageRecordStore, SubmitRecord};
pub use relay_types::{FallbackPolicy, SenderAddress};

/// Page size of the mined-record poller.
pub const MINED_RECORDS_PAGE: usize = 500;

#[derive(Debug, Error)]
pub enum SubmitterError {
	#[error("Delivery error: {0}")]
	Delivery(#[from] DeliveryError),
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
	#[error("Cache error: {0}")]
	Cache(#[from] CacheError),
	#[error("No sender address available")]
	NoSender,
	#[error("Invalid ring: {0}")]
	InvalidRing(String),
	#[error("Invalid configuration: {0}")]
	Config(String),
}

#[derive(Debug, Clone)]
pub struct SubmitterConfig {
	pub fee_receipt: Address,
	/// Gas limit bounds; zero disables a bound.
	pub min_gas_limit: u64,
	pub max_gas_limit: u64,
	pub senders: Vec<SenderAddress>,
	pub fallback: FallbackPolicy,
}

pub struct Submitter {
	config: SubmitterConfig,
	delivery: Arc<DeliveryService>,
	records: Arc<dyn RecordStore>,
	cache: Arc<DedupCache>,
	nonces: Mutex<HashMap<Address, u64>>,
	/// Unix seconds of the latest block, zero before the first block.
	current_block_time: AtomicU64,
	results: mpsc::UnboundedSender<RingSubmitResult>,
}

impl Submitter {
	/// Creates the submitter, loading each sender's nonce from the pending view.
	///
	/// Every sender must have a signing account. Nonce lookup failures are
	/// logged and leave the nonce at zero until the first refresh.
	pub async fn new(
		config: SubmitterConfig,
		delivery: Arc<DeliveryService>,
		records: Arc<dyn RecordStore>,
		cache: Arc<DedupCache>,
		results: mpsc::UnboundedSender<RingSubmitResult>,
	) -> Result<Self, SubmitterError> {
		if config.senders.is_empty() {
			return Err(SubmitterError::Config(
				"at least one sender address is required".to_string(),
			));
		}

		let mut nonces = HashMap::new();
		for sender in &config.senders {
			if !delivery.accounts().contains(&sender.address) {
				return Err(SubmitterError::Config(format!(
					"no signing key for sender {}",
					sender.address
				)));
			}
			let nonce = match delivery
				.transaction_count(sender.address, BlockView::Pending)
				.await
			{
				Ok(nonce) => nonce,
				Err(e) => {
					error!(sender = %sender.address, error = %e, "Failed to load nonce");
					0
				}
			};
			nonces.insert(sender.address, nonce);
		}

		Ok(Self {
			config,
			delivery,
			records,
			cache,
			nonces: Mutex::new(nonces),
			current_block_time: AtomicU64::new(0),
			results,
		})
	}

	pub fn update_block_time(&self, timestamp: u64) {
		self.current_block_time.store(timestamp, Ordering::Relaxed);
	}

	pub fn current_block_time(&self) -> u64 {
		self.current_block_time.load(Ordering::Relaxed)
	}

	/// Next nonce to use for `sender`, as cached.
	pub async fn cached_nonce(&self, sender: &Address) -> Option<u64> {
		self.nonces.lock().await.get(sender).copied()
	}

	/// Nonce the next broadcast from `sender` will carry. Nothing is reserved
	/// until the broadcast succeeds.
	async fn next_nonce(&self, sender: Address) -> u64 {
		*self.nonces.lock().await.entry(sender).or_insert(0)
	}

	async fn commit_nonce(&self, sender: Address, used: u64) {
		self.nonces.lock().await.insert(sender, used + 1);
	}

	/// Reloads the pending nonce from the chain.
	async fn refresh_nonce(&self, sender: Address) -> Result<u64, SubmitterError> {
		let fresh = self
			.delivery
			.transaction_count(sender, BlockView::Pending)
			.await?;
		self.nonces.lock().await.insert(sender, fresh);
		debug!(sender = %sender, nonce = fresh, "Refreshed nonce");
		Ok(fresh)
	}

	/// Senders whose pending transaction count is within their ceiling.
	///
	/// Under [`FallbackPolicy::FirstConfigured`] the first configured sender
	/// is returned when none qualifies.
	pub async fn available_sender_addresses(&self) -> Vec<Address> {
		let mut available = Vec::new();
		for sender in &self.config.senders {
			let latest = self
				.delivery
				.transaction_count(sender.address, BlockView::Latest)
				.await;
			let pending = self
				.delivery
				.transaction_count(sender.address, BlockView::Pending)
				.await;
			match (latest, pending) {
				(Ok(latest), Ok(pending)) => {
					let pending_count = pending.saturating_sub(latest);
					if pending_count <= sender.max_pending_count {
						available.push(sender.address);
					} else {
						debug!(
							sender = %sender.address,
							pending_count,
							max = sender.max_pending_count,
							"Sender has too many pending transactions"
						);
					}
				}
				(Err(e), _) | (_, Err(e)) => {
					warn!(sender = %sender.address, error = %e, "Failed to read transaction counts");
				}
			}
		}

		if available.is_empty() && self.config.fallback == FallbackPolicy::FirstConfigured {
			let fallback = self.config.senders[0].address;
			warn!(sender = %fallback, "No sender within its pending limit, using the first one");
			available.push(fallback);
		}
		available
	}

	async fn select_sender_address(&self) -> Result<Address, SubmitterError> {
		self.available_sender_addresses()
			.await
			.first()
			.copied()
			.ok_or(SubmitterError::NoSender)
	}

	/// Finalizes a ring for submission.
	///
	/// Once every order's validity window has opened on chain the call is
	/// dry-run first, so rings that would revert are dropped here.
	pub async fn generate_ring_submit_info(
		&self,
		mut ring: Ring,
	) -> Result<RingSubmitInfo, SubmitterError> {
		let protocol_address = ring
			.orders
			.first()
			.map(|order| order.order().protocol)
			.ok_or_else(|| SubmitterError::InvalidRing("ring has no orders".to_string()))?;

		if ring.hash.is_zero() {
			ring.hash = ring.generate_hash(self.config.fee_receipt);
		}
		let miner = self.select_sender_address().await?;
		let protocol_data = encode_submit_ring(&ring, self.config.fee_receipt);

		let block_time = self.current_block_time();
		if block_time > 0 && ring.valid_since_time() <= block_time {
			self.delivery
				.estimate_gas(miner, protocol_address, &protocol_data)
				.await
				.inspect_err(|e| {
					warn!(ring_hash = %ring.hash, error = %e, "Ring failed gas estimation");
				})?;
		}

		let mut protocol_gas = ring.gas;
		if self.config.max_gas_limit > 0 && protocol_gas > self.config.max_gas_limit {
			protocol_gas = self.config.max_gas_limit;
		}
		if self.config.min_gas_limit > 0 && protocol_gas < self.config.min_gas_limit {
			protocol_gas = self.config.min_gas_limit;
		}

		Ok(RingSubmitInfo {
			protocol_address,
			orders_count: ring.orders.len(),
			protocol_data,
			protocol_gas,
			protocol_gas_price: ring.gas_price,
			miner,
			ring_hash: ring.hash,
			unique_id: ring.generate_unique_id(),
			submit_tx_hash: None,
			raw_ring: ring,
		})
	}

	/// Signs and broadcasts a ring. A failed broadcast is retried once with a
	/// nonce reloaded from the chain.
	pub async fn submit_ring(&self, info: &RingSubmitInfo) -> (Option<B256>, TxStatus, Option<String>) {
		let nonce = self.next_nonce(info.miner).await;
		let first_error = match self.send(info, nonce).await {
			Ok(tx_hash) => {
				self.commit_nonce(info.miner, nonce).await;
				return (Some(tx_hash), TxStatus::Pending, None);
			}
			Err(e) => e,
		};

		warn!(
			ring_hash = %info.ring_hash,
			sender = %info.miner,
			nonce,
			error = %first_error,
			"Broadcast failed, retrying with a fresh nonce"
		);

		let retry = match self.refresh_nonce(info.miner).await {
			Ok(fresh) => self
				.send(info, fresh)
				.await
				.map(|tx_hash| (tx_hash, fresh))
				.map_err(SubmitterError::from),
			Err(e) => Err(e),
		};
		match retry {
			Ok((tx_hash, used)) => {
				self.commit_nonce(info.miner, used).await;
				(Some(tx_hash), TxStatus::Pending, None)
			}
			Err(e) => {
				error!(ring_hash = %info.ring_hash, error = %e, "Ring submission failed");
				(None, TxStatus::Failed, Some(e.to_string()))
			}
		}
	}

	async fn send(&self, info: &RingSubmitInfo, nonce: u64) -> Result<B256, DeliveryError> {
		self.delivery
			.sign_and_send_transaction(
				info.miner,
				info.protocol_address,
				info.protocol_gas,
				info.protocol_gas_price,
				U256::ZERO,
				info.protocol_data.clone(),
				nonce,
			)
			.await
	}

	/// Submits every ring of a batch, persisting and publishing each outcome.
	pub async fn handle_batch(&self, batch: RingBatch) {
		debug!(rings = batch.len(), "Received ring batch");
		for mut info in batch {
			let (tx_hash, status, error) = self.submit_ring(&info).await;
			info.submit_tx_hash = tx_hash;
			if status == TxStatus::Pending {
				info!(
					ring_hash = %info.ring_hash,
					tx_hash = %tx_hash.unwrap_or_default(),
					received = %info.raw_ring.received,
					"Submitted ring"
				);
			}

			let record = SubmitRecord::new(&info, status, error.clone());
			match self.records.save_submit_info(&record).await {
				Ok(()) => {
					for order in &info.raw_ring.orders {
						let order_record = FilledOrderRecord::new(info.ring_hash, order);
						if let Err(e) = self.records.save_filled_order(&order_record).await {
							error!(ring_hash = %info.ring_hash, error = %e, "Failed to save filled order");
						}
					}
				}
				Err(e) => error!(ring_hash = %info.ring_hash, error = %e, "Failed to save submission"),
			}

			self.submit_result(RingSubmitResult {
				ring_hash: info.ring_hash,
				unique_id: info.unique_id,
				tx_hash: tx_hash.unwrap_or_default(),
				status,
				ring_index: None,
				block_number: None,
				used_gas: None,
				error,
			})
			.await;
		}
	}

	/// Persists a result and hands it to the matcher.
	pub async fn submit_result(&self, result: RingSubmitResult) {
		if let Err(e) = self.records.update_result(&result).await {
			error!(ring_hash = %result.ring_hash, error = %e, "Failed to update submission result");
		}
		if self.results.send(result).is_err() {
			warn!("Submission result receiver dropped");
		}
	}

	/// Publishes results for mined records past the stored cursor, then
	/// advances it. Returns the number of records read.
	pub async fn poll_mined_records(&self) -> Result<usize, SubmitterError> {
		let mut last_id = self.cache.last_mined_record_id().await?;
		let mined = self
			.records
			.ring_mined_records(last_id, MINED_RECORDS_PAGE)
			.await?;

		for record in &mined {
			last_id = last_id.max(record.id);
			let infos = match self.records.ring_infos_by_tx(&record.tx_hash).await {
				Ok(infos) => infos,
				Err(e) => {
					error!(tx_hash = %record.tx_hash, error = %e, "Failed to load rings of transaction");
					continue;
				}
			};
			for info in infos {
				self.submit_result(RingSubmitResult {
					ring_hash: info.ring_hash,
					unique_id: info.unique_id,
					tx_hash: record.tx_hash,
					status: record.status,
					ring_index: None,
					block_number: Some(record.block_number),
					used_gas: Some(record.used_gas),
					error: record.error.clone(),
				})
				.await;
			}
		}

		self.cache.set_last_mined_record_id(last_id).await?;
		Ok(mined.len())
	}

	/// Appends a mined record for every pending submission whose receipt is
	/// available. Returns the number of new records.
	pub async fn index_receipts(&self) -> Result<usize, SubmitterError> {
		let mut indexed = 0;
		for record in self.records.pending_submit_infos().await? {
			let Some(tx_hash) = record.tx_hash else {
				continue;
			};
			let receipt = match self.delivery.transaction_receipt(tx_hash).await {
				Ok(Some(receipt)) => receipt,
				Ok(None) => continue,
				Err(e) => {
					warn!(tx_hash = %tx_hash, error = %e, "Failed to fetch receipt");
					continue;
				}
			};

			let mined = RingMinedRecord {
				id: 0,
				tx_hash,
				block_number: receipt.block_number,
				used_gas: receipt.gas_used,
				status: if receipt.success {
					TxStatus::Success
				} else {
					TxStatus::Failed
				},
				error: (!receipt.success).then(|| "transaction reverted".to_string()),
			};
			if let Some(id) = self.records.append_ring_mined(mined).await? {
				debug!(tx_hash = %tx_hash, id, success = receipt.success, "Indexed ring receipt");
				indexed += 1;
			}
		}
		Ok(indexed)
	}
}

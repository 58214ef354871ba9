//! Round-based ring matching.
//!
//! The [`Matcher`] keeps one [`Market`] per token pair and protocol
//! deployment and sweeps them sequentially on every round. Accepted rings go
//! out as [`RingBatch`]es; submission results come back through
//! [`Matcher::handle_submit_result`] to release the dedup cache and count
//! failures.

use alloy::primitives::keccak256;
use relay_cache::{CacheError, DedupCache};
use relay_evaluator::{BalanceProvider, Evaluator, EvaluatorError};
use relay_orderbook::{OrderBookError, OrderBookService};
use relay_submitter::{RecordStore, Submitter, SubmitterError};
use relay_types::{
	BlockEvent, ProtocolAddress, RingBatch, RingSubmitResult, TokenPair, TxStatus, B256,
};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

pub mod balances;
pub mod market;

pub use balances::AccountBalances;
pub use market::{reduce_received_of_candidate_ring, CandidateRing, Market};

#[derive(Debug, Error)]
pub enum MatcherError {
	#[error("Evaluation failed: {0}")]
	Evaluator(#[from] EvaluatorError),
	#[error("Order book error: {0}")]
	OrderBook(#[from] OrderBookError),
	#[error("Cache error: {0}")]
	Cache(#[from] CacheError),
	#[error("Submitter error: {0}")]
	Submitter(#[from] SubmitterError),
	#[error("Ring batch channel closed")]
	ChannelClosed,
}

impl MatcherError {
	/// Rejections by a pricing rule, as opposed to collaborator failures.
	pub fn is_structural(&self) -> bool {
		matches!(self, MatcherError::Evaluator(e) if e.is_structural())
	}
}

#[derive(Debug, Clone)]
pub struct MatcherConfig {
	pub round_duration: Duration,
	/// Orders pulled per direction per round.
	pub round_order_count: usize,
	/// Seconds an order must stay valid to be matched.
	pub reserved_time: u64,
	/// Rounds, in milliseconds, that consumed orders sit out.
	pub delayed_number: i64,
	pub max_failed_count: usize,
}

impl Default for MatcherConfig {
	fn default() -> Self {
		Self {
			round_duration: Duration::from_secs(10),
			round_order_count: 2,
			reserved_time: 45,
			delayed_number: 10_000,
			max_failed_count: 3,
		}
	}
}

/// Services every market works with.
pub struct MatchingContext {
	pub config: MatcherConfig,
	pub orderbook: Arc<OrderBookService>,
	pub evaluator: Arc<Evaluator>,
	pub submitter: Arc<Submitter>,
	pub cache: Arc<DedupCache>,
	pub balances: Arc<dyn BalanceProvider>,
}

pub struct Matcher {
	context: Arc<MatchingContext>,
	records: Arc<dyn RecordStore>,
	/// Held for a whole round so rounds never overlap.
	markets: Mutex<Vec<Market>>,
	last_round: AtomicI64,
	orders_ready: AtomicBool,
	batches: mpsc::Sender<RingBatch>,
}

impl Matcher {
	/// Creates one market per unordered token pair for every protocol.
	pub fn new(
		context: Arc<MatchingContext>,
		records: Arc<dyn RecordStore>,
		pairs: &[TokenPair],
		protocols: &[ProtocolAddress],
		batches: mpsc::Sender<RingBatch>,
	) -> Self {
		let mut unique_pairs: Vec<TokenPair> = Vec::new();
		for pair in pairs {
			let known = unique_pairs.iter().any(|p| {
				(p.token_a == pair.token_a && p.token_b == pair.token_b)
					|| (p.token_a == pair.token_b && p.token_b == pair.token_a)
			});
			if !known {
				unique_pairs.push(*pair);
			}
		}

		let markets = unique_pairs
			.iter()
			.flat_map(|pair| {
				protocols.iter().map(|protocol| {
					Market::new(context.clone(), *protocol, pair.token_a, pair.token_b)
				})
			})
			.collect::<Vec<_>>();
		info!(markets = markets.len(), "Initialized markets");

		Self {
			context,
			records,
			markets: Mutex::new(markets),
			last_round: AtomicI64::new(0),
			orders_ready: AtomicBool::new(false),
			batches,
		}
	}

	pub fn round_duration(&self) -> Duration {
		self.context.config.round_duration
	}

	pub async fn market_count(&self) -> usize {
		self.markets.lock().await.len()
	}

	/// Records a new block. The first one enables matching.
	pub fn on_block(&self, block: &BlockEvent) {
		self.context.submitter.update_block_time(block.timestamp);
		if !self.orders_ready.swap(true, Ordering::SeqCst) {
			info!(block = block.number, "First block observed, matching enabled");
		}
	}

	/// Wall-clock milliseconds, strictly above the previous round.
	fn next_round_number(&self) -> i64 {
		let now = chrono::Utc::now().timestamp_millis();
		let previous = self.last_round.load(Ordering::SeqCst);
		let round = now.max(previous + 1);
		self.last_round.store(round, Ordering::SeqCst);
		round
	}

	/// Sweeps every market once and forwards non-empty batches. Returns the
	/// number of rings matched.
	pub async fn run_round(&self) -> Result<usize, MatcherError> {
		if !self.orders_ready.load(Ordering::SeqCst) {
			debug!("No block observed yet, skipping round");
			return Ok(0);
		}

		let mut markets = self.markets.lock().await;
		let round = self.next_round_number();
		let mut matched = 0;
		for market in markets.iter_mut() {
			match market.match_round(round).await {
				Ok(batch) if batch.is_empty() => {}
				Ok(batch) => {
					matched += batch.len();
					self.batches
						.send(batch)
						.await
						.map_err(|_| MatcherError::ChannelClosed)?;
				}
				Err(e) => {
					error!(
						token_a = %market.token_a(),
						token_b = %market.token_b(),
						error = %e,
						"Market round failed"
					);
				}
			}
		}
		Ok(matched)
	}

	/// Releases a ring from the dedup cache once its submission is final and
	/// counts failures against the ring and its orders.
	pub async fn handle_submit_result(&self, result: &RingSubmitResult) -> Result<(), MatcherError> {
		if !result.status.is_terminal() {
			return Ok(());
		}

		let cache = &self.context.cache;
		let order_hashes = cache.remove_mined_ring(&result.ring_hash).await?;

		if result.status != TxStatus::Failed {
			info!(
				ring_hash = %result.ring_hash,
				tx_hash = %result.tx_hash,
				status = ?result.status,
				"Ring submission settled"
			);
			return Ok(());
		}

		let unique_id = if result.unique_id.is_zero() {
			cache.unique_id_of_ring(&result.ring_hash).await?
		} else {
			Some(result.unique_id)
		};
		let Some(unique_id) = unique_id else {
			warn!(ring_hash = %result.ring_hash, "Failed ring has no unique id, not counted");
			return Ok(());
		};

		let attempt = if result.tx_hash.is_zero() {
			failed_attempt_marker(&result.ring_hash)
		} else {
			result.tx_hash
		};
		cache
			.add_failed_ring(&unique_id, &attempt, &order_hashes)
			.await?;
		warn!(
			ring_hash = %result.ring_hash,
			unique_id = %unique_id,
			error = result.error.as_deref().unwrap_or(""),
			"Ring submission failed"
		);
		Ok(())
	}

	/// Purges cached rings that never reached the submission records, left
	/// behind when the process stopped between matching and persisting.
	pub async fn clean_missed_cache(&self) -> Result<usize, MatcherError> {
		let mut removed = 0;
		for ring_hash in self.context.cache.cached_ring_hashes().await? {
			match self.records.submit_info(&ring_hash).await {
				Ok(Some(_)) => {}
				Ok(None) => {
					self.context.cache.remove_mined_ring(&ring_hash).await?;
					removed += 1;
				}
				Err(e) => {
					error!(ring_hash = %ring_hash, error = %e, "Failed to load submission record");
				}
			}
		}
		if removed > 0 {
			info!(removed, "Purged unrecorded rings from cache");
		}
		Ok(removed)
	}
}

/// Distinguishes failed attempts that never got a transaction hash.
fn failed_attempt_marker(ring_hash: &B256) -> B256 {
	let mut packed = Vec::with_capacity(32 + 8);
	packed.extend_from_slice(ring_hash.as_slice());
	let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
	packed.extend_from_slice(&now.to_be_bytes());
	keccak256(&packed)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::market::tests::{fixture, order, protocol, TOKEN_X, TOKEN_Y};
	use relay_submitter::SubmitRecord;
	use num::Zero;

	fn result(info: &relay_types::RingSubmitInfo, status: TxStatus, tx_hash: B256) -> RingSubmitResult {
		RingSubmitResult {
			ring_hash: info.ring_hash,
			unique_id: info.unique_id,
			tx_hash,
			status,
			ring_index: None,
			block_number: None,
			used_gas: None,
			error: None,
		}
	}

	fn matcher(
		context: Arc<MatchingContext>,
		records: Arc<dyn RecordStore>,
	) -> (Matcher, mpsc::Receiver<RingBatch>) {
		let (tx, rx) = mpsc::channel(8);
		let pairs = [
			TokenPair {
				token_a: TOKEN_X,
				token_b: TOKEN_Y,
			},
			TokenPair {
				token_a: TOKEN_Y,
				token_b: TOKEN_X,
			},
		];
		(Matcher::new(context, records, &pairs, &[protocol()], tx), rx)
	}

	fn block(timestamp: u64) -> BlockEvent {
		BlockEvent {
			number: 1,
			timestamp,
			gas_prices: vec![],
		}
	}

	#[tokio::test]
	async fn test_round_waits_for_first_block() {
		let f = fixture(vec![
			order(1, TOKEN_X, TOKEN_Y, 300, 4000),
			order(2, TOKEN_Y, TOKEN_X, 4000, 300),
		])
		.await;
		let (matcher, mut batches) = matcher(f.context.clone(), f.records.clone());
		assert_eq!(matcher.market_count().await, 1);

		assert_eq!(matcher.run_round().await.unwrap(), 0);
		assert!(batches.try_recv().is_err());

		matcher.on_block(&block(1));
		assert_eq!(f.context.submitter.current_block_time(), 1);
		assert_eq!(matcher.run_round().await.unwrap(), 1);
		assert_eq!(batches.recv().await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_failed_result_releases_ring_and_counts_failures() {
		let a = order(1, TOKEN_X, TOKEN_Y, 300, 4000);
		let b = order(2, TOKEN_Y, TOKEN_X, 4000, 300);
		let f = fixture(vec![a.clone(), b.clone()]).await;
		let (matcher, mut batches) = matcher(f.context.clone(), f.records.clone());
		matcher.on_block(&block(1));
		matcher.run_round().await.unwrap();
		let info = batches.recv().await.unwrap().remove(0);
		let cache = &f.context.cache;

		// pending results leave the cache alone
		matcher
			.handle_submit_result(&result(&info, TxStatus::Pending, B256::repeat_byte(0xaa)))
			.await
			.unwrap();
		assert!(cache.is_ring_cached(&info.ring_hash).await.unwrap());

		// two broadcast failures without a transaction hash count twice
		matcher
			.handle_submit_result(&result(&info, TxStatus::Failed, B256::ZERO))
			.await
			.unwrap();
		assert!(!cache.is_ring_cached(&info.ring_hash).await.unwrap());
		cache.add_mined_ring(&info).await.unwrap();
		matcher
			.handle_submit_result(&result(&info, TxStatus::Failed, B256::ZERO))
			.await
			.unwrap();

		assert_eq!(cache.ring_failed_count(&info.unique_id).await.unwrap(), 2);
		assert_eq!(cache.order_failed_count(&a.hash()).await.unwrap(), 1);
		assert_eq!(cache.order_failed_count(&b.hash()).await.unwrap(), 1);
		assert!(cache.dealt_amount(&a.hash()).await.unwrap().0.is_zero());
	}

	#[tokio::test]
	async fn test_settled_result_releases_without_failure() {
		let f = fixture(vec![
			order(1, TOKEN_X, TOKEN_Y, 300, 4000),
			order(2, TOKEN_Y, TOKEN_X, 4000, 300),
		])
		.await;
		let (matcher, mut batches) = matcher(f.context.clone(), f.records.clone());
		matcher.on_block(&block(1));
		matcher.run_round().await.unwrap();
		let info = batches.recv().await.unwrap().remove(0);

		matcher
			.handle_submit_result(&result(&info, TxStatus::Success, B256::repeat_byte(0xaa)))
			.await
			.unwrap();
		let cache = &f.context.cache;
		assert!(!cache.is_ring_cached(&info.ring_hash).await.unwrap());
		assert_eq!(cache.ring_failed_count(&info.unique_id).await.unwrap(), 0);
	}

	#[tokio::test]
	async fn test_clean_missed_cache_keeps_recorded_rings() {
		let f = fixture(vec![
			order(1, TOKEN_X, TOKEN_Y, 300, 4000),
			order(2, TOKEN_Y, TOKEN_X, 4000, 300),
			order(3, TOKEN_X, TOKEN_Y, 300, 4000),
			order(4, TOKEN_Y, TOKEN_X, 4000, 300),
		])
		.await;
		let (matcher, mut batches) = matcher(f.context.clone(), f.records.clone());
		matcher.on_block(&block(1));
		matcher.run_round().await.unwrap();
		let batch = batches.recv().await.unwrap();
		assert_eq!(batch.len(), 2);

		// only the first ring made it to the records before the crash
		let recorded = SubmitRecord::new(&batch[0], TxStatus::Pending, None);
		f.records.save_submit_info(&recorded).await.unwrap();

		assert_eq!(matcher.clean_missed_cache().await.unwrap(), 1);
		let cache = &f.context.cache;
		assert!(cache.is_ring_cached(&batch[0].ring_hash).await.unwrap());
		assert!(!cache.is_ring_cached(&batch[1].ring_hash).await.unwrap());
		assert_eq!(matcher.clean_missed_cache().await.unwrap(), 0);
	}

	#[test]
	fn test_failed_attempt_markers_differ() {
		let ring_hash = B256::repeat_byte(0x11);
		let first = failed_attempt_marker(&ring_hash);
		std::thread::sleep(Duration::from_millis(2));
		assert_ne!(first, failed_attempt_marker(&ring_hash));
		assert_ne!(first, B256::ZERO);
	}
}

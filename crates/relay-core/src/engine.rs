//! Background tasks of a running relay.
//!
//! Every task owns one concern and talks to the others through the services
//! or the typed channels created by the builder:
//!
//! - block poller: feeds the gas price window and the matcher's block clock
//! - round ticker: runs a matching round per period
//! - batch consumer: hands ring batches to the submitter
//! - result consumer: hands submission results back to the matcher
//! - receipt indexer and mined-record poller: close the loop on mined rings

use crate::error::RelayError;
use relay_cache::DedupCache;
use relay_delivery::DeliveryService;
use relay_matcher::Matcher;
use relay_pricing::GasPriceEvaluator;
use relay_submitter::Submitter;
use relay_types::{RingBatch, RingSubmitResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Periods of the engine's polling tasks.
#[derive(Debug, Clone, Copy)]
pub struct EngineIntervals {
	pub block_poll: Duration,
	pub round: Duration,
	pub receipt_poll: Duration,
	pub mined_poll: Duration,
}

type Channels = (
	mpsc::Receiver<RingBatch>,
	mpsc::UnboundedReceiver<RingSubmitResult>,
);

pub struct RelayEngine {
	pub(crate) intervals: EngineIntervals,
	pub(crate) delivery: Arc<DeliveryService>,
	pub(crate) gas_prices: Arc<GasPriceEvaluator>,
	pub(crate) cache: Arc<DedupCache>,
	pub(crate) submitter: Arc<Submitter>,
	pub(crate) matcher: Arc<Matcher>,
	/// Taken by `start`.
	pub(crate) channels: Mutex<Option<Channels>>,
	pub(crate) shutdown_tx: broadcast::Sender<()>,
	pub(crate) tasks: Mutex<JoinSet<()>>,
}

impl RelayEngine {
	/// Purges rings orphaned by a previous run and spawns the background
	/// tasks.
	pub async fn start(&self) -> Result<(), RelayError> {
		let Some((batches, results)) = self.channels.lock().await.take() else {
			return Err(RelayError::Lifecycle("Relay already started".to_string()));
		};

		self.matcher.clean_missed_cache().await?;

		let mut tasks = self.tasks.lock().await;

		tasks.spawn(poll_blocks(
			self.delivery.clone(),
			self.gas_prices.clone(),
			self.matcher.clone(),
			self.intervals.block_poll,
			self.shutdown_tx.subscribe(),
		));

		let matcher = self.matcher.clone();
		tasks.spawn(every(
			self.intervals.round,
			self.shutdown_tx.subscribe(),
			move || {
				let matcher = matcher.clone();
				async move {
					match matcher.run_round().await {
						Ok(0) => {}
						Ok(rings) => info!(rings, "Matching round produced rings"),
						Err(e) => error!(error = %e, "Matching round failed"),
					}
				}
			},
		));

		tasks.spawn(forward_batches(
			self.submitter.clone(),
			batches,
			self.shutdown_tx.subscribe(),
		));

		tasks.spawn(forward_results(
			self.matcher.clone(),
			results,
			self.shutdown_tx.subscribe(),
		));

		let submitter = self.submitter.clone();
		tasks.spawn(every(
			self.intervals.receipt_poll,
			self.shutdown_tx.subscribe(),
			move || {
				let submitter = submitter.clone();
				async move {
					match submitter.index_receipts().await {
						Ok(0) => {}
						Ok(indexed) => debug!(indexed, "Indexed mined transactions"),
						Err(e) => warn!(error = %e, "Receipt indexing failed"),
					}
				}
			},
		));

		let submitter = self.submitter.clone();
		tasks.spawn(every(
			self.intervals.mined_poll,
			self.shutdown_tx.subscribe(),
			move || {
				let submitter = submitter.clone();
				async move {
					match submitter.poll_mined_records().await {
						Ok(0) => {}
						Ok(published) => debug!(published, "Published mined ring results"),
						Err(e) => warn!(error = %e, "Mined record poll failed"),
					}
				}
			},
		));

		info!(tasks = tasks.len(), "Relay started");
		Ok(())
	}

	/// Signals every task and waits for them to finish their current step.
	pub async fn shutdown(&self) -> Result<(), RelayError> {
		info!("Stopping relay");
		// No receivers means nothing was started.
		let _ = self.shutdown_tx.send(());

		let mut tasks = self.tasks.lock().await;
		while let Some(joined) = tasks.join_next().await {
			if let Err(e) = joined {
				error!(error = %e, "Relay task ended abnormally");
			}
		}

		info!("Relay stopped");
		Ok(())
	}

	pub fn matcher(&self) -> &Arc<Matcher> {
		&self.matcher
	}

	pub fn submitter(&self) -> &Arc<Submitter> {
		&self.submitter
	}

	pub fn cache(&self) -> &Arc<DedupCache> {
		&self.cache
	}

	pub fn gas_prices(&self) -> &Arc<GasPriceEvaluator> {
		&self.gas_prices
	}
}

/// Runs `job` once per `period` until shutdown. The first run is immediate.
async fn every<F, Fut>(period: Duration, mut shutdown: broadcast::Receiver<()>, mut job: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = ()>,
{
	let mut ticker = interval(period);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
	loop {
		tokio::select! {
			_ = ticker.tick() => job().await,
			_ = shutdown.recv() => break,
		}
	}
}

async fn poll_blocks(
	delivery: Arc<DeliveryService>,
	gas_prices: Arc<GasPriceEvaluator>,
	matcher: Arc<Matcher>,
	period: Duration,
	shutdown: broadcast::Receiver<()>,
) {
	let last_block = Arc::new(Mutex::new(None::<u64>));
	every(period, shutdown, move || {
		let delivery = delivery.clone();
		let gas_prices = gas_prices.clone();
		let matcher = matcher.clone();
		let last_block = last_block.clone();
		async move {
			let block = match delivery.latest_block().await {
				Ok(block) => block,
				Err(e) => {
					warn!(error = %e, "Failed to fetch latest block");
					return;
				}
			};

			let mut last = last_block.lock().await;
			if last.is_some_and(|number| block.number <= number) {
				return;
			}
			gas_prices.observe_block(&block).await;
			matcher.on_block(&block);
			*last = Some(block.number);
			debug!(block = block.number, timestamp = block.timestamp, "New block");
		}
	})
	.await;
}

async fn forward_batches(
	submitter: Arc<Submitter>,
	mut batches: mpsc::Receiver<RingBatch>,
	mut shutdown: broadcast::Receiver<()>,
) {
	loop {
		tokio::select! {
			batch = batches.recv() => match batch {
				Some(batch) => submitter.handle_batch(batch).await,
				None => break,
			},
			_ = shutdown.recv() => break,
		}
	}
	debug!("Batch consumer stopped");
}

async fn forward_results(
	matcher: Arc<Matcher>,
	mut results: mpsc::UnboundedReceiver<RingSubmitResult>,
	mut shutdown: broadcast::Receiver<()>,
) {
	loop {
		tokio::select! {
			result = results.recv() => match result {
				Some(result) => {
					if let Err(e) = matcher.handle_submit_result(&result).await {
						error!(ring_hash = %result.ring_hash, error = %e, "Failed to apply submit result");
					}
				}
				None => break,
			},
			_ = shutdown.recv() => break,
		}
	}
	debug!("Result consumer stopped");
}

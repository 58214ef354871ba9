//! Gas price estimation from recently observed blocks.

use relay_types::BlockEvent;
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::debug;

/// Number of blocks kept for the estimate.
pub const DEFAULT_BLOCK_WINDOW: usize = 30;
/// Used when the observed prices sum to nothing.
pub const FALLBACK_GAS_PRICE: u128 = 1_000_000_000;

struct Window {
	blocks: VecDeque<Vec<u128>>,
	best: Option<u128>,
}

/// Tracks transaction gas prices of the last few blocks.
///
/// The estimate is the sum of the most expensive two thirds of all observed
/// prices divided by that count plus one.
pub struct GasPriceEvaluator {
	capacity: usize,
	window: RwLock<Window>,
}

impl Default for GasPriceEvaluator {
	fn default() -> Self {
		Self::new(DEFAULT_BLOCK_WINDOW)
	}
}

impl GasPriceEvaluator {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity: capacity.max(1),
			window: RwLock::new(Window {
				blocks: VecDeque::new(),
				best: None,
			}),
		}
	}

	pub async fn observe_block(&self, block: &BlockEvent) {
		let mut window = self.window.write().await;
		window.blocks.push_back(block.gas_prices.clone());
		while window.blocks.len() > self.capacity {
			window.blocks.pop_front();
		}

		let mut prices: Vec<u128> = window.blocks.iter().flatten().copied().collect();
		prices.sort_unstable_by(|a, b| b.cmp(a));
		let count = prices.len() / 3 * 2;
		let sum: u128 = prices[..count].iter().fold(0u128, |acc, p| acc.saturating_add(*p));
		let best = match sum / (count as u128 + 1) {
			0 => FALLBACK_GAS_PRICE,
			price => price,
		};

		debug!(block = block.number, best, samples = prices.len(), "Updated gas price");
		window.best = Some(best);
	}

	/// Estimate clamped to `[min, max]`. Before any block is observed the
	/// maximum is used.
	pub async fn evaluated_price(&self, min: u128, max: u128) -> u128 {
		let best = self.window.read().await.best;
		best.unwrap_or(max).min(max).max(min)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn block(number: u64, gas_prices: Vec<u128>) -> BlockEvent {
		BlockEvent {
			number,
			timestamp: number * 15,
			gas_prices,
		}
	}

	#[tokio::test]
	async fn test_no_observation_uses_max() {
		let evaluator = GasPriceEvaluator::default();
		assert_eq!(evaluator.evaluated_price(10, 100).await, 100);
	}

	#[tokio::test]
	async fn test_top_two_thirds_mean() {
		let evaluator = GasPriceEvaluator::default();
		evaluator
			.observe_block(&block(1, vec![10, 40, 20, 30, 60, 50]))
			.await;

		// top four: 60 + 50 + 40 + 30 = 180, divided by 5
		assert_eq!(evaluator.evaluated_price(0, u128::MAX).await, 36);
		assert_eq!(evaluator.evaluated_price(40, 100).await, 40);
		assert_eq!(evaluator.evaluated_price(0, 20).await, 20);
	}

	#[tokio::test]
	async fn test_empty_blocks_fall_back() {
		let evaluator = GasPriceEvaluator::default();
		evaluator.observe_block(&block(1, vec![])).await;
		assert_eq!(
			evaluator.evaluated_price(0, u128::MAX).await,
			FALLBACK_GAS_PRICE
		);
	}

	#[tokio::test]
	async fn test_window_drops_old_blocks() {
		let evaluator = GasPriceEvaluator::new(1);
		evaluator.observe_block(&block(1, vec![900, 900, 900])).await;
		evaluator.observe_block(&block(2, vec![30, 30, 30])).await;

		// only the second block remains: (30 + 30) / 3
		assert_eq!(evaluator.evaluated_price(0, u128::MAX).await, 20);
	}
}

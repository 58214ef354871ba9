//! Matching for one token pair on one protocol deployment.
//!
//! Each round the market pulls orders in both directions, prices every
//! opposite pair as a two-order ring and greedily accepts the most
//! profitable rings that do not over-consume a shared order.

use crate::{MatcherError, MatchingContext};
use num::{BigRational, Signed};
use relay_evaluator::{price_valid, EvaluatorError};
use relay_orderbook::MinerOrderQuery;
use relay_types::{
	Address, FilledOrder, OrderDelayList, OrderState, ProtocolAddress, Ring,
	RingBatch, RingSubmitInfo, B256,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Scoring record for one priced pair, alive for a single round.
#[derive(Debug, Clone)]
pub struct CandidateRing {
	/// Settlement cost in the reference currency.
	pub cost: BigRational,
	pub received: BigRational,
	pub unique_id: B256,
	/// Order hashes in ring order with their tentative sell fill.
	pub filled_orders: Vec<(B256, BigRational)>,
}

impl CandidateRing {
	fn fill_of(&self, order_hash: &B256) -> Option<&BigRational> {
		self.filled_orders
			.iter()
			.find(|(hash, _)| hash == order_hash)
			.map(|(_, fill)| fill)
	}
}

/// Best candidate first; equal profits fall back to ascending unique id.
fn sort_candidates(candidates: &mut [CandidateRing]) {
	candidates.sort_by(|a, b| {
		b.received
			.cmp(&a.received)
			.then_with(|| a.unique_id.cmp(&b.unique_id))
	});
}

/// Adjusts the remaining candidates after `filled` was consumed by an
/// accepted ring.
///
/// Candidates sharing the order are dropped when it is now fully filled.
/// Otherwise their fills shrink to what the order has left and their profit
/// is rescaled, dropping them once it is no longer positive.
pub fn reduce_received_of_candidate_ring(
	candidates: Vec<CandidateRing>,
	filled: &FilledOrder,
	full_filled: bool,
) -> Vec<CandidateRing> {
	let order_hash = filled.hash();
	let available = &filled.available_amount_s - &filled.fill_amount_s;

	candidates
		.into_iter()
		.filter_map(|mut candidate| {
			let Some(amount_s) = candidate.fill_of(&order_hash).cloned() else {
				return Some(candidate);
			};
			if full_filled || !available.is_positive() || !amount_s.is_positive() {
				return None;
			}

			let remained = if amount_s >= available {
				available.clone()
			} else {
				amount_s.clone()
			};
			let rate = remained / &amount_s;
			let received = (&candidate.received + &candidate.cost) * &rate - &candidate.cost;
			if !received.is_positive() {
				return None;
			}

			for (_, fill) in candidate.filled_orders.iter_mut() {
				*fill = &*fill * &rate;
			}
			candidate.received = received;
			Some(candidate)
		})
		.collect()
}

pub struct Market {
	context: Arc<MatchingContext>,
	protocol: ProtocolAddress,
	token_a: Address,
	token_b: Address,
	a_to_b_orders: HashMap<B256, OrderState>,
	b_to_a_orders: HashMap<B256, OrderState>,
	a_to_b_exclude: Vec<B256>,
	b_to_a_exclude: Vec<B256>,
}

impl Market {
	pub fn new(
		context: Arc<MatchingContext>,
		protocol: ProtocolAddress,
		token_a: Address,
		token_b: Address,
	) -> Self {
		Self {
			context,
			protocol,
			token_a,
			token_b,
			a_to_b_orders: HashMap::new(),
			b_to_a_orders: HashMap::new(),
			a_to_b_exclude: Vec::new(),
			b_to_a_exclude: Vec::new(),
		}
	}

	pub fn token_a(&self) -> Address {
		self.token_a
	}

	pub fn token_b(&self) -> Address {
		self.token_b
	}

	pub fn protocol(&self) -> &ProtocolAddress {
		&self.protocol
	}

	/// Orders parked for the next round, `(a_to_b, b_to_a)`.
	pub fn excluded_next_round(&self) -> (&[B256], &[B256]) {
		(self.a_to_b_exclude.as_slice(), self.b_to_a_exclude.as_slice())
	}

	/// Runs one matching round and returns the accepted rings.
	pub async fn match_round(&mut self, round: i64) -> Result<RingBatch, MatcherError> {
		self.get_orders_for_matching(round).await?;

		let mut a_orders: Vec<OrderState> = self.a_to_b_orders.values().cloned().collect();
		let mut b_orders: Vec<OrderState> = self.b_to_a_orders.values().cloned().collect();
		a_orders.sort_by_key(|state| state.hash());
		b_orders.sort_by_key(|state| state.hash());

		let mut blocked = Vec::new();
		for state in a_orders.iter().chain(b_orders.iter()) {
			if self.order_failed_too_often(&state.hash()).await {
				blocked.push(state.hash());
			}
		}

		let mut candidates = Vec::new();
		for a in a_orders.iter().filter(|s| !blocked.contains(&s.hash())) {
			for b in b_orders.iter().filter(|s| !blocked.contains(&s.hash())) {
				if a.raw_order.owner == b.raw_order.owner || !price_valid(a, b) {
					continue;
				}
				match self.generate_candidate_ring(a, b).await {
					Ok(candidate) if candidate.received.is_positive() => candidates.push(candidate),
					Ok(candidate) => {
						debug!(
							received = %candidate.received,
							cost = %candidate.cost,
							"Candidate ring not profitable"
						);
					}
					Err(e) => log_rejection(&e),
				}
			}
		}

		debug!(
			round,
			token_a = %self.token_a,
			token_b = %self.token_b,
			candidates = candidates.len(),
			"Priced candidate rings"
		);

		let mut matched: HashMap<B256, bool> = HashMap::new();
		let mut batch = RingBatch::new();
		while !candidates.is_empty() {
			sort_candidates(&mut candidates);
			let candidate = candidates.remove(0);

			let orders: Vec<OrderState> = candidate
				.filled_orders
				.iter()
				.filter_map(|(hash, _)| self.order(hash).cloned())
				.collect();
			let info = match self.generate_ring_submit_info(&orders).await {
				Ok(info) => info,
				Err(e) => {
					log_rejection(&e);
					continue;
				}
			};

			match self.context.cache.is_ring_cached(&info.ring_hash).await {
				Ok(false) => {}
				Ok(true) => {
					debug!(ring_hash = %info.ring_hash, "Ring already submitted");
					continue;
				}
				Err(e) => {
					error!(ring_hash = %info.ring_hash, error = %e, "Failed to check ring cache");
					continue;
				}
			}
			if self.ring_failed_too_often(&info).await {
				continue;
			}
			if !info.raw_ring.received.is_positive() {
				debug!(
					ring_hash = %info.ring_hash,
					received = %info.raw_ring.received,
					"Ring no longer profitable"
				);
				continue;
			}

			for filled in &info.raw_ring.orders {
				let state = self.reduce_amount_after_filled(filled);
				let full_filled = match self.context.orderbook.is_order_full_finished(&state).await {
					Ok(full) => full,
					Err(e) => {
						warn!(order_hash = %filled.hash(), error = %e, "Failed to check order fill");
						false
					}
				};
				matched.insert(filled.hash(), full_filled);
				candidates = reduce_received_of_candidate_ring(candidates, filled, full_filled);
			}

			if let Err(e) = self.context.cache.add_mined_ring(&info).await {
				error!(ring_hash = %info.ring_hash, error = %e, "Failed to cache matched ring");
				continue;
			}
			batch.push(info);
		}

		let full = |hash: &&B256| matched.get(*hash).copied().unwrap_or(false);
		self.a_to_b_exclude
			.extend(self.a_to_b_orders.keys().filter(full).copied());
		self.b_to_a_exclude
			.extend(self.b_to_a_orders.keys().filter(full).copied());

		if !batch.is_empty() {
			info!(
				round,
				token_a = %self.token_a,
				token_b = %self.token_b,
				rings = batch.len(),
				"Matched rings"
			);
		}
		Ok(batch)
	}

	fn order(&self, hash: &B256) -> Option<&OrderState> {
		self.a_to_b_orders
			.get(hash)
			.or_else(|| self.b_to_a_orders.get(hash))
	}

	/// Loads this round's orders, discounting fills of rings still pending.
	async fn get_orders_for_matching(&mut self, round: i64) -> Result<(), MatcherError> {
		self.a_to_b_orders.clear();
		self.b_to_a_orders.clear();

		let a_to_b = self
			.pull_orders(self.token_a, self.token_b, round, &self.a_to_b_exclude)
			.await?;
		let b_to_a = self
			.pull_orders(self.token_b, self.token_a, round, &self.b_to_a_exclude)
			.await?;
		self.a_to_b_exclude.clear();
		self.b_to_a_exclude.clear();

		for (orders, forward) in [(a_to_b, true), (b_to_a, false)] {
			for mut state in orders {
				self.reduce_remained_amount_before_match(&mut state).await;
				let hash = state.hash();
				let finished = self.context.orderbook.is_order_full_finished(&state).await?;
				match (finished, forward) {
					(true, true) => self.a_to_b_exclude.push(hash),
					(true, false) => self.b_to_a_exclude.push(hash),
					(false, true) => {
						self.a_to_b_orders.insert(hash, state);
					}
					(false, false) => {
						self.b_to_a_orders.insert(hash, state);
					}
				}
			}
		}
		Ok(())
	}

	/// Orders due this round, topped up from the delay window when short.
	async fn pull_orders(
		&self,
		token_s: Address,
		token_b: Address,
		round: i64,
		exclude: &[B256],
	) -> Result<Vec<OrderState>, MatcherError> {
		let config = &self.context.config;
		let query = MinerOrderQuery {
			delegate: self.protocol.delegate,
			token_s,
			token_b,
			limit: config.round_order_count,
			reserved_time: config.reserved_time,
			since_round: 0,
			until_round: round,
		};
		let delay = OrderDelayList {
			order_hashes: exclude.to_vec(),
			delayed_count: round + config.delayed_number,
		};
		let mut orders = self.context.orderbook.miner_orders(query, Some(&delay)).await?;

		if orders.len() < config.round_order_count {
			let top_up = MinerOrderQuery {
				limit: config.round_order_count - orders.len(),
				since_round: round + 1,
				until_round: round + config.delayed_number,
				..query
			};
			orders.extend(self.context.orderbook.miner_orders(top_up, None).await?);
		}
		Ok(orders)
	}

	async fn reduce_remained_amount_before_match(&self, state: &mut OrderState) {
		match self.context.cache.dealt_amount(&state.hash()).await {
			Ok((dealt_s, dealt_b)) => state.add_dealt(&dealt_s, &dealt_b),
			Err(e) => error!(order_hash = %state.hash(), error = %e, "Failed to read pending fills"),
		}
	}

	fn reduce_amount_after_filled(&mut self, filled: &FilledOrder) -> OrderState {
		let orders = if filled.order().token_s == self.token_a {
			&mut self.a_to_b_orders
		} else {
			&mut self.b_to_a_orders
		};
		match orders.get_mut(&filled.hash()) {
			Some(state) => {
				state.add_dealt(&filled.fill_amount_s, &filled.fill_amount_b);
				debug!(
					order_hash = %filled.hash(),
					fill_amount_s = %filled.fill_amount_s,
					dealt_amount_s = %state.dealt_amount_s,
					"Order consumed by ring"
				);
				state.clone()
			}
			None => {
				let mut state = filled.order_state.clone();
				state.add_dealt(&filled.fill_amount_s, &filled.fill_amount_b);
				state
			}
		}
	}

	async fn order_failed_too_often(&self, order_hash: &B256) -> bool {
		match self.context.cache.order_failed_count(order_hash).await {
			Ok(count) if count > self.context.config.max_failed_count => {
				debug!(order_hash = %order_hash, count, "Order failed too often");
				true
			}
			Ok(_) => false,
			Err(e) => {
				warn!(order_hash = %order_hash, error = %e, "Failed to read order failure count");
				false
			}
		}
	}

	async fn ring_failed_too_often(&self, info: &RingSubmitInfo) -> bool {
		match self.context.cache.ring_failed_count(&info.unique_id).await {
			Ok(count) if count > self.context.config.max_failed_count => {
				debug!(
					ring_hash = %info.ring_hash,
					unique_id = %info.unique_id,
					count,
					"Ring failed too often"
				);
				true
			}
			Ok(_) => false,
			Err(e) => {
				warn!(unique_id = %info.unique_id, error = %e, "Failed to read ring failure count");
				false
			}
		}
	}

	/// Projects an order for pricing with the owner's spendable balances.
	async fn generate_filled_order(&self, state: &OrderState) -> Result<FilledOrder, MatcherError> {
		let order = &state.raw_order;
		let balances = &self.context.balances;
		let lrc_balance = balances
			.available_amount(order.owner, self.protocol.lrc_token, self.protocol.delegate)
			.await?;
		let token_s_balance = balances
			.available_amount(order.owner, order.token_s, self.protocol.delegate)
			.await?;

		if !token_s_balance.is_positive() {
			return Err(EvaluatorError::Structural(format!(
				"owner {} has no spendable {}",
				order.owner, order.token_s
			))
			.into());
		}
		if self
			.context
			.orderbook
			.is_value_dusted(order.token_s, &token_s_balance)
			.await?
		{
			return Err(EvaluatorError::Structural(format!(
				"spendable {} of owner {} is dust",
				order.token_s, order.owner
			))
			.into());
		}

		Ok(FilledOrder::new(
			state.clone(),
			lrc_balance,
			token_s_balance,
			self.protocol.lrc_token,
		))
	}

	async fn generate_ring(&self, orders: &[OrderState]) -> Result<Ring, MatcherError> {
		let mut filled_orders = Vec::with_capacity(orders.len());
		for state in orders {
			filled_orders.push(self.generate_filled_order(state).await?);
		}
		let mut ring = Ring::new(filled_orders);
		self.context.evaluator.compute_ring(&mut ring).await?;
		Ok(ring)
	}

	pub async fn generate_candidate_ring(
		&self,
		a_to_b: &OrderState,
		b_to_a: &OrderState,
	) -> Result<CandidateRing, MatcherError> {
		let ring = self.generate_ring(&[a_to_b.clone(), b_to_a.clone()]).await?;
		Ok(CandidateRing {
			cost: ring.legal_cost.clone(),
			received: ring.received.clone(),
			unique_id: ring.generate_unique_id(),
			filled_orders: ring
				.orders
				.iter()
				.map(|filled| (filled.hash(), filled.fill_amount_s.clone()))
				.collect(),
		})
	}

	/// Re-prices the orders against their current state and finalizes the ring.
	async fn generate_ring_submit_info(
		&self,
		orders: &[OrderState],
	) -> Result<RingSubmitInfo, MatcherError> {
		let ring = self.generate_ring(orders).await?;
		Ok(self
			.context
			.submitter
			.generate_ring_submit_info(ring)
			.await?)
	}
}

fn log_rejection(error: &MatcherError) {
	if error.is_structural() {
		debug!(error = %error, "Ring rejected");
	} else {
		warn!(error = %error, "Ring evaluation failed");
	}
}

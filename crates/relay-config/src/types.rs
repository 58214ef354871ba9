//! Configuration types for the relay.

use num::BigRational;
use relay_types::{
	decimal_to_rat, Address, FallbackPolicy, ProtocolAddress, SenderAddress, TokenPair,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Complete relay configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	pub relay: RelaySettings,
	pub storage: BackendConfig,
	pub accounts: AccountsConfig,
	pub delivery: BackendConfig,
	pub pricing: BackendConfig,
	pub orderbook: BackendConfig,
	pub miner: MinerConfig,
	#[serde(default)]
	pub matcher: MatcherSettings,
	/// Deployed settlement protocols the relay matches for.
	pub protocols: Vec<ProtocolAddress>,
	/// Token pairs that get a market per protocol.
	pub markets: Vec<TokenPair>,
}

/// Relay identity
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelaySettings {
	pub name: String,
	#[serde(default = "default_log_level")]
	pub log_level: String,
	/// Chain id every transaction is signed for.
	pub chain_id: u64,
}

fn default_log_level() -> String {
	"info".to_string()
}

/// A pluggable service: which implementation to build and its own table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
	pub backend: String,
	#[serde(default = "empty_table")]
	pub config: toml::Value,
}

fn empty_table() -> toml::Value {
	toml::Value::Table(toml::map::Map::new())
}

/// Sender keys, one table per account.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountsConfig {
	#[serde(default = "default_account_backend")]
	pub backend: String,
	pub keys: Vec<toml::Value>,
}

fn default_account_backend() -> String {
	"local".to_string()
}

/// Gas budget for rings of a given length.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RingGas {
	pub orders: usize,
	pub gas: u64,
}

/// Ring evaluation and submission settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MinerConfig {
	pub fee_receipt: Address,
	/// Gas limit bounds; zero disables a bound.
	#[serde(default)]
	pub min_gas_limit: u64,
	#[serde(default)]
	pub max_gas_limit: u64,
	/// Gas price bounds in wei.
	pub min_gas_price: u64,
	pub max_gas_price: u64,
	/// Share of the gas cost someone else pays, as a decimal string.
	#[serde(default)]
	pub subsidy: Decimal,
	/// Share of the net fee the miner keeps.
	#[serde(default = "default_wallet_split")]
	pub wallet_split: Decimal,
	#[serde(default = "default_cvs_threshold")]
	pub rate_ratio_cvs_threshold: i64,
	#[serde(default)]
	pub ring_gas: Vec<RingGas>,
	pub senders: Vec<SenderAddress>,
	#[serde(default)]
	pub fallback: FallbackPolicy,
}

fn default_wallet_split() -> Decimal {
	Decimal::ONE
}

fn default_cvs_threshold() -> i64 {
	10_000
}

impl MinerConfig {
	pub fn subsidy_rate(&self) -> BigRational {
		decimal_to_rat(&self.subsidy)
	}

	pub fn wallet_split_rate(&self) -> BigRational {
		decimal_to_rat(&self.wallet_split)
	}

	/// Explicit ring gas entries keyed by ring length.
	pub fn gas_used_with_length(&self) -> HashMap<usize, u64> {
		self.ring_gas.iter().map(|r| (r.orders, r.gas)).collect()
	}
}

/// Matching round and background task cadence
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MatcherSettings {
	#[serde(default = "default_round_duration_secs")]
	pub round_duration_secs: u64,
	/// Orders pulled per market direction each round.
	#[serde(default = "default_round_order_count")]
	pub round_order_count: usize,
	/// Orders expiring within this many seconds are not matched.
	#[serde(default = "default_reserved_time")]
	pub reserved_time: u64,
	/// Rounds an order sits out after being fully matched.
	#[serde(default = "default_delayed_number")]
	pub delayed_number: i64,
	#[serde(default = "default_max_failed_count")]
	pub max_failed_count: usize,
	#[serde(default = "default_cache_ttl_secs")]
	pub cache_ttl_secs: u64,
	#[serde(default = "default_block_poll_secs")]
	pub block_poll_secs: u64,
	#[serde(default = "default_mined_poll_secs")]
	pub mined_poll_secs: u64,
	#[serde(default = "default_receipt_poll_secs")]
	pub receipt_poll_secs: u64,
	/// Capacity of the ring batch channel between matcher and submitter.
	#[serde(default = "default_batch_queue_size")]
	pub batch_queue_size: usize,
}

fn default_round_duration_secs() -> u64 {
	10
}

fn default_round_order_count() -> usize {
	2
}

fn default_reserved_time() -> u64 {
	45
}

fn default_delayed_number() -> i64 {
	10_000
}

fn default_max_failed_count() -> usize {
	3
}

fn default_cache_ttl_secs() -> u64 {
	86_400 * 2
}

fn default_block_poll_secs() -> u64 {
	3
}

fn default_mined_poll_secs() -> u64 {
	5
}

fn default_receipt_poll_secs() -> u64 {
	5
}

fn default_batch_queue_size() -> usize {
	64
}

impl Default for MatcherSettings {
	fn default() -> Self {
		Self {
			round_duration_secs: default_round_duration_secs(),
			round_order_count: default_round_order_count(),
			reserved_time: default_reserved_time(),
			delayed_number: default_delayed_number(),
			max_failed_count: default_max_failed_count(),
			cache_ttl_secs: default_cache_ttl_secs(),
			block_poll_secs: default_block_poll_secs(),
			mined_poll_secs: default_mined_poll_secs(),
			receipt_poll_secs: default_receipt_poll_secs(),
			batch_queue_size: default_batch_queue_size(),
		}
	}
}

impl MatcherSettings {
	pub fn round_duration(&self) -> Duration {
		Duration::from_secs(self.round_duration_secs)
	}

	pub fn cache_ttl(&self) -> Duration {
		Duration::from_secs(self.cache_ttl_secs)
	}
}

//! Assembles a [`RelayEngine`] from configuration and backend factories.

use crate::engine::{EngineIntervals, RelayEngine};
use crate::error::RelayError;
use relay_account::{AccountError, AccountInterface, AccountService};
use relay_cache::DedupCache;
use relay_config::{BackendConfig, Config};
use relay_delivery::{DeliveryError, DeliveryInterface, DeliveryService};
use relay_evaluator::{BalanceProvider, Evaluator, EvaluatorConfig};
use relay_matcher::{AccountBalances, Matcher, MatcherConfig, MatchingContext};
use relay_orderbook::{OrderBookError, OrderBookInterface, OrderBookService};
use relay_pricing::{GasPriceEvaluator, PriceFeedInterface, PricingError, PricingService};
use relay_storage::{StorageError, StorageInterface, StorageService};
use relay_submitter::{RecordStore, StorageRecordStore, Submitter, SubmitterConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::info;

type StorageFactory =
	Box<dyn Fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> + Send + Sync>;
type AccountFactory =
	Box<dyn Fn(&toml::Value) -> Result<Box<dyn AccountInterface>, AccountError> + Send + Sync>;
type DeliveryFactory =
	Box<dyn Fn(&toml::Value) -> Result<Box<dyn DeliveryInterface>, DeliveryError> + Send + Sync>;
type PriceFeedFactory =
	Box<dyn Fn(&toml::Value) -> Result<Box<dyn PriceFeedInterface>, PricingError> + Send + Sync>;
type OrderBookFactory = Box<
	dyn Fn(&toml::Value, Arc<PricingService>) -> Result<Box<dyn OrderBookInterface>, OrderBookError>
		+ Send
		+ Sync,
>;

/// Picks the factory registered under the section's backend name.
fn factory_for<'a, F>(
	factories: &'a HashMap<String, F>,
	section: &str,
	backend: &BackendConfig,
) -> Result<&'a F, RelayError> {
	factories.get(&backend.backend).ok_or_else(|| {
		RelayError::Config(format!(
			"Unknown {} backend '{}'",
			section, backend.backend
		))
	})
}

pub struct RelayBuilder {
	config: Config,
	storage_factories: HashMap<String, StorageFactory>,
	account_factories: HashMap<String, AccountFactory>,
	delivery_factories: HashMap<String, DeliveryFactory>,
	pricing_factories: HashMap<String, PriceFeedFactory>,
	orderbook_factories: HashMap<String, OrderBookFactory>,
}

impl RelayBuilder {
	pub fn new(config: Config) -> Self {
		Self {
			config,
			storage_factories: HashMap::new(),
			account_factories: HashMap::new(),
			delivery_factories: HashMap::new(),
			pricing_factories: HashMap::new(),
			orderbook_factories: HashMap::new(),
		}
	}

	pub fn with_storage_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> + Send + Sync + 'static,
	{
		self.storage_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub fn with_account_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<Box<dyn AccountInterface>, AccountError> + Send + Sync + 'static,
	{
		self.account_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub fn with_delivery_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<Box<dyn DeliveryInterface>, DeliveryError> + Send + Sync + 'static,
	{
		self.delivery_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub fn with_pricing_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<Box<dyn PriceFeedInterface>, PricingError> + Send + Sync + 'static,
	{
		self.pricing_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub fn with_orderbook_factory<F>(mut self, name: &str, factory: F) -> Self
	where
		F: Fn(&toml::Value, Arc<PricingService>) -> Result<Box<dyn OrderBookInterface>, OrderBookError>
			+ Send
			+ Sync
			+ 'static,
	{
		self.orderbook_factories
			.insert(name.to_string(), Box::new(factory));
		self
	}

	pub async fn build(self) -> Result<RelayEngine, RelayError> {
		let config = &self.config;

		let storage_factory = factory_for(&self.storage_factories, "storage", &config.storage)?;
		let storage = Arc::new(StorageService::new(storage_factory(&config.storage.config)?));

		let account_factory = self
			.account_factories
			.get(&config.accounts.backend)
			.ok_or_else(|| {
				RelayError::Config(format!(
					"Unknown accounts backend '{}'",
					config.accounts.backend
				))
			})?;
		let accounts = config
			.accounts
			.keys
			.iter()
			.map(|key| account_factory(key))
			.collect::<Result<Vec<_>, _>>()?;
		let accounts = Arc::new(AccountService::new(accounts));

		let delivery_factory = factory_for(&self.delivery_factories, "delivery", &config.delivery)?;
		let delivery = Arc::new(DeliveryService::new(
			delivery_factory(&config.delivery.config)?,
			accounts,
		));
		if delivery.chain_id() != config.relay.chain_id {
			return Err(RelayError::Config(format!(
				"Ledger chain id {} does not match configured chain id {}",
				delivery.chain_id(),
				config.relay.chain_id
			)));
		}

		let pricing_factory = factory_for(&self.pricing_factories, "pricing", &config.pricing)?;
		let pricing = Arc::new(PricingService::new(pricing_factory(&config.pricing.config)?));

		let orderbook_factory =
			factory_for(&self.orderbook_factories, "orderbook", &config.orderbook)?;
		let orderbook = Arc::new(OrderBookService::new(orderbook_factory(
			&config.orderbook.config,
			pricing.clone(),
		)?));

		let cache = Arc::new(DedupCache::new(storage.clone(), config.matcher.cache_ttl()));
		let records: Arc<dyn RecordStore> = Arc::new(StorageRecordStore::new(storage));
		let gas_prices = Arc::new(GasPriceEvaluator::default());
		let balances: Arc<dyn BalanceProvider> =
			Arc::new(AccountBalances::new(delivery.clone(), cache.clone()));

		let miner = &config.miner;
		let mut gas_used_with_length = EvaluatorConfig::default().gas_used_with_length;
		gas_used_with_length.extend(miner.gas_used_with_length());
		let evaluator = Arc::new(Evaluator::new(
			EvaluatorConfig {
				fee_receipt: miner.fee_receipt,
				rate_ratio_cvs_threshold: miner.rate_ratio_cvs_threshold,
				gas_used_with_length,
				subsidy: miner.subsidy_rate(),
				wallet_split: miner.wallet_split_rate(),
				min_gas_price: u128::from(miner.min_gas_price),
				max_gas_price: u128::from(miner.max_gas_price),
			},
			config.protocols.clone(),
			pricing,
			gas_prices.clone(),
			balances.clone(),
		));

		let (result_tx, result_rx) = mpsc::unbounded_channel();
		let submitter = Arc::new(
			Submitter::new(
				SubmitterConfig {
					fee_receipt: miner.fee_receipt,
					min_gas_limit: miner.min_gas_limit,
					max_gas_limit: miner.max_gas_limit,
					senders: miner.senders.clone(),
					fallback: miner.fallback,
				},
				delivery.clone(),
				records.clone(),
				cache.clone(),
				result_tx,
			)
			.await?,
		);

		let settings = &config.matcher;
		let context = Arc::new(MatchingContext {
			config: MatcherConfig {
				round_duration: settings.round_duration(),
				round_order_count: settings.round_order_count,
				reserved_time: settings.reserved_time,
				delayed_number: settings.delayed_number,
				max_failed_count: settings.max_failed_count,
			},
			orderbook,
			evaluator,
			submitter: submitter.clone(),
			cache: cache.clone(),
			balances,
		});

		let (batch_tx, batch_rx) = mpsc::channel(settings.batch_queue_size);
		let matcher = Arc::new(Matcher::new(
			context,
			records,
			&config.markets,
			&config.protocols,
			batch_tx,
		));

		info!(
			relay = %config.relay.name,
			chain_id = config.relay.chain_id,
			markets = matcher.market_count().await,
			senders = miner.senders.len(),
			"Relay assembled"
		);

		let intervals = EngineIntervals {
			block_poll: Duration::from_secs(settings.block_poll_secs.max(1)),
			round: settings.round_duration(),
			receipt_poll: Duration::from_secs(settings.receipt_poll_secs.max(1)),
			mined_poll: Duration::from_secs(settings.mined_poll_secs.max(1)),
		};

		Ok(RelayEngine {
			intervals,
			delivery,
			gas_prices,
			cache,
			submitter,
			matcher,
			channels: Mutex::new(Some((batch_rx, result_rx))),
			shutdown_tx: broadcast::channel(1).0,
			tasks: Mutex::new(JoinSet::new()),
		})
	}
}

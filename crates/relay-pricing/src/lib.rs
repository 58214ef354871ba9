//! Reference-currency valuation for the relay.
//!
//! The evaluator prices every fee and gas cost in a single reference
//! ("legal") currency. This crate holds the price-feed contract, a
//! fixed-table implementation and the gas-price evaluator fed from blocks.

use async_trait::async_trait;
use num::BigRational;
use relay_types::{Address, ConfigSchema};
use thiserror::Error;

pub mod gas;

pub mod implementations {
	pub mod fixed;
}

pub use gas::GasPriceEvaluator;

#[derive(Debug, Error)]
pub enum PricingError {
	#[error("No price for token {0}")]
	UnknownToken(Address),
	#[error("Price feed unavailable: {0}")]
	Unavailable(String),
	#[error("Invalid configuration: {0}")]
	Config(String),
}

#[async_trait]
pub trait PriceFeedInterface: Send + Sync {
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Reference-currency value of `amount` base units of `token`.
	async fn legal_currency_value(
		&self,
		token: Address,
		amount: &BigRational,
	) -> Result<BigRational, PricingError>;

	/// Reference-currency value of `amount` wei.
	async fn legal_currency_value_of_eth(
		&self,
		amount: &BigRational,
	) -> Result<BigRational, PricingError>;
}

pub struct PricingService {
	feed: Box<dyn PriceFeedInterface>,
}

impl PricingService {
	pub fn new(feed: Box<dyn PriceFeedInterface>) -> Self {
		Self { feed }
	}

	pub async fn legal_currency_value(
		&self,
		token: Address,
		amount: &BigRational,
	) -> Result<BigRational, PricingError> {
		self.feed.legal_currency_value(token, amount).await
	}

	pub async fn legal_currency_value_of_eth(
		&self,
		amount: &BigRational,
	) -> Result<BigRational, PricingError> {
		self.feed.legal_currency_value_of_eth(amount).await
	}
}

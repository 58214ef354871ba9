use relay_account::AccountError;
use relay_delivery::DeliveryError;
use relay_matcher::MatcherError;
use relay_orderbook::OrderBookError;
use relay_pricing::PricingError;
use relay_storage::StorageError;
use relay_submitter::SubmitterError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
	#[error("Configuration error: {0}")]
	Config(String),

	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),

	#[error("Account error: {0}")]
	Account(#[from] AccountError),

	#[error("Delivery error: {0}")]
	Delivery(#[from] DeliveryError),

	#[error("Pricing error: {0}")]
	Pricing(#[from] PricingError),

	#[error("Order book error: {0}")]
	OrderBook(#[from] OrderBookError),

	#[error("Submitter error: {0}")]
	Submitter(#[from] SubmitterError),

	#[error("Matcher error: {0}")]
	Matcher(#[from] MatcherError),

	#[error("Lifecycle error: {0}")]
	Lifecycle(String),
}

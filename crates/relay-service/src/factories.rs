//! Backend names understood by the `relay-miner` binary.

use relay_core::RelayBuilder;

/// Registers every shipped backend under the name used in configuration.
pub fn register_all(builder: RelayBuilder) -> RelayBuilder {
	builder
		.with_storage_factory("memory", relay_storage::implementations::memory::create_storage)
		.with_storage_factory("file", relay_storage::implementations::file::create_storage)
		.with_account_factory("local", relay_account::implementations::local::create_account)
		.with_delivery_factory(
			"http",
			relay_delivery::implementations::evm::alloy::create_http_delivery,
		)
		.with_pricing_factory("fixed", relay_pricing::implementations::fixed::create_price_feed)
		.with_orderbook_factory(
			"memory",
			relay_orderbook::implementations::memory::create_orderbook,
		)
}

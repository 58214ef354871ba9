//! Price feed backed by a static table from configuration.

use crate::{PriceFeedInterface, PricingError};
use async_trait::async_trait;
use num::BigRational;
use relay_types::{
	parse_decimal, pow10, validate_address, validate_decimal, Address, ConfigSchema, Field,
	FieldType, Schema, ValidationError,
};
use std::collections::HashMap;

const ETH_DECIMALS: u32 = 18;

#[derive(Debug, Clone)]
struct TokenPrice {
	price: BigRational,
	decimals: u32,
}

/// Values tokens as `amount / 10^decimals * price`.
pub struct FixedPriceFeed {
	eth_price: BigRational,
	tokens: HashMap<Address, TokenPrice>,
}

impl FixedPriceFeed {
	pub fn new(eth_price: BigRational) -> Self {
		Self {
			eth_price,
			tokens: HashMap::new(),
		}
	}

	pub fn with_token(mut self, token: Address, price: BigRational, decimals: u32) -> Self {
		self.tokens.insert(token, TokenPrice { price, decimals });
		self
	}
}

pub struct FixedPriceFeedSchema;

impl ConfigSchema for FixedPriceFeedSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![Field::new("eth_price", FieldType::String).with_validator(validate_decimal)],
			vec![Field::new(
				"tokens",
				FieldType::Array(Box::new(FieldType::Table(Schema::new(
					vec![
						Field::new("address", FieldType::String).with_validator(validate_address),
						Field::new("price", FieldType::String).with_validator(validate_decimal),
						Field::new(
							"decimals",
							FieldType::Integer {
								min: Some(0),
								max: Some(77),
							},
						),
					],
					vec![],
				)))),
			)],
		);

		schema.validate(config)
	}
}

#[async_trait]
impl PriceFeedInterface for FixedPriceFeed {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FixedPriceFeedSchema)
	}

	async fn legal_currency_value(
		&self,
		token: Address,
		amount: &BigRational,
	) -> Result<BigRational, PricingError> {
		let entry = self
			.tokens
			.get(&token)
			.ok_or(PricingError::UnknownToken(token))?;
		Ok(amount / pow10(entry.decimals) * &entry.price)
	}

	async fn legal_currency_value_of_eth(
		&self,
		amount: &BigRational,
	) -> Result<BigRational, PricingError> {
		Ok(amount / pow10(ETH_DECIMALS) * &self.eth_price)
	}
}

/// Factory function to create a fixed price table from configuration.
///
/// Configuration parameters:
/// - `eth_price`: reference-currency price of one ether
/// - `tokens`: array of `{ address, price, decimals }`
pub fn create_price_feed(
	config: &toml::Value,
) -> Result<Box<dyn PriceFeedInterface>, PricingError> {
	FixedPriceFeedSchema
		.validate(config)
		.map_err(|e| PricingError::Config(e.to_string()))?;

	let eth_price = config
		.get("eth_price")
		.and_then(|v| v.as_str())
		.map(parse_decimal)
		.transpose()
		.map_err(|e| PricingError::Config(e.to_string()))?
		.ok_or_else(|| PricingError::Config("eth_price is required".to_string()))?;

	let mut feed = FixedPriceFeed::new(eth_price);
	let tokens = config
		.get("tokens")
		.and_then(|v| v.as_array())
		.cloned()
		.unwrap_or_default();

	for entry in tokens {
		let address = entry
			.get("address")
			.and_then(|v| v.as_str())
			.unwrap_or_default()
			.parse::<Address>()
			.map_err(|e| PricingError::Config(format!("Invalid token address: {}", e)))?;
		let price = parse_decimal(entry.get("price").and_then(|v| v.as_str()).unwrap_or_default())
			.map_err(|e| PricingError::Config(e.to_string()))?;
		let decimals = entry
			.get("decimals")
			.and_then(|v| v.as_integer())
			.unwrap_or(ETH_DECIMALS as i64) as u32;
		feed = feed.with_token(address, price, decimals);
	}

	Ok(Box::new(feed))
}

#[cfg(test)]
mod tests {
	use super::*;
	use relay_types::rat_from_int;

	const LRC: &str = "0x00000000000000000000000000000000000000aa";

	fn config() -> toml::Value {
		toml::from_str(&format!(
			r#"
eth_price = "2000"

[[tokens]]
address = "{LRC}"
price = "0.25"
decimals = 18

[[tokens]]
address = "0x00000000000000000000000000000000000000bb"
price = "1"
decimals = 6
"#
		))
		.unwrap()
	}

	#[tokio::test]
	async fn test_token_value_scales_by_decimals() {
		let feed = create_price_feed(&config()).unwrap();
		let lrc: Address = LRC.parse().unwrap();

		// 4 LRC at 0.25 each
		let amount = rat_from_int(4) * pow10(18);
		let value = feed.legal_currency_value(lrc, &amount).await.unwrap();
		assert_eq!(value, rat_from_int(1));

		let usdc: Address = "0x00000000000000000000000000000000000000bb".parse().unwrap();
		let value = feed
			.legal_currency_value(usdc, &rat_from_int(2_500_000))
			.await
			.unwrap();
		assert_eq!(value, BigRational::new(5.into(), 2.into()));
	}

	#[tokio::test]
	async fn test_eth_value() {
		let feed = create_price_feed(&config()).unwrap();
		let half_ether = pow10(18) / rat_from_int(2);
		let value = feed.legal_currency_value_of_eth(&half_ether).await.unwrap();
		assert_eq!(value, rat_from_int(1000));
	}

	#[tokio::test]
	async fn test_unknown_token_is_an_error() {
		let feed = create_price_feed(&config()).unwrap();
		let result = feed
			.legal_currency_value(Address::repeat_byte(0x42), &rat_from_int(1))
			.await;
		assert!(matches!(result, Err(PricingError::UnknownToken(_))));
	}

	#[test]
	fn test_schema_rejects_bad_price() {
		let config: toml::Value = toml::from_str(
			r#"
eth_price = "lots"
"#,
		)
		.unwrap();
		assert!(create_price_feed(&config).is_err());
	}
}

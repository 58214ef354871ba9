//! Relay configuration: TOML model and loader.
//!
//! The loader reads a TOML file, substitutes `${VAR}` references from the
//! environment, applies `RELAY_*` overrides and rejects configurations the
//! relay cannot start with.

use regex::Regex;
use relay_types::Address;
use std::collections::HashSet;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

mod types;

pub use types::*;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("File not found: {0}")]
	FileNotFound(String),

	#[error("Parse error: {0}")]
	ParseError(String),

	#[error("Validation error: {0}")]
	ValidationError(String),

	#[error("Environment variable not found: {0}")]
	EnvVarNotFound(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),
}

/// Configuration loader with environment variable substitution
pub struct ConfigLoader {
	file_path: Option<String>,
	env_prefix: String,
}

impl Default for ConfigLoader {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigLoader {
	pub fn new() -> Self {
		Self {
			file_path: None,
			env_prefix: "RELAY_".to_string(),
		}
	}

	pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
		self.file_path = Some(path.as_ref().to_string_lossy().to_string());
		self
	}

	pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.env_prefix = prefix.into();
		self
	}

	pub async fn load(&self) -> Result<Config, ConfigError> {
		let Some(file_path) = &self.file_path else {
			return Err(ConfigError::FileNotFound(
				"No configuration file specified".to_string(),
			));
		};
		if !Path::new(file_path).exists() {
			return Err(ConfigError::FileNotFound(file_path.clone()));
		}

		let content = tokio::fs::read_to_string(file_path).await?;
		self.parse(&content)
	}

	/// Substitutes, parses, overrides and validates a configuration document.
	pub fn parse(&self, content: &str) -> Result<Config, ConfigError> {
		let substituted = self.substitute_env_vars(content)?;
		let mut config: Config =
			toml::from_str(&substituted).map_err(|e| ConfigError::ParseError(e.to_string()))?;

		self.apply_env_overrides(&mut config);
		validate_config(&config)?;
		Ok(config)
	}

	fn substitute_env_vars(&self, content: &str) -> Result<String, ConfigError> {
		let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::ParseError(e.to_string()))?;

		let mut result = content.to_string();
		for cap in re.captures_iter(content) {
			let full_match = &cap[0];
			let var_name = &cap[1];

			let env_value = env::var(var_name)
				.map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;

			result = result.replace(full_match, &env_value);
		}

		Ok(result)
	}

	fn apply_env_overrides(&self, config: &mut Config) {
		if let Ok(log_level) = env::var(format!("{}LOG_LEVEL", self.env_prefix)) {
			debug!(log_level, "Overriding log level from environment");
			config.relay.log_level = log_level;
		}
	}
}

/// Rejects configurations the relay cannot run with.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
	let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

	for (section, backend) in [
		("storage", &config.storage),
		("delivery", &config.delivery),
		("pricing", &config.pricing),
		("orderbook", &config.orderbook),
	] {
		if backend.backend.is_empty() {
			return invalid(format!("[{}] backend must be set", section));
		}
		if !backend.config.is_table() {
			return invalid(format!("[{}] config must be a table", section));
		}
	}

	if let Some(chain_id) = config.delivery.config.get("chain_id").and_then(|v| v.as_integer()) {
		if chain_id as u64 != config.relay.chain_id {
			return invalid(format!(
				"delivery chain_id {} does not match relay chain_id {}",
				chain_id, config.relay.chain_id
			));
		}
	}

	if config.accounts.keys.is_empty() {
		return invalid("At least one sender key must be configured".to_string());
	}

	let miner = &config.miner;
	if miner.fee_receipt == Address::ZERO {
		return invalid("miner.fee_receipt must be set".to_string());
	}
	if miner.senders.is_empty() {
		return invalid("miner.senders must not be empty".to_string());
	}
	let mut seen = HashSet::new();
	for sender in &miner.senders {
		if !seen.insert(sender.address) {
			return invalid(format!("Duplicate sender address {}", sender.address));
		}
	}
	if miner.max_gas_limit > 0 && miner.min_gas_limit > miner.max_gas_limit {
		return invalid("miner.min_gas_limit exceeds miner.max_gas_limit".to_string());
	}
	if miner.min_gas_price > miner.max_gas_price {
		return invalid("miner.min_gas_price exceeds miner.max_gas_price".to_string());
	}
	if miner.subsidy.is_sign_negative() {
		return invalid("miner.subsidy must not be negative".to_string());
	}
	if miner.wallet_split.is_sign_negative() || miner.wallet_split > rust_decimal::Decimal::ONE {
		return invalid("miner.wallet_split must be between 0 and 1".to_string());
	}
	if miner.ring_gas.iter().any(|r| r.orders < 2) {
		return invalid("miner.ring_gas entries need at least two orders".to_string());
	}

	let matcher = &config.matcher;
	if matcher.round_duration_secs == 0 {
		return invalid("matcher.round_duration_secs must be positive".to_string());
	}
	if matcher.round_order_count == 0 {
		return invalid("matcher.round_order_count must be positive".to_string());
	}
	if matcher.batch_queue_size == 0 {
		return invalid("matcher.batch_queue_size must be positive".to_string());
	}

	if config.protocols.is_empty() {
		return invalid("At least one protocol must be configured".to_string());
	}
	if config.markets.is_empty() {
		return invalid("At least one market must be configured".to_string());
	}
	if let Some(pair) = config.markets.iter().find(|p| p.token_a == p.token_b) {
		return invalid(format!("Market {} trades against itself", pair.token_a));
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use relay_types::FallbackPolicy;
	use std::io::Write;

	const CONFIG: &str = r#"
[relay]
name = "test-relay"
chain_id = 1

[storage]
backend = "memory"

[accounts]
keys = [{ private_key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80" }]

[delivery]
backend = "http"
config = { rpc_url = "http://localhost:8545", chain_id = 1 }

[pricing]
backend = "fixed"
config = { eth_price = "2000" }

[orderbook]
backend = "memory"

[miner]
fee_receipt = "0x1111111111111111111111111111111111111111"
min_gas_limit = 100000
max_gas_limit = 1000000
min_gas_price = 1000000000
max_gas_price = 50000000000
subsidy = "0.5"
wallet_split = "0.8"
ring_gas = [{ orders = 2, gas = 400000 }]
senders = [{ address = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266", max_pending_count = 4 }]

[matcher]
round_duration_secs = 5

[[protocols]]
contract = "0x2222222222222222222222222222222222222222"
delegate = "0x3333333333333333333333333333333333333333"
lrc_token = "0x4444444444444444444444444444444444444444"

[[markets]]
token_a = "0x5555555555555555555555555555555555555555"
token_b = "0x6666666666666666666666666666666666666666"
"#;

	#[test]
	fn test_parse_full_config() {
		let config = ConfigLoader::new().parse(CONFIG).unwrap();

		assert_eq!(config.relay.name, "test-relay");
		assert_eq!(config.relay.log_level, "info");
		assert_eq!(config.storage.backend, "memory");
		assert!(config.storage.config.is_table());
		assert_eq!(config.accounts.backend, "local");
		assert_eq!(config.miner.senders[0].max_pending_count, 4);
		assert_eq!(config.miner.fallback, FallbackPolicy::FirstConfigured);
		assert_eq!(config.miner.gas_used_with_length().get(&2), Some(&400_000));
		assert_eq!(
			config.miner.subsidy_rate(),
			num::BigRational::new(1.into(), 2.into())
		);
		assert_eq!(config.matcher.round_duration_secs, 5);
		assert_eq!(config.matcher.round_order_count, 2);
		assert_eq!(config.matcher.cache_ttl_secs, 172_800);
		assert_eq!(config.protocols.len(), 1);
		assert_eq!(config.markets.len(), 1);
	}

	#[test]
	fn test_env_substitution() {
		env::set_var("RELAY_TEST_RPC_URL", "http://ledger.internal:8545");
		let content = CONFIG.replace("http://localhost:8545", "${RELAY_TEST_RPC_URL}");

		let config = ConfigLoader::new().parse(&content).unwrap();
		assert_eq!(
			config.delivery.config.get("rpc_url").and_then(|v| v.as_str()),
			Some("http://ledger.internal:8545")
		);
	}

	#[test]
	fn test_missing_env_var_is_fatal() {
		let content = CONFIG.replace("http://localhost:8545", "${RELAY_TEST_UNSET_VARIABLE}");

		let result = ConfigLoader::new().parse(&content);
		assert!(matches!(result, Err(ConfigError::EnvVarNotFound(name)) if name == "RELAY_TEST_UNSET_VARIABLE"));
	}

	#[test]
	fn test_log_level_override() {
		env::set_var("RELAYTEST_LOG_LEVEL", "debug");

		let config = ConfigLoader::new()
			.with_env_prefix("RELAYTEST_")
			.parse(CONFIG)
			.unwrap();
		assert_eq!(config.relay.log_level, "debug");
	}

	#[test]
	fn test_invalid_address_is_a_parse_error() {
		let content = CONFIG.replace(
			"0x1111111111111111111111111111111111111111",
			"0x11111111",
		);

		assert!(matches!(
			ConfigLoader::new().parse(&content),
			Err(ConfigError::ParseError(_))
		));
	}

	#[test]
	fn test_validation_rejects_unusable_configs() {
		let loader = ConfigLoader::new();
		let cases = [
			(
				"fee_receipt = \"0x1111111111111111111111111111111111111111\"",
				"fee_receipt = \"0x0000000000000000000000000000000000000000\"",
			),
			(
				"senders = [{ address = \"0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266\", max_pending_count = 4 }]",
				"senders = []",
			),
			("wallet_split = \"0.8\"", "wallet_split = \"1.5\""),
			("min_gas_price = 1000000000", "min_gas_price = 90000000000"),
			(
				"config = { rpc_url = \"http://localhost:8545\", chain_id = 1 }",
				"config = { rpc_url = \"http://localhost:8545\", chain_id = 5 }",
			),
			(
				"token_b = \"0x6666666666666666666666666666666666666666\"",
				"token_b = \"0x5555555555555555555555555555555555555555\"",
			),
		];

		for (from, to) in cases {
			let content = CONFIG.replace(from, to);
			assert_ne!(content, CONFIG, "replacement {from} did not apply");
			assert!(
				matches!(loader.parse(&content), Err(ConfigError::ValidationError(_))),
				"expected validation error for {to}"
			);
		}
	}

	#[tokio::test]
	async fn test_load_from_file() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(CONFIG.as_bytes()).unwrap();

		let config = ConfigLoader::new().with_file(file.path()).load().await.unwrap();
		assert_eq!(config.relay.chain_id, 1);

		let missing = ConfigLoader::new()
			.with_file("/nonexistent/relay.toml")
			.load()
			.await;
		assert!(matches!(missing, Err(ConfigError::FileNotFound(_))));
	}
}

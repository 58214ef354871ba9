use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_config::{Config, ConfigLoader};
use relay_core::RelayBuilder;
use std::path::PathBuf;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod factories;

#[derive(Parser)]
#[command(name = "relay-miner")]
#[command(about = "Ring matching relay", long_about = None)]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,

	#[arg(short, long, value_name = "FILE", default_value = "config/relay.toml")]
	config: PathBuf,

	/// Overrides the configured log level
	#[arg(long)]
	log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
	/// Start the relay
	Start,
	/// Validate the configuration file
	Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();

	let config = ConfigLoader::new()
		.with_file(&cli.config)
		.load()
		.await
		.with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

	let log_level = cli
		.log_level
		.clone()
		.unwrap_or_else(|| config.relay.log_level.clone());
	setup_tracing(&log_level)?;
	info!("Loaded configuration from: {:?}", cli.config);

	match cli.command {
		Some(Commands::Start) | None => start_relay(config).await,
		Some(Commands::Validate) => validate_config(&config),
	}
}

async fn start_relay(config: Config) -> Result<()> {
	info!(
		name = %config.relay.name,
		chain_id = config.relay.chain_id,
		"Starting relay"
	);

	let engine = factories::register_all(RelayBuilder::new(config))
		.build()
		.await
		.context("Failed to build relay")?;

	engine.start().await.context("Failed to start relay")?;

	setup_shutdown_signal().await;
	info!("Shutdown signal received, stopping relay...");

	engine
		.shutdown()
		.await
		.context("Failed to shut down relay")?;

	Ok(())
}

fn validate_config(config: &Config) -> Result<()> {
	info!("Configuration is valid");
	info!("Relay name: {}", config.relay.name);
	info!("Storage: {}", config.storage.backend);
	info!("Delivery: {}", config.delivery.backend);
	info!("Pricing: {}", config.pricing.backend);
	info!("Order book: {}", config.orderbook.backend);
	info!("Senders: {}", config.miner.senders.len());
	info!(
		"Markets: {} pairs x {} protocols",
		config.markets.len(),
		config.protocols.len()
	);

	Ok(())
}

fn setup_tracing(log_level: &str) -> Result<()> {
	let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

	tracing_subscriber::registry()
		.with(env_filter)
		.with(tracing_subscriber::fmt::layer())
		.init();

	Ok(())
}

async fn setup_shutdown_signal() {
	let ctrl_c = async {
		signal::ctrl_c()
			.await
			.expect("failed to install Ctrl+C handler");
	};

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.expect("failed to install signal handler")
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}

// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use indexer_agent::{build_networks, rav_redemption_config, redemption_config, spawn_rav_redemption_ticker, wallet_boundary::UnconfiguredWallet};
use indexer_config::Config;

#[derive(Parser, Debug)]
#[command(author, version, about = "The indexer agent's control plane")]
struct Cli {
    /// Path to the agent's TOML configuration file.
    #[arg(long, env = "INDEXER_AGENT_CONFIG", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).json().init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    info!(networks = config.networks.len(), "loaded configuration");

    let pool = PgPoolOptions::new().max_connections(10).connect(&config.database.connection_string()).await?;

    let networks = build_networks(&config, pool.clone(), config.indexer_infrastructure.indexer_address).await?;
    info!(count = networks.len(), "instantiated per-network components");

    let wallet = Arc::new(UnconfiguredWallet);

    for network_identifier in networks.keys().map(str::to_string).collect::<Vec<_>>() {
        let network = networks.get(&network_identifier)?;
        let network_config = &config.networks[&network_identifier];

        let redemption = redemption_config(network_config)?;
        network.receipts.clone().spawn_tickers(wallet.clone(), redemption);

        let rav_redemption = rav_redemption_config(&network_identifier, network_config)?;
        spawn_rav_redemption_ticker(pool.clone(), wallet.clone(), wallet.clone(), network.eligible_allocations.clone(), rav_redemption);

        info!(network = network_identifier, "spawned receipt collection, voucher redemption, and RAV redemption tickers");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

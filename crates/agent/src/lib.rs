// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Multi-network fan-out (C10): wires one instance of the eligible
//! allocation monitor (C7) and receipt/voucher pipeline (C8) per
//! `networkIdentifier`, plus the shared graft resolver (C5) and
//! transaction manager (C6) surfaces each network's operations call
//! through.

pub mod network_map;
pub mod wallet_boundary;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use thegraph_core::Address;
use tokio::sync::watch;
use tracing::warn;

use indexer_allocation::Allocation;
use indexer_monitor::allocation_monitor;
use indexer_query::SubgraphClient;
use indexer_receipts::gateway::GatewayClient;
use indexer_receipts::ReceiptPipeline;
use indexer_tap_agent::proof::AllocationProofSigner;
use indexer_tap_agent::{redemption_tick, EscrowRedeemer, RavRedemptionConfig};

use indexer_config::{Config, NetworkConfig};
use network_map::NetworkMap;

/// Everything C4..C9 need to operate against one protocol network.
pub struct ProtocolNetwork {
    pub network_identifier: String,
    pub eligible_allocations: watch::Receiver<Vec<Allocation>>,
    pub receipts: Arc<ReceiptPipeline>,
}

/// Builds one [`ProtocolNetwork`] per entry in `config.networks`, per
/// §9's "a naïve map from string to component instance" design note.
pub async fn build_networks(config: &Config, pool: PgPool, indexer_address: thegraph_core::Address) -> anyhow::Result<NetworkMap<ProtocolNetwork>> {
    let mut networks = NetworkMap::new();

    for (network_identifier, network_config) in &config.networks {
        let graph_network_id: u64 = network_identifier
            .strip_prefix("eip155:")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("`{network_identifier}` is not a `eip155:<chainId>` network identifier"))?;

        let network_subgraph = SubgraphClient::new(reqwest::Client::new(), network_config.network_subgraph_endpoint.clone(), None);

        let eligible_allocations = allocation_monitor(network_subgraph, indexer_address, graph_network_id, Duration::from_secs(120)).await?;

        let gateway = GatewayClient::new(reqwest::Client::new(), network_config.gateway_url.clone());
        let receipts = Arc::new(ReceiptPipeline::new(pool.clone(), gateway, network_identifier.clone()).await?);

        networks.insert(
            network_identifier.clone(),
            ProtocolNetwork {
                network_identifier: network_identifier.clone(),
                eligible_allocations,
                receipts,
            },
        )?;
    }

    Ok(networks)
}

pub fn redemption_config(network_config: &NetworkConfig) -> anyhow::Result<indexer_receipts::redemption::RedemptionConfig> {
    Ok(indexer_receipts::redemption::RedemptionConfig {
        max_batch_size: network_config.voucher_redemption_max_batch_size,
        redemption_threshold: network_config
            .voucher_redemption_threshold
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid voucherRedemptionThreshold: {e}"))?,
        batch_threshold: network_config
            .voucher_redemption_batch_threshold
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid voucherRedemptionBatchThreshold: {e}"))?,
    })
}

pub fn rav_redemption_config(network_identifier: &str, network_config: &NetworkConfig) -> anyhow::Result<RavRedemptionConfig> {
    Ok(RavRedemptionConfig {
        protocol_network: network_identifier.to_string(),
        escrow_address: network_config.escrow_address,
        chain_id: network_config.chain_id,
        finality_time_secs: network_config.finality_time_secs,
        redemption_threshold: network_config
            .voucher_redemption_threshold
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid voucherRedemptionThreshold: {e}"))?,
    })
}

/// Spawns C9's 30s RAV redemption ticker for one protocol network,
/// rebuilding the eligible-allocation lookup map from C7's watcher on every
/// tick.
pub fn spawn_rav_redemption_ticker(
    pool: PgPool,
    signer: Arc<dyn AllocationProofSigner>,
    redeemer: Arc<dyn EscrowRedeemer>,
    eligible_allocations: watch::Receiver<Vec<Allocation>>,
    config: RavRedemptionConfig,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            let eligible: HashMap<Address, Allocation> = eligible_allocations.borrow().iter().cloned().map(|a| (a.id, a)).collect();
            if let Err(e) = redemption_tick(&pool, signer.as_ref(), redeemer.as_ref(), &eligible, &config).await {
                warn!(error = %e, network = %config.protocol_network, "RAV redemption tick failed");
            }
        }
    });
}

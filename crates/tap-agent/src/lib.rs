// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! The RAV redemption pipeline (C9): promotes a sender's signed receipt
//! aggregate vouchers through reorg compensation and finality, then
//! redeems the eligible ones against the escrow contract through the
//! transaction manager (C6).

pub mod db;
pub mod proof;
pub mod types;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use sqlx::PgPool;
use thegraph_core::Address;
use tracing::{info, warn};

use indexer_allocation::Allocation;
use indexer_errors::{indexer_error, IndexerErrorCode};

use proof::{allocation_id_proof_digest, AllocationProofSigner};
use types::Rav;

/// The on-chain side of RAV redemption: wraps the escrow contract and the
/// transaction manager (C6).
#[async_trait]
pub trait EscrowRedeemer: Send + Sync {
    /// Checks whether `scalar_tap_ravs` for `allocation`'s redeem
    /// transaction is still observed on chain (not reorged out).
    async fn redeem_tx_observed(&self, allocation: Address) -> anyhow::Result<bool>;
    /// Submits `escrow.redeem(signedRav, allocationIdProof)`.
    async fn redeem(&self, rav: &Rav, allocation_id_proof: &[u8]) -> anyhow::Result<()>;
}

pub struct RavRedemptionConfig {
    pub protocol_network: String,
    pub escrow_address: Address,
    pub chain_id: u64,
    pub finality_time_secs: i64,
    pub redemption_threshold: BigDecimal,
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Runs one RAV redemption tick per §4.7's five-step algorithm. `eligible`
/// is the current set of the sender's eligible allocations, keyed by id,
/// as tracked by the allocation monitor (C7).
pub async fn redemption_tick(
    pool: &PgPool,
    signer: &dyn AllocationProofSigner,
    redeemer: &dyn EscrowRedeemer,
    eligible: &HashMap<Address, Allocation>,
    config: &RavRedemptionConfig,
) -> Result<(), indexer_errors::IndexerError> {
    // Step 1: reorg compensation and finality promotion.
    let redeemed_not_final = db::redeemed_not_final_allocation_ids(pool, &config.protocol_network).await?;
    let mut vanished = Vec::new();
    for allocation_id in &redeemed_not_final {
        let allocation: Address = match format!("0x{allocation_id}").parse() {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, allocation_id, "malformed allocation id in scalar_tap_ravs");
                continue;
            }
        };
        match redeemer.redeem_tx_observed(allocation).await {
            Ok(true) => {}
            Ok(false) => vanished.push(allocation_id.clone()),
            Err(e) => warn!(error = %e, allocation_id, "failed to check whether a RAV's redeem transaction is still observed"),
        }
    }
    db::compensate_reorg(pool, &vanished, &config.protocol_network).await?;
    db::promote_finalized(pool, now_ms(), config.finality_time_secs, &config.protocol_network).await?;

    // Step 2: fetch unredeemed, non-final RAVs and join against the
    // network subgraph's eligible allocation set.
    let ravs = db::unredeemed_finalized_false_ravs(pool, &config.protocol_network).await?;

    let mut joined = Vec::new();
    for rav in ravs {
        let allocation_addr = match rav.allocation() {
            Ok(a) => a,
            Err(e) => {
                warn!(error = e, "RAV has a malformed allocation id, dropping");
                continue;
            }
        };
        match eligible.get(&allocation_addr) {
            Some(allocation) => joined.push((rav, allocation.clone())),
            None => info!(allocation = %allocation_addr, "no matching allocation for RAV, dropping"),
        }
    }

    // Step 3: partition by redemption threshold.
    let to_redeem = eligible_for_redemption(joined, &config.redemption_threshold);

    if to_redeem.is_empty() {
        return Ok(());
    }

    // Step 4: sign the allocation id proof and redeem each eligible RAV.
    let mut redeemed = Vec::new();
    let mut seen_allocations = HashSet::new();
    for (rav, allocation) in to_redeem {
        if !seen_allocations.insert(allocation.id) {
            continue;
        }
        let sender = match rav.sender() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = e, "RAV has a malformed sender address, dropping");
                continue;
            }
        };

        let digest = allocation_id_proof_digest(sender, allocation.id, config.escrow_address, config.chain_id);
        let proof = match signer.sign_allocation_id_proof(digest).await {
            Ok(p) => p,
            Err(e) => {
                let err = indexer_error(IndexerErrorCode::IE055).with_cause(e);
                warn!(error = %err, allocation = %allocation.id, "failed to sign allocationIdProof");
                continue;
            }
        };

        match redeemer.redeem(&rav, &proof).await {
            Ok(()) => {
                if let Err(e) = db::mark_redeemed(pool, &rav.allocation_id, &rav.sender_address, now_ms(), &config.protocol_network).await {
                    warn!(error = %e, allocation = %allocation.id, "redeemed on chain but failed to record it, will retry and may double-redeem");
                }
                info!(allocation = %allocation.id, amount = %rav.value_aggregate, "redeemed RAV");
                // `allocation.id`'s Display is the checksummed `0x` form used
                // by `allocation_summaries.allocation` everywhere else, unlike
                // `rav.allocation_id`'s lowercase-no-prefix TAP schema form.
                redeemed.push((allocation.id.to_string(), rav.value_aggregate.clone()));
            }
            Err(e) => {
                let err = indexer_error(IndexerErrorCode::IE055).with_cause(e);
                warn!(error = %err, allocation = %allocation.id, "failed to redeem RAV on chain");
            }
        }
    }

    // Step 5: settle withdrawn fees for everything redeemed this tick.
    db::settle_withdrawn_fees(pool, &redeemed, &config.protocol_network).await?;

    Ok(())
}

/// Step 3 of §4.7: keep only RAVs whose `valueAggregate` meets the
/// redemption threshold.
fn eligible_for_redemption(joined: Vec<(Rav, Allocation)>, threshold: &BigDecimal) -> Vec<(Rav, Allocation)> {
    joined.into_iter().filter(|(rav, _)| &rav.value_aggregate >= threshold).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopSigner;
    #[async_trait]
    impl AllocationProofSigner for NoopSigner {
        async fn sign_allocation_id_proof(&self, _digest: [u8; 32]) -> anyhow::Result<Vec<u8>> {
            Ok(vec![0u8; 65])
        }
    }

    struct NoopRedeemer;
    #[async_trait]
    impl EscrowRedeemer for NoopRedeemer {
        async fn redeem_tx_observed(&self, _allocation: Address) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn redeem(&self, _rav: &Rav, _proof: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_allocation(id: Address) -> Allocation {
        use indexer_allocation::{AllocationStatus, SubgraphDeployment};
        Allocation {
            id,
            indexer: Address::ZERO,
            subgraph_deployment: SubgraphDeployment {
                id: "QmTXzATwNfgGVukV1fX2T6xw9f6LAYRVeVg4owRXZaU16Z".parse().unwrap(),
                denied_at: None,
            },
            allocated_tokens: thegraph_core::alloy::primitives::U256::from(1_000u64),
            created_at_epoch: 100,
            created_at_block_hash: "0x00".to_string(),
            closed_at_epoch: None,
            closed_at_block_hash: None,
            poi: None,
            query_fee_rebates: None,
            query_fees_collected: None,
            status: AllocationStatus::Active,
            protocol_network: "eip155:1".to_string(),
        }
    }

    fn test_rav(allocation_id: &str, value_aggregate: i64) -> Rav {
        Rav {
            allocation_id: allocation_id.to_string(),
            sender_address: "3333333333333333333333333333333333333333".to_string(),
            value_aggregate: BigDecimal::from(value_aggregate),
            signature: "0x00".to_string(),
            last: true,
            final_: false,
            redeemed_at: None,
        }
    }

    #[test]
    fn eligible_for_redemption_keeps_only_ravs_at_or_above_threshold() {
        use thegraph_core::alloy::primitives::address;

        let threshold = BigDecimal::from(100);

        let above = address!("1111111111111111111111111111111111111111");
        let below = address!("2222222222222222222222222222222222222222");

        let joined = vec![
            (test_rav("1111111111111111111111111111111111111111", 150), test_allocation(above)),
            (test_rav("2222222222222222222222222222222222222222", 10), test_allocation(below)),
        ];

        let kept = eligible_for_redemption(joined, &threshold);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].1.id, above);
        assert_eq!(kept[0].0.value_aggregate, BigDecimal::from(150));
    }

    #[test]
    fn eligible_for_redemption_keeps_value_exactly_at_threshold() {
        let threshold = BigDecimal::from(100);
        let allocation = test_allocation(Address::ZERO);
        let joined = vec![(test_rav("0000000000000000000000000000000000000000", 100), allocation)];

        assert_eq!(eligible_for_redemption(joined, &threshold).len(), 1);
    }

    #[tokio::test]
    async fn signer_and_redeemer_stubs_are_callable() {
        let signer = NoopSigner;
        let redeemer = NoopRedeemer;
        assert_eq!(signer.sign_allocation_id_proof([0u8; 32]).await.unwrap().len(), 65);
        assert!(redeemer.redeem_tx_observed(Address::ZERO).await.unwrap());
    }
}

// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Wallet key management is out of this agent's scope: it only describes
//! the interfaces a signer and a transaction broadcaster must satisfy
//! (C6's [`FeeOracle`]/[`TransactionSender`], C9's
//! [`AllocationProofSigner`]). These stand-ins fail clearly so a fully
//! wired deployment notices a missing wallet integration instead of
//! silently no-opping.

use async_trait::async_trait;
use thegraph_core::alloy::primitives::TxHash;

use indexer_receipts::redemption::VoucherExchange;
use indexer_receipts::VoucherRecord;
use indexer_tap_agent::proof::AllocationProofSigner;
use indexer_tap_agent::EscrowRedeemer;
use indexer_transact::{FeeData, FeeOracle, SendAttempt, TransactionConfig, TransactionSender};

pub struct UnconfiguredWallet;

#[async_trait]
impl FeeOracle for UnconfiguredWallet {
    async fn fee_data(&self) -> anyhow::Result<FeeData> {
        anyhow::bail!("no wallet/provider configured for fee data; supply a FeeOracle implementation")
    }
}

#[async_trait]
impl TransactionSender<TxHash> for UnconfiguredWallet {
    async fn estimate(&self) -> anyhow::Result<u128> {
        anyhow::bail!("no wallet/provider configured for gas estimation")
    }

    async fn send(&self, _config: &TransactionConfig) -> SendAttempt<TxHash> {
        SendAttempt::Error("no wallet/provider configured for transaction submission".to_string())
    }
}

#[async_trait]
impl AllocationProofSigner for UnconfiguredWallet {
    async fn sign_allocation_id_proof(&self, _digest: [u8; 32]) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("no operator wallet configured for allocationIdProof signing")
    }
}

#[async_trait]
impl VoucherExchange for UnconfiguredWallet {
    async fn allocation_redeemed(&self, _allocation: thegraph_core::Address) -> anyhow::Result<bool> {
        anyhow::bail!("no allocation exchange contract client configured")
    }

    async fn redeem_many(&self, _vouchers: &[VoucherRecord]) -> anyhow::Result<()> {
        anyhow::bail!("no allocation exchange contract client configured")
    }
}

#[async_trait]
impl EscrowRedeemer for UnconfiguredWallet {
    async fn redeem_tx_observed(&self, _allocation: thegraph_core::Address) -> anyhow::Result<bool> {
        anyhow::bail!("no escrow contract client configured")
    }

    async fn redeem(&self, _rav: &indexer_tap_agent::types::Rav, _proof: &[u8]) -> anyhow::Result<()> {
        anyhow::bail!("no escrow contract client configured")
    }
}

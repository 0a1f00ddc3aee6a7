// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Shared test fixtures: builders for the core domain types, reused across
//! every crate's unit tests instead of hand-rolling struct literals.

use bigdecimal::BigDecimal;
use lazy_static::lazy_static;
use thegraph_core::alloy::primitives::{address, U256};
use thegraph_core::{Address, DeploymentId};

use indexer_allocation::{Allocation, AllocationStatus, SubgraphDeployment};
use indexer_receipts::types::{AllocationReceipt, Voucher};
use indexer_tap_agent::types::Rav;

lazy_static! {
    pub static ref INDEXER_ADDRESS: Address = address!("1111111111111111111111111111111111111111");
    pub static ref ALLOCATION_ID: Address = address!("2222222222222222222222222222222222222222");
    pub static ref DEPLOYMENT_ID: DeploymentId = "QmTXzATwNfgGVukV1fX2T6xw9f6LAYRVeVg4owRXZaU16Z"
        .parse()
        .expect("fixture deployment id is valid");
}

#[bon::builder]
pub fn allocation(
    #[builder(default = *ALLOCATION_ID)] id: Address,
    #[builder(default = *INDEXER_ADDRESS)] indexer: Address,
    #[builder(default = *DEPLOYMENT_ID)] deployment: DeploymentId,
    #[builder(default = AllocationStatus::Active)] status: AllocationStatus,
    #[builder(default = None)] closed_at_epoch: Option<u64>,
    #[builder(default = "eip155:1".to_string())] protocol_network: String,
) -> Allocation {
    Allocation {
        id,
        indexer,
        subgraph_deployment: SubgraphDeployment { id: deployment, denied_at: None },
        allocated_tokens: U256::from(1_000u64),
        created_at_epoch: 100,
        created_at_block_hash: "0x00".to_string(),
        closed_at_epoch,
        closed_at_block_hash: closed_at_epoch.map(|_| "0x01".to_string()),
        poi: None,
        query_fee_rebates: None,
        query_fees_collected: None,
        status,
        protocol_network,
    }
}

#[bon::builder]
pub fn allocation_receipt(
    #[builder(default = 1)] id: i64,
    #[builder(default = *ALLOCATION_ID)] allocation: Address,
    #[builder(default = U256::from(1_000u64))] fees: U256,
    #[builder(default = "eip155:1".to_string())] protocol_network: String,
) -> AllocationReceipt {
    AllocationReceipt {
        id,
        allocation,
        fees,
        signature: [0u8; 65],
        protocol_network,
    }
}

#[bon::builder]
pub fn voucher(
    #[builder(default = *ALLOCATION_ID)] allocation: Address,
    #[builder(default = "1000".to_string())] amount: String,
    #[builder(default = "eip155:1".to_string())] protocol_network: String,
) -> Voucher {
    Voucher {
        allocation,
        protocol_network,
        amount,
        signature: "0x00".to_string(),
    }
}

#[bon::builder]
pub fn rav(
    #[builder(default = "2222222222222222222222222222222222222222".to_string())] allocation_id: String,
    #[builder(default = "3333333333333333333333333333333333333333".to_string())] sender_address: String,
    #[builder(default = BigDecimal::from(1_000))] value_aggregate: BigDecimal,
    #[builder(default = true)] last: bool,
    #[builder(default = false)] final_: bool,
    #[builder(default = None)] redeemed_at: Option<i64>,
) -> Rav {
    Rav {
        allocation_id,
        sender_address,
        value_aggregate,
        signature: "0x00".to_string(),
        last,
        final_,
        redeemed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_builder_defaults_to_active() {
        let a = allocation().call();
        assert!(a.is_active());
    }

    #[test]
    fn allocation_builder_overrides_take_effect() {
        let a = allocation().status(AllocationStatus::Closed).closed_at_epoch(Some(200)).call();
        assert!(!a.is_active());
        assert_eq!(a.closed_at_epoch, Some(200));
    }

    #[test]
    fn rav_builder_produces_a_redeemable_default() {
        let r = rav().call();
        assert!(r.last);
        assert!(!r.final_);
        assert!(r.redeemed_at.is_none());
    }
}

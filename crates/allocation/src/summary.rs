// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! `AllocationSummary`: the durable per-allocation aggregate that both the
//! receipt/voucher pipeline and the RAV pipeline add to as they withdraw
//! fees on chain.

use bigdecimal::BigDecimal;
use thegraph_core::Address;

/// Durable aggregate row for one allocation. `collected_fees` grows as
/// vouchers/RAVs are produced; `withdrawn_fees` grows only after an
/// on-chain redemption succeeds, so `withdrawn_fees <= collected_fees`
/// always holds once both are populated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationSummary {
    pub allocation: Address,
    pub protocol_network: String,
    pub closed_at: Option<i64>,
    pub collected_fees: BigDecimal,
    pub withdrawn_fees: BigDecimal,
}

impl AllocationSummary {
    pub fn new(allocation: Address, protocol_network: impl Into<String>) -> Self {
        Self {
            allocation,
            protocol_network: protocol_network.into(),
            closed_at: None,
            collected_fees: BigDecimal::from(0),
            withdrawn_fees: BigDecimal::from(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thegraph_core::alloy::primitives::address;

    #[test]
    fn new_summary_starts_at_zero() {
        let summary = AllocationSummary::new(address!("0000000000000000000000000000000000000001"), "eip155:1");
        assert_eq!(summary.collected_fees, BigDecimal::from(0));
        assert_eq!(summary.withdrawn_fees, BigDecimal::from(0));
        assert!(summary.closed_at.is_none());
    }
}

// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use thegraph_core::{alloy::primitives::U256, Address};

/// A signed off-chain fee accumulator for queries served against one
/// allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationReceipt {
    /// A loose sequence number assigned at creation; receipts are
    /// collected, encoded, and deleted in this order.
    pub id: i64,
    pub allocation: Address,
    pub fees: U256,
    pub signature: [u8; 65],
    pub protocol_network: String,
}

/// Receipts for one just-closed allocation, queued behind a gateway grace
/// period (`timeout`, wall-clock epoch ms) before they may be collected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationReceiptsBatch {
    pub allocation: Address,
    pub protocol_network: String,
    pub receipts: Vec<AllocationReceipt>,
    pub timeout: i64,
}

impl PartialOrd for AllocationReceiptsBatch {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AllocationReceiptsBatch {
    /// Reversed so a `BinaryHeap<AllocationReceiptsBatch>` is a min-heap on
    /// `timeout`: the batch due soonest compares greatest.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.timeout.cmp(&self.timeout)
    }
}

/// A gateway-signed statement converting a batch of receipts into a single
/// redeemable payment. At most one may exist per (allocation, network).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Voucher {
    pub allocation: Address,
    pub protocol_network: String,
    pub amount: String,
    pub signature: String,
}

/// One shard of a batch too large for a single gateway request. A set of
/// these is well-formed only if every member shares the same `allocation`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialVoucher {
    pub allocation: Address,
    pub fees: String,
    pub signature: String,
    pub receipt_id_min: String,
    pub receipt_id_max: String,
}

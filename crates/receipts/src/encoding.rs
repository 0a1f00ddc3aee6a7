// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Bit-exact wire encoding for the gateway's `collect-receipts` and
//! `partial-voucher` endpoints: a 20-byte allocation address followed by
//! one 112-byte record per receipt.

use std::collections::HashSet;

use thegraph_core::Address;

use crate::types::{AllocationReceipt, PartialVoucher};

const FEES_FIELD_LEN: usize = 33;
const ID_FIELD_LEN: usize = 59;
const SIGNATURE_FIELD_LEN: usize = 65;
pub const RECEIPT_RECORD_LEN: usize = FEES_FIELD_LEN + ID_FIELD_LEN + SIGNATURE_FIELD_LEN;

/// `20 + 112 * receipts.len()` bytes: the allocation address, then each
/// receipt's big-endian fees, sequence id, and signature back to back.
pub fn encode_receipts_buffer(allocation: Address, receipts: &[AllocationReceipt]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20 + RECEIPT_RECORD_LEN * receipts.len());
    buf.extend_from_slice(allocation.as_slice());
    for receipt in receipts {
        buf.extend_from_slice(&encode_fees(receipt.fees));
        buf.extend_from_slice(&encode_id(receipt.id));
        buf.extend_from_slice(&receipt.signature);
    }
    buf
}

fn encode_fees(fees: thegraph_core::alloy::primitives::U256) -> [u8; FEES_FIELD_LEN] {
    let mut out = [0u8; FEES_FIELD_LEN];
    out[1..].copy_from_slice(&fees.to_be_bytes::<32>());
    out
}

fn encode_id(id: i64) -> [u8; ID_FIELD_LEN] {
    let mut out = [0u8; ID_FIELD_LEN];
    let digits = id.to_string();
    let bytes = digits.as_bytes();
    let n = bytes.len().min(ID_FIELD_LEN);
    out[ID_FIELD_LEN - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    out
}

/// Validates that every partial voucher in `vouchers` shares one allocation
/// and returns it alongside the set, or a descriptive error otherwise.
pub fn group_partial_vouchers(vouchers: &[PartialVoucher]) -> Result<Address, String> {
    let unique: HashSet<Address> = vouchers.iter().map(|v| v.allocation).collect();
    match unique.len() {
        0 => Err("partial voucher set must not be empty".to_string()),
        1 => Ok(*unique.iter().next().unwrap()),
        n => Err(format!("Partial vouchers set must be for a single allocation, '{n}' unique allocations represented")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thegraph_core::alloy::primitives::{address, U256};

    fn receipt(id: i64, fees: u64) -> AllocationReceipt {
        AllocationReceipt {
            id,
            allocation: address!("0000000000000000000000000000000000000001"),
            fees: U256::from(fees),
            signature: [7u8; 65],
            protocol_network: "eip155:1".to_string(),
        }
    }

    #[test]
    fn encodes_header_and_per_receipt_record_lengths() {
        let allocation = address!("0000000000000000000000000000000000000001");
        let receipts = vec![receipt(1, 100), receipt(2, 200)];
        let buf = encode_receipts_buffer(allocation, &receipts);
        assert_eq!(buf.len(), 20 + 112 * 2);
        assert_eq!(&buf[..20], allocation.as_slice());
    }

    #[test]
    fn fees_field_is_left_padded_to_33_bytes() {
        let buf = encode_receipts_buffer(address!("0000000000000000000000000000000000000001"), &[receipt(1, 0xff)]);
        let fees_field = &buf[20..20 + 33];
        assert_eq!(fees_field[0], 0);
        assert_eq!(fees_field[32], 0xff);
    }

    #[test]
    fn single_allocation_partial_vouchers_group_cleanly() {
        let allocation = address!("0000000000000000000000000000000000000001");
        let vouchers = vec![
            PartialVoucher {
                allocation,
                fees: "10".into(),
                signature: "0xaa".into(),
                receipt_id_min: "1".into(),
                receipt_id_max: "5".into(),
            },
            PartialVoucher {
                allocation,
                fees: "20".into(),
                signature: "0xbb".into(),
                receipt_id_min: "6".into(),
                receipt_id_max: "10".into(),
            },
        ];
        assert_eq!(group_partial_vouchers(&vouchers).unwrap(), allocation);
    }

    #[test]
    fn mismatched_allocations_fail_grouping() {
        let vouchers = vec![
            PartialVoucher {
                allocation: address!("0000000000000000000000000000000000000001"),
                fees: "10".into(),
                signature: "0xaa".into(),
                receipt_id_min: "1".into(),
                receipt_id_max: "5".into(),
            },
            PartialVoucher {
                allocation: address!("0000000000000000000000000000000000000002"),
                fees: "20".into(),
                signature: "0xbb".into(),
                receipt_id_min: "6".into(),
                receipt_id_max: "10".into(),
            },
        ];
        let err = group_partial_vouchers(&vouchers).unwrap_err();
        assert_eq!(err, "Partial vouchers set must be for a single allocation, '2' unique allocations represented");
    }
}

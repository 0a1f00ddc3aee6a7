// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use bigdecimal::BigDecimal;
use thegraph_core::Address;

/// A signed, escrow-channel aggregate receipt. `allocation_id` is stored
/// lowercase without a `0x` prefix, matching the external TAP schema.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Rav {
    pub allocation_id: String,
    pub sender_address: String,
    pub value_aggregate: BigDecimal,
    pub signature: String,
    pub last: bool,
    pub final_: bool,
    pub redeemed_at: Option<i64>,
}

impl Rav {
    pub fn allocation(&self) -> Result<Address, String> {
        format!("0x{}", self.allocation_id)
            .parse()
            .map_err(|e| format!("invalid allocation id `{}`: {e}", self.allocation_id))
    }

    pub fn sender(&self) -> Result<Address, String> {
        format!("0x{}", self.sender_address)
            .parse()
            .map_err(|e| format!("invalid sender address `{}`: {e}", self.sender_address))
    }
}

// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! The `allocationIdProof` a RAV sender submits alongside the signed RAV:
//! proof that the process redeeming the RAV also controls the allocation's
//! signing key. Wallet key management lives outside this crate's scope, so
//! signing is abstracted behind [`AllocationProofSigner`].

use async_trait::async_trait;
use thegraph_core::alloy::primitives::{keccak256, Address, U256};

/// Signs the `allocationIdProof` digest with the allocation's signing key.
/// A production implementation wraps a wallet or KMS client; tests can
/// stub it with a fixed keypair.
#[async_trait]
pub trait AllocationProofSigner: Send + Sync {
    async fn sign_allocation_id_proof(&self, digest: [u8; 32]) -> anyhow::Result<Vec<u8>>;
}

/// `keccak256(sender ++ allocationId ++ escrowAddress ++ chainId)`, the
/// message the allocation's signing key attests to.
pub fn allocation_id_proof_digest(sender: Address, allocation: Address, escrow: Address, chain_id: u64) -> [u8; 32] {
    let mut buf = Vec::with_capacity(20 + 20 + 20 + 32);
    buf.extend_from_slice(sender.as_slice());
    buf.extend_from_slice(allocation.as_slice());
    buf.extend_from_slice(escrow.as_slice());
    buf.extend_from_slice(&U256::from(chain_id).to_be_bytes::<32>());
    *keccak256(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use thegraph_core::alloy::primitives::address;

    #[test]
    fn digest_changes_with_chain_id() {
        let sender = address!("0000000000000000000000000000000000000001");
        let allocation = address!("0000000000000000000000000000000000000002");
        let escrow = address!("0000000000000000000000000000000000000003");

        let mainnet = allocation_id_proof_digest(sender, allocation, escrow, 1);
        let arbitrum = allocation_id_proof_digest(sender, allocation, escrow, 42161);
        assert_ne!(mainnet, arbitrum);
    }
}

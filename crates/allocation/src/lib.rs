// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! The shared data model: allocations, receipts, vouchers, summaries, and
//! RAVs, plus the pure indexing-rule evaluator that decides whether a
//! deployment should be allocated to.

pub mod deployment_rules;
pub mod summary;

use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use thegraph_core::{alloy::primitives::U256, Address, DeploymentId};

/// An on-chain commitment of indexer stake to a subgraph deployment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub id: Address,
    pub indexer: Address,
    pub subgraph_deployment: SubgraphDeployment,
    pub allocated_tokens: U256,
    pub created_at_epoch: u64,
    pub created_at_block_hash: String,
    pub closed_at_epoch: Option<u64>,
    pub closed_at_block_hash: Option<String>,
    pub poi: Option<[u8; 32]>,
    pub query_fee_rebates: Option<U256>,
    pub query_fees_collected: Option<U256>,
    pub status: AllocationStatus,
    pub protocol_network: String,
}

impl Allocation {
    /// An allocation is active iff it has not yet recorded a closing epoch.
    pub fn is_active(&self) -> bool {
        matches!(self.status, AllocationStatus::Active) && self.closed_at_epoch.is_none()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocationStatus {
    Null,
    Active,
    Closed,
    Finalized,
    Claimed,
}

impl AllocationStatus {
    /// True if `next` is a legal forward transition from `self`. Once
    /// closed, an allocation's status may only move forward.
    pub fn can_transition_to(&self, next: AllocationStatus) -> bool {
        use AllocationStatus::*;
        match self {
            Null => true,
            Active => matches!(next, Active | Closed),
            Closed => matches!(next, Closed | Finalized | Claimed),
            Finalized => matches!(next, Finalized | Claimed),
            Claimed => matches!(next, Claimed),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct SubgraphDeployment {
    pub id: DeploymentId,
    #[serde(rename = "deniedAt")]
    pub denied_at: Option<u64>,
}

impl<'d> Deserialize<'d> for Allocation {
    fn deserialize<D>(deserializer: D) -> Result<Allocation, D::Error>
    where
        D: Deserializer<'d>,
    {
        #[derive(Deserialize)]
        struct InnerIndexer {
            id: Address,
        }

        #[derive(Deserialize)]
        #[allow(non_snake_case)]
        struct Outer {
            id: Address,
            subgraphDeployment: SubgraphDeployment,
            indexer: InnerIndexer,
            allocatedTokens: U256,
            createdAtBlockHash: String,
            createdAtEpoch: u64,
            closedAtEpoch: Option<u64>,
            #[serde(default)]
            closedAtBlockHash: Option<String>,
            #[serde(default, rename = "protocolNetwork")]
            protocol_network: Option<String>,
        }

        let outer = Outer::deserialize(deserializer)?;
        let status = if outer.closedAtEpoch.is_some() {
            AllocationStatus::Closed
        } else {
            AllocationStatus::Active
        };

        Ok(Allocation {
            id: outer.id,
            status,
            subgraph_deployment: outer.subgraphDeployment,
            indexer: outer.indexer.id,
            allocated_tokens: outer.allocatedTokens,
            created_at_epoch: outer.createdAtEpoch,
            created_at_block_hash: outer.createdAtBlockHash,
            closed_at_epoch: outer.closedAtEpoch,
            closed_at_block_hash: outer.closedAtBlockHash,
            poi: None,
            query_fee_rebates: None,
            query_fees_collected: None,
            protocol_network: outer.protocol_network.unwrap_or_default(),
        })
    }
}

/// Parses a `DeploymentId` from its IPFS-hash string form, surfacing a
/// uniform error for callers that accept deployment ids from configuration
/// or RPC payloads.
pub fn parse_deployment_id(raw: &str) -> Result<DeploymentId, String> {
    DeploymentId::from_str(raw).map_err(|e| format!("invalid subgraph deployment id `{raw}`: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_only_move_forward() {
        use AllocationStatus::*;
        assert!(Active.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Active));
        assert!(Closed.can_transition_to(Finalized));
        assert!(Finalized.can_transition_to(Claimed));
        assert!(!Claimed.can_transition_to(Active));
    }
}

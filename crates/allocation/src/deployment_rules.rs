// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Subgraph deployment ID handling and the interface the reconciler uses to
//! ask "should we allocate to this deployment?". The rule evaluation itself
//! (cost models, indexing rule rows, allocation-amount decisions) lives
//! outside this core; we only depend on its interface here.

use thegraph_core::DeploymentId;

/// What the (externally supplied) rule evaluator decided for a deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexingDecision {
    Allocate,
    Skip,
}

/// The interface the core invokes to ask whether it should be indexing and
/// allocating to a given deployment. A faithful rule evaluator consults
/// indexing rules, cost models, and the indexer's available stake; that
/// logic is out of scope here.
pub trait RuleEvaluator: Send + Sync {
    fn decide(&self, deployment: &DeploymentId) -> IndexingDecision;
}

/// A rule evaluator that always allocates; useful as a default in tests and
/// for indexers that manage allocation decisions out of band.
pub struct AlwaysAllocate;

impl RuleEvaluator for AlwaysAllocate {
    fn decide(&self, _deployment: &DeploymentId) -> IndexingDecision {
        IndexingDecision::Allocate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn always_allocate_allocates_every_deployment() {
        let id = DeploymentId::from_str("QmTXzATwNfgGVukV1fX2T6xw9f6LAYRVeVg4owRXZaU16Z").unwrap();
        assert_eq!(AlwaysAllocate.decide(&id), IndexingDecision::Allocate);
    }
}

// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Walks a subgraph's graft-base lineage through IPFS-hosted manifests and
//! decides which bases must be deployed or removed so the target can sync.

use async_trait::async_trait;
use indexer_errors::{indexer_error, IndexerErrorCode};
use serde::Deserialize;
use thegraph_core::DeploymentId;

pub mod ipfs;

pub const DEFAULT_MAX_ITERATIONS: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub graft: Option<GraftDirective>,
}

impl Manifest {
    fn graft_base(&self) -> Option<&GraftDirective> {
        if self.features.iter().any(|f| f == "grafting") {
            self.graft.as_ref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraftDirective {
    pub base: DeploymentId,
    pub block: u64,
}

/// Resolves a deployment's manifest. Implemented by an IPFS-backed client in
/// production; a pure function over a fixture map in tests.
#[async_trait]
pub trait SubgraphManifestResolver: Send + Sync {
    async fn manifest(&self, deployment: DeploymentId) -> anyhow::Result<Manifest>;
}

/// One base in a target's graft lineage: the deployment to graft from, and
/// the block at which the target expects it to be synced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraftBase {
    pub deployment: DeploymentId,
    pub block: u64,
}

/// The graft lineage of a target deployment, ordered descending: index 0 is
/// the target's immediate graft base (deepest dependency to resolve first),
/// the last entry is the lineage's root (grafts from nothing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgraphLineage {
    pub target: DeploymentId,
    pub bases: Vec<GraftBase>,
}

/// Walks `target`'s manifest chain up to `max_iterations` times, stopping at
/// the first manifest that doesn't declare a further graft (the root).
pub async fn discover_lineage(
    resolver: &dyn SubgraphManifestResolver,
    target: DeploymentId,
    max_iterations: usize,
) -> Result<SubgraphLineage, indexer_errors::IndexerError> {
    let mut current = target;
    let mut bases = Vec::new();

    for _ in 0..max_iterations {
        let manifest = resolver
            .manifest(current)
            .await
            .map_err(|e| indexer_error(IndexerErrorCode::IE075).with_cause(e))?;

        match manifest.graft_base() {
            Some(graft) => {
                bases.push(GraftBase {
                    deployment: graft.base,
                    block: graft.block,
                });
                current = graft.base;
            }
            None => {
                return Ok(SubgraphLineage { target, bases });
            }
        }
    }

    Err(indexer_error(IndexerErrorCode::IE075).with_message(format!(
        "Failed to find the graft root for target subgraph deployment ({target}) after {max_iterations} iterations."
    )))
}

/// Indexing status as reported by graph-node for one graft base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexingStatus {
    pub latest_block: Option<u64>,
    pub health: Health,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Health(pub String);

impl Health {
    pub fn healthy() -> Self {
        Health("healthy".to_owned())
    }

    pub fn is_healthy(&self) -> bool {
        self.0 == "healthy"
    }
}

/// A graft base enriched with its current indexing status, or `None` if the
/// base has no assignment at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraftSubject {
    pub deployment: DeploymentId,
    pub block: u64,
    pub indexing_status: Option<IndexingStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    Deploy,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgraphDeploymentDecision {
    pub deployment: DeploymentId,
    pub kind: DecisionKind,
}

/// Scans bases root-toward-target and emits DEPLOY/REMOVE decisions. Stops
/// at (and emits) the first undeployed base, since nothing further toward
/// the target can sync until that gap is filled.
pub fn determine_subgraph_deployment_decisions(
    lineage_with_status: &[GraftSubject],
) -> Result<Vec<SubgraphDeploymentDecision>, indexer_errors::IndexerError> {
    if lineage_with_status.is_empty() {
        return Err(indexer_error(IndexerErrorCode::IE075).with_message("graft lineage has no bases"));
    }

    let mut decisions = Vec::new();

    for subject in lineage_with_status.iter().rev() {
        match &subject.indexing_status {
            None => {
                decisions.push(SubgraphDeploymentDecision {
                    deployment: subject.deployment,
                    kind: DecisionKind::Deploy,
                });
                break;
            }
            Some(status) => {
                let synced = status.latest_block.map_or(false, |latest| latest >= subject.block);
                if synced {
                    decisions.push(SubgraphDeploymentDecision {
                        deployment: subject.deployment,
                        kind: DecisionKind::Remove,
                    });
                    continue;
                }
                if !status.health.is_healthy() {
                    return Err(indexer_error(IndexerErrorCode::IE075).with_message(format!(
                        "Cannot deploy subgraph due to unhealthy graft base: {}",
                        subject.deployment
                    )));
                }
                // Still syncing and healthy: nothing to do, keep scanning.
            }
        }
    }

    Ok(decisions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashMap, str::FromStr, sync::Mutex};

    fn id(s: &str) -> DeploymentId {
        DeploymentId::from_str(s).unwrap()
    }

    struct FixtureResolver {
        manifests: HashMap<DeploymentId, Manifest>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl SubgraphManifestResolver for FixtureResolver {
        async fn manifest(&self, deployment: DeploymentId) -> anyhow::Result<Manifest> {
            *self.calls.lock().unwrap() += 1;
            self.manifests
                .get(&deployment)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no manifest for {deployment}"))
        }
    }

    fn grafted(base: &str, block: u64) -> Manifest {
        Manifest {
            features: vec!["grafting".to_owned()],
            graft: Some(GraftDirective { base: id(base), block }),
        }
    }

    fn rootless() -> Manifest {
        Manifest {
            features: vec![],
            graft: None,
        }
    }

    // QmTarget -> b1@30 -> b2@20 -> b3@10 -> (root)
    fn target_ids() -> (DeploymentId, DeploymentId, DeploymentId, DeploymentId) {
        (
            id("QmTXzATwNfgGVukV1fX2T6xw9f6LAYRVeVg4owRXZaU16Z"),
            id("QmZTXzATwNfgGVukV1fX2T6xw9f6LAYRVeVg4owRXZb1Aa"),
            id("QmYTXzATwNfgGVukV1fX2T6xw9f6LAYRVeVg4owRXZb2Bb"),
            id("QmWTXzATwNfgGVukV1fX2T6xw9f6LAYRVeVg4owRXZb3Cc"),
        )
    }

    fn chained_resolver() -> FixtureResolver {
        let (target, b1, b2, b3) = target_ids();
        let mut manifests = HashMap::new();
        manifests.insert(target, grafted(&b1.to_string(), 30));
        manifests.insert(b1, grafted(&b2.to_string(), 20));
        manifests.insert(b2, grafted(&b3.to_string(), 10));
        manifests.insert(b3, rootless());
        FixtureResolver {
            manifests,
            calls: Mutex::new(0),
        }
    }

    #[tokio::test]
    async fn resolves_full_lineage_root_last() {
        let (target, b1, b2, b3) = target_ids();
        let resolver = chained_resolver();

        let lineage = discover_lineage(&resolver, target, 100).await.unwrap();

        assert_eq!(
            lineage.bases,
            vec![
                GraftBase { deployment: b1, block: 30 },
                GraftBase { deployment: b2, block: 20 },
                GraftBase { deployment: b3, block: 10 },
            ]
        );
        assert_eq!(*resolver.calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn exhausting_iterations_raises_ie075() {
        let (target, ..) = target_ids();
        let resolver = chained_resolver();

        let err = discover_lineage(&resolver, target, 2).await.unwrap_err();

        assert_eq!(
            err.to_string().split(" (https").next().unwrap(),
            format!("IE075: Failed to find the graft root for target subgraph deployment ({target}) after 2 iterations.")
        );
    }

    #[tokio::test]
    async fn empty_bases_is_a_caller_error() {
        let err = determine_subgraph_deployment_decisions(&[]).unwrap_err();
        assert!(err.to_string().starts_with("IE075"));
    }

    #[tokio::test]
    async fn latest_undeployed_base_wins_over_healthier_earlier_bases() {
        let (_, b1, b2, b3) = target_ids();
        let lineage = vec![
            GraftSubject { deployment: b1, block: 30, indexing_status: None },
            GraftSubject { deployment: b2, block: 20, indexing_status: None },
            GraftSubject {
                deployment: b3,
                block: 10,
                indexing_status: Some(IndexingStatus { latest_block: Some(10), health: Health::healthy() }),
            },
        ];

        let decisions = determine_subgraph_deployment_decisions(&lineage).unwrap();

        assert_eq!(
            decisions,
            vec![
                SubgraphDeploymentDecision { deployment: b3, kind: DecisionKind::Remove },
                SubgraphDeploymentDecision { deployment: b2, kind: DecisionKind::Deploy },
            ]
        );
    }

    #[tokio::test]
    async fn unhealthy_base_raises_ie075() {
        let (_, b1, ..) = target_ids();
        let lineage = vec![GraftSubject {
            deployment: b1,
            block: 10,
            indexing_status: Some(IndexingStatus {
                latest_block: Some(5),
                health: Health("not-healthy".to_owned()),
            }),
        }];

        let err = determine_subgraph_deployment_decisions(&lineage).unwrap_err();
        assert!(err
            .to_string()
            .contains(&format!("Cannot deploy subgraph due to unhealthy graft base: {b1}")));
    }
}

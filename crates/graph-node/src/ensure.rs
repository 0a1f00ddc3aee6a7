// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::{sync::Arc, time::Duration};

use indexer_errors::{indexer_error, IndexerErrorCode};
use indexer_graft::{discover_lineage, SubgraphManifestResolver, DEFAULT_MAX_ITERATIONS};
use thegraph_core::DeploymentId;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::client::{AssignmentStatus, GraphNodeClient};

const SYNC_POLL_INTERVAL: Duration = Duration::from_secs(3);
const SYNC_STUCK_AFTER_ITERATIONS: u32 = 20;

/// The reconciliation-facing primitive on top of [`GraphNodeClient`]:
/// `ensure` a deployment is assigned and running, auto-grafting missing
/// bases along the way.
pub struct GraphNodeDriver {
    client: GraphNodeClient,
    manifests: Arc<dyn SubgraphManifestResolver>,
}

impl GraphNodeDriver {
    pub fn new(client: GraphNodeClient, manifests: Arc<dyn SubgraphManifestResolver>) -> Self {
        Self { client, manifests }
    }

    fn autograft_name(base: DeploymentId) -> String {
        let hash = base.ipfs_hash();
        let prefix: String = hash.chars().take(8).collect();
        format!("autograft-{prefix}")
    }

    /// `ensure(name, id)`: idempotently gets `id` assigned and running under
    /// `name`, auto-grafting its base chain first if needed.
    pub async fn ensure(&self, name: &str, id: DeploymentId, chain: &str) -> Result<(), indexer_errors::IndexerError> {
        let assignments = self.client.subgraph_deployment_assignments(AssignmentStatus::All, Some(&[id])).await?;
        if let Some(assignment) = assignments.into_iter().find(|a| a.id == id) {
            match assignment.paused {
                Some(false) => return Ok(()),
                _ if assignment.node.as_deref() == Some("removed") => {}
                Some(true) => return self.client.resume(id).await,
                None => return self.client.resume(id).await,
            }
        }

        self.autograft(id, chain).await?;

        self.client.create(name).await?;
        self.client.deploy(name, id).await
    }

    /// Walks the lineage root-outward, deploying and syncing any base that
    /// isn't already assigned.
    async fn autograft(&self, target: DeploymentId, chain: &str) -> Result<(), indexer_errors::IndexerError> {
        let lineage = discover_lineage(self.manifests.as_ref(), target, DEFAULT_MAX_ITERATIONS).await?;

        for base in lineage.bases.iter().rev() {
            let assignments = self
                .client
                .subgraph_deployment_assignments(AssignmentStatus::All, Some(&[base.deployment]))
                .await?;

            if assignments.iter().any(|a| a.id == base.deployment) {
                sync_to_block(&self.client, base.block, base.deployment, chain).await?;
                continue;
            }

            let name = Self::autograft_name(base.deployment);
            info!(%name, deployment = %base.deployment, "auto-grafting missing base");
            self.client.create(&name).await?;
            self.client.deploy(&name, base.deployment).await?;
            sync_to_block(&self.client, base.block, base.deployment, chain).await?;
        }

        Ok(())
    }
}

/// Polls `deployment`'s indexing status every 3s until its `chain` entry
/// reaches `target`, resuming it if paused and tripping a "stuck" error if
/// no progress is observed for 20 consecutive iterations.
pub async fn sync_to_block(
    client: &GraphNodeClient,
    target: u64,
    deployment: DeploymentId,
    chain: &str,
) -> Result<(), indexer_errors::IndexerError> {
    let mut last_progress_block: Option<u64> = None;
    let mut stalled_iterations = 0u32;

    loop {
        let mut assigned = false;
        for attempt in 0..5 {
            let assignments = client
                .subgraph_deployment_assignments(AssignmentStatus::All, Some(&[deployment]))
                .await?;
            if assignments.iter().any(|a| a.id == deployment) {
                assigned = true;
                break;
            }
            if attempt < 4 {
                sleep(SYNC_POLL_INTERVAL).await;
            }
        }
        if !assigned {
            return Err(indexer_error(IndexerErrorCode::IE018)
                .with_message(format!("deployment {deployment} never became assigned")));
        }

        let statuses = client.indexing_status(&[deployment]).await?;
        let status = statuses
            .into_iter()
            .next()
            .ok_or_else(|| indexer_error(IndexerErrorCode::IE018).with_message("no indexing status returned"))?;

        if status.fatal_error.is_some() || status.health == "failed" {
            return Err(indexer_error(IndexerErrorCode::IE018)
                .with_message(format!("deployment {deployment} failed while syncing to block {target}")));
        }

        let chain_status = status
            .chain(chain)
            .ok_or_else(|| indexer_error(IndexerErrorCode::IE018).with_message(format!("no chain entry for {chain}")))?;

        let latest = chain_status.latest_block.as_ref().map(|b| b.number);

        if latest.map_or(true, |n| n < target) {
            client.resume(deployment).await.ok();
        }

        match latest {
            Some(n) if Some(n) == last_progress_block => {
                stalled_iterations += 1;
                if stalled_iterations >= SYNC_STUCK_AFTER_ITERATIONS {
                    return Err(indexer_error(IndexerErrorCode::IE018)
                        .with_message(format!("deployment {deployment} stuck at block {n} syncing to {target}")));
                }
            }
            _ => {
                stalled_iterations = 0;
                last_progress_block = latest;
            }
        }

        if let Some(n) = latest {
            if n >= target {
                return Ok(());
            }
        }

        warn!(%deployment, target, latest = ?latest, "waiting for deployment to sync");
        sleep(SYNC_POLL_INTERVAL).await;
    }
}

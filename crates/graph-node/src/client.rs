// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use indexer_errors::{indexer_error, IndexerErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thegraph_core::DeploymentId;
use tokio::time::sleep;
use tracing::warn;

const ADMIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for graph-node's admin JSON-RPC surface and its indexing-status
/// GraphQL endpoint.
#[derive(Clone)]
pub struct GraphNodeClient {
    http: reqwest::Client,
    admin_endpoint: String,
    status_endpoint: String,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u32,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    message: String,
}

impl GraphNodeClient {
    pub fn new(http: reqwest::Client, admin_endpoint: impl Into<String>, status_endpoint: impl Into<String>) -> Self {
        Self {
            http,
            admin_endpoint: admin_endpoint.into(),
            status_endpoint: status_endpoint.into(),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, String> {
        let response = self
            .http
            .post(&self.admin_endpoint)
            .timeout(ADMIN_TIMEOUT)
            .json(&RpcRequest {
                jsonrpc: "2.0",
                id: 0,
                method,
                params,
            })
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let body: RpcResponse = response.json().await.map_err(|e| e.to_string())?;
        if let Some(error) = body.error {
            return Err(error.message);
        }
        Ok(body.result.unwrap_or(Value::Null))
    }

    /// Creates a deployment name. Idempotent: an "already exists" error is
    /// treated as success.
    pub async fn create(&self, name: &str) -> Result<(), indexer_errors::IndexerError> {
        match self.rpc("subgraph_create", json!({ "name": name })).await {
            Ok(_) => Ok(()),
            Err(message) if message.to_lowercase().contains("already exists") => Ok(()),
            Err(message) => Err(indexer_error(IndexerErrorCode::IE020).with_message(message)),
        }
    }

    /// Deploys `id` under `name`.
    pub async fn deploy(&self, name: &str, id: DeploymentId) -> Result<(), indexer_errors::IndexerError> {
        let params = json!({ "name": name, "ipfs_hash": id.to_string() });
        match self.rpc("subgraph_deploy", params).await {
            Ok(_) => Ok(()),
            Err(message) if message.to_lowercase().contains("network not supported") => {
                Err(indexer_error(IndexerErrorCode::IE074).with_message(message))
            }
            Err(message) => Err(indexer_error(IndexerErrorCode::IE026).with_message(message)),
        }
    }

    pub async fn pause(&self, id: DeploymentId) -> Result<(), indexer_errors::IndexerError> {
        match self.rpc("subgraph_pause", json!({ "deployment": id.to_string() })).await {
            Ok(_) => Ok(()),
            Err(message) if message.to_lowercase().contains("already paused") => Ok(()),
            Err(message) => Err(indexer_error(IndexerErrorCode::IE027).with_message(message)),
        }
    }

    pub async fn resume(&self, id: DeploymentId) -> Result<(), indexer_errors::IndexerError> {
        match self.rpc("subgraph_resume", json!({ "deployment": id.to_string() })).await {
            Ok(_) => Ok(()),
            Err(message) if message.to_lowercase().contains("already syncing") => Ok(()),
            Err(message) => Err(indexer_error(IndexerErrorCode::IE076).with_message(message)),
        }
    }

    /// Assigns `id` to `node`. "unchanged" is treated as success.
    pub async fn reassign(&self, id: DeploymentId, node: &str) -> Result<(), indexer_errors::IndexerError> {
        let params = json!({ "deployment": id.to_string(), "node_id": node });
        match self.rpc("subgraph_reassign", params).await {
            Ok(_) => Ok(()),
            Err(message) if message.to_lowercase().contains("unchanged") => Ok(()),
            Err(message) => Err(indexer_error(IndexerErrorCode::IE028).with_message(message)),
        }
    }

    async fn status_query<T: for<'de> Deserialize<'de>>(&self, query: &str, variables: Value) -> Result<T, String> {
        #[derive(Deserialize)]
        struct Response<T> {
            data: Option<T>,
            errors: Option<Vec<GqlError>>,
        }
        #[derive(Deserialize)]
        struct GqlError {
            message: String,
        }

        let response = self
            .http
            .post(&self.status_endpoint)
            .timeout(ADMIN_TIMEOUT)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let body: Response<T> = response.json().await.map_err(|e| e.to_string())?;
        if let Some(errors) = body.errors {
            if let Some(first) = errors.into_iter().next() {
                return Err(first.message);
            }
        }
        body.data.ok_or_else(|| "missing data in status response".to_owned())
    }

    /// Retries a fallible async operation up to 5 times, doubling the delay
    /// between attempts up to a 10s cap.
    async fn retry_capped<T, F, Fut>(mut f: F) -> Result<T, String>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, String>>,
    {
        let mut delay = Duration::from_millis(250);
        let mut last_err = String::new();
        for attempt in 0..5 {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    last_err = err;
                    if attempt < 4 {
                        warn!(attempt, error = %last_err, "graph-node query failed, retrying");
                        sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(10));
                    }
                }
            }
        }
        Err(last_err)
    }

    pub async fn indexing_status(&self, ids: &[DeploymentId]) -> Result<Vec<IndexingStatus>, indexer_errors::IndexerError> {
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "indexingStatuses")]
            indexing_statuses: Vec<IndexingStatus>,
        }

        Self::retry_capped(|| async {
            self.status_query::<Data>(
                r#"query($subgraphs: [String!]!) {
                    indexingStatuses(subgraphs: $subgraphs) {
                        subgraph
                        synced
                        health
                        fatalError { message }
                        node
                        chains { network latestBlock { number hash } chainHeadBlock { number hash } earliestBlock { number hash } }
                    }
                }"#,
                json!({ "subgraphs": ids }),
            )
            .await
        })
        .await
        .map(|data| data.indexing_statuses)
        .map_err(|message| indexer_error(IndexerErrorCode::IE018).with_message(message))
    }

    pub async fn proof_of_indexing(
        &self,
        id: DeploymentId,
        block: &BlockPointer,
        indexer: thegraph_core::Address,
    ) -> Result<Option<[u8; 32]>, indexer_errors::IndexerError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "proofOfIndexing")]
            proof_of_indexing: Option<String>,
        }

        let result = Self::retry_capped(|| async {
            self.status_query::<Data>(
                r#"query($subgraph: String!, $blockHash: String!, $blockNumber: String!, $indexer: String!) {
                    proofOfIndexing(subgraph: $subgraph, blockHash: $blockHash, blockNumber: $blockNumber, indexer: $indexer)
                }"#,
                json!({
                    "subgraph": id.to_string(),
                    "blockHash": block.hash,
                    "blockNumber": block.number.to_string(),
                    "indexer": indexer.to_string(),
                }),
            )
            .await
        })
        .await;

        match result {
            Ok(data) => match data.proof_of_indexing {
                Some(hex) => {
                    let bytes = hex::decode(hex.trim_start_matches("0x"))
                        .map_err(|e| indexer_error(IndexerErrorCode::IE019).with_cause(e))?;
                    let mut poi = [0u8; 32];
                    if bytes.len() == 32 {
                        poi.copy_from_slice(&bytes);
                        Ok(Some(poi))
                    } else {
                        Ok(None)
                    }
                }
                None => Ok(None),
            },
            Err(message) if message.to_lowercase().contains("deploymentnotfound") => Ok(None),
            Err(message) => Err(indexer_error(IndexerErrorCode::IE019).with_message(message)),
        }
    }

    pub async fn block_hash_from_number(&self, network: &str, number: u64) -> Result<String, indexer_errors::IndexerError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "blockHashFromNumber")]
            block_hash_from_number: String,
        }

        Self::retry_capped(|| async {
            self.status_query::<Data>(
                r#"query($network: String!, $blockNumber: Int!) {
                    blockHashFromNumber(network: $network, blockNumber: $blockNumber)
                }"#,
                json!({ "network": network, "blockNumber": number }),
            )
            .await
        })
        .await
        .map(|data| data.block_hash_from_number)
        .map_err(|message| indexer_error(IndexerErrorCode::IE070).with_message(message))
    }

    pub async fn subgraph_features(&self, id: DeploymentId) -> Result<Option<SubgraphFeatures>, indexer_errors::IndexerError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "subgraphFeatures")]
            subgraph_features: Option<SubgraphFeatures>,
        }

        self.status_query::<Data>(
            r#"query($subgraphId: String!) { subgraphFeatures(subgraphId: $subgraphId) { network } }"#,
            json!({ "subgraphId": id.to_string() }),
        )
        .await
        .map(|data| data.subgraph_features)
        .map_err(|message| indexer_error(IndexerErrorCode::IE073).with_message(message))
    }

    /// Two-phase query: fetches node assignment, then paused state, filtered
    /// by status. `Active = (paused=false) || (paused=null && node != "removed")`.
    pub async fn subgraph_deployment_assignments(
        &self,
        status: AssignmentStatus,
        ids: Option<&[DeploymentId]>,
    ) -> Result<Vec<DeploymentAssignment>, indexer_errors::IndexerError> {
        #[derive(Deserialize)]
        struct Assignment {
            id: String,
            node: Option<String>,
            paused: Option<bool>,
        }
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "indexingStatuses")]
            indexing_statuses: Vec<Assignment>,
        }

        let variables = match ids {
            Some(ids) => json!({ "subgraphs": ids.iter().map(|id| id.to_string()).collect::<Vec<_>>() }),
            None => json!({ "subgraphs": Value::Null }),
        };

        let data = self
            .status_query::<Data>(
                r#"query($subgraphs: [String!]) {
                    indexingStatuses(subgraphs: $subgraphs) { id: subgraph node paused }
                }"#,
                variables,
            )
            .await
            .map_err(|message| indexer_error(IndexerErrorCode::IE018).with_message(message))?;

        let assignments: Vec<DeploymentAssignment> = data
            .indexing_statuses
            .into_iter()
            .filter_map(|a| {
                let id = a.id.parse().ok()?;
                Some(DeploymentAssignment {
                    id,
                    node: a.node,
                    paused: a.paused,
                })
            })
            .filter(|a| match status {
                AssignmentStatus::All => true,
                AssignmentStatus::Paused => a.paused == Some(true),
                AssignmentStatus::Active => {
                    a.paused == Some(false) || (a.paused.is_none() && a.node.as_deref() != Some("removed"))
                }
            })
            .collect();

        Ok(assignments)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentStatus {
    Active,
    Paused,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentAssignment {
    pub id: DeploymentId,
    pub node: Option<String>,
    pub paused: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubgraphFeatures {
    pub network: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BlockPointer {
    pub number: u64,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainStatus {
    pub network: String,
    #[serde(rename = "latestBlock")]
    pub latest_block: Option<BlockPointer>,
    #[serde(rename = "chainHeadBlock")]
    pub chain_head_block: Option<BlockPointer>,
    #[serde(rename = "earliestBlock")]
    pub earliest_block: Option<BlockPointer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FatalError {
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexingStatus {
    pub subgraph: String,
    pub synced: bool,
    pub health: String,
    #[serde(rename = "fatalError")]
    pub fatal_error: Option<FatalError>,
    pub node: Option<String>,
    pub chains: Vec<ChainStatus>,
}

impl IndexingStatus {
    pub fn chain(&self, network: &str) -> Option<&ChainStatus> {
        self.chains.iter().find(|c| c.network == network)
    }
}

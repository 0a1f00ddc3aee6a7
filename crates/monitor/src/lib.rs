// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! The eligible-allocation monitor (C7): a periodic poll that produces a
//! watched, de-duplicated set of allocations the indexer currently owns on
//! chain. A failed poll leaves subscribers on the last-known-good set
//! rather than publishing an empty one.

use std::time::Duration;

use indexer_allocation::Allocation;
use indexer_errors::{indexer_error, IndexerErrorCode};
use indexer_query::SubgraphClient;
use indexer_watcher::new_watcher;
use thegraph_core::Address;
use tokio::sync::watch;
use tracing::warn;

const ALLOCATIONS_QUERY: &str = r#"
    query allocations($indexer: ID!, $closedAtEpochThreshold: Int!) {
        indexer(id: $indexer) {
            activeAllocations: totalAllocations(
                where: { status: Active }
                orderDirection: desc
                first: 1000
            ) {
                id
                indexer { id }
                allocatedTokens
                createdAtBlockHash
                createdAtEpoch
                closedAtEpoch
                subgraphDeployment { id deniedAt }
            }
            recentlyClosedAllocations: totalAllocations(
                where: { status: Closed, closedAtEpoch_gte: $closedAtEpochThreshold }
                orderDirection: desc
                first: 1000
            ) {
                id
                indexer { id }
                allocatedTokens
                createdAtBlockHash
                createdAtEpoch
                closedAtEpoch
                subgraphDeployment { id deniedAt }
            }
        }
    }
"#;

const EPOCH_QUERY: &str = r#"
    query epoch($id: ID!) {
        graphNetwork(id: $id) { currentEpoch }
    }
"#;

#[derive(serde::Deserialize)]
struct EpochResponse {
    #[serde(rename = "graphNetwork")]
    graph_network: GraphNetwork,
}

#[derive(serde::Deserialize)]
struct GraphNetwork {
    #[serde(rename = "currentEpoch")]
    current_epoch: u64,
}

#[derive(serde::Deserialize)]
struct AllocationsResponse {
    indexer: Option<IndexerAllocations>,
}

#[derive(serde::Deserialize)]
struct IndexerAllocations {
    #[serde(rename = "activeAllocations")]
    active_allocations: Vec<Allocation>,
    #[serde(rename = "recentlyClosedAllocations")]
    recently_closed_allocations: Vec<Allocation>,
}

async fn current_epoch(network_subgraph: &SubgraphClient, graph_network_id: u64) -> anyhow::Result<u64> {
    let response: EpochResponse = network_subgraph
        .query(EPOCH_QUERY, serde_json::json!({ "id": graph_network_id }))
        .await?;
    Ok(response.graph_network.current_epoch)
}

async fn current_eligible_allocations(
    network_subgraph: &SubgraphClient,
    indexer_address: Address,
    closed_at_epoch_threshold: u64,
) -> anyhow::Result<Vec<Allocation>> {
    let response: AllocationsResponse = network_subgraph
        .query(
            ALLOCATIONS_QUERY,
            serde_json::json!({
                "indexer": indexer_address,
                "closedAtEpochThreshold": closed_at_epoch_threshold,
            }),
        )
        .await?;

    let Some(indexer) = response.indexer else {
        anyhow::bail!("indexer {indexer_address} not found on the network subgraph");
    };

    let mut allocations = indexer.active_allocations;
    allocations.extend(indexer.recently_closed_allocations);
    Ok(allocations)
}

/// Spawns the C7 background poll and returns a watcher over its output.
/// Failures are logged as `IE010` and the previous value is kept.
pub async fn allocation_monitor(
    network_subgraph: SubgraphClient,
    indexer_address: Address,
    graph_network_id: u64,
    interval: Duration,
) -> anyhow::Result<watch::Receiver<Vec<Allocation>>> {
    new_watcher(interval, move || {
        let network_subgraph = network_subgraph.clone();
        async move {
            let epoch = current_epoch(&network_subgraph, graph_network_id).await.map_err(|e| {
                indexer_error(IndexerErrorCode::IE010);
                warn!(error = %e, "failed to query current epoch");
                e
            })?;

            current_eligible_allocations(&network_subgraph, indexer_address, epoch.saturating_sub(1))
                .await
                .map_err(|e| {
                    indexer_error(IndexerErrorCode::IE010);
                    warn!(error = %e, "failed to query indexer allocations");
                    e
                })
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use test_log::test;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test(tokio::test)]
    async fn queries_current_epoch() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "graphNetwork": { "currentEpoch": 896419 } }
            })))
            .mount(&mock_server)
            .await;

        let client = SubgraphClient::new(reqwest::Client::new(), mock_server.uri(), None);
        let epoch = current_epoch(&client, 1).await.unwrap();
        assert_eq!(epoch, 896419);
    }

    #[test(tokio::test)]
    async fn concatenates_active_and_recently_closed_allocations() {
        let mock_server = MockServer::start().await;
        let indexer_address = Address::from_str("0x0000000000000000000000000000000000000001").unwrap();
        let deployment = "QmUzRCY2m3BhDpTNLdDu4MZB1VY1ZHZKXUFBmhHvbdUTSg";

        let allocation_json = |id: &str, closed: bool| {
            serde_json::json!({
                "id": id,
                "indexer": { "id": indexer_address },
                "allocatedTokens": "1000",
                "createdAtBlockHash": "0xabc",
                "createdAtEpoch": 940,
                "closedAtEpoch": if closed { Some(945) } else { None },
                "subgraphDeployment": { "id": deployment, "deniedAt": null },
            })
        };

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "indexer": {
                        "activeAllocations": [allocation_json("0x1", false)],
                        "recentlyClosedAllocations": [allocation_json("0x2", true)],
                    }
                }
            })))
            .mount(&mock_server)
            .await;

        let client = SubgraphClient::new(reqwest::Client::new(), mock_server.uri(), None);
        let allocations = current_eligible_allocations(&client, indexer_address, 940).await.unwrap();
        assert_eq!(allocations.len(), 2);
        assert!(allocations[0].is_active());
        assert!(!allocations[1].is_active());
    }

    #[test(tokio::test)]
    async fn monitor_publishes_the_initial_poll() {
        let mock_server = MockServer::start().await;
        let indexer_address = Address::from_str("0x0000000000000000000000000000000000000001").unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "graphNetwork": { "currentEpoch": 10 },
                    "indexer": { "activeAllocations": [], "recentlyClosedAllocations": [] }
                }
            })))
            .mount(&mock_server)
            .await;

        let client = SubgraphClient::new(reqwest::Client::new(), mock_server.uri(), None);
        let rx = allocation_monitor(client, indexer_address, 1, Duration::from_secs(60))
            .await
            .unwrap();

        assert!(rx.borrow().is_empty());
    }
}

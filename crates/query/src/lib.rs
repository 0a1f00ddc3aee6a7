// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! A thin GraphQL client for the network, escrow, TAP, and epoch subgraphs,
//! plus the freshness check that bounds how stale a subgraph's view of
//! chain state is allowed to be before we trust it.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use indexer_errors::{indexer_error, IndexerErrorCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::sleep;
use tracing::warn;

/// A minimal GraphQL-over-HTTP client. Real deployments point this at a
/// graph-node's `/subgraphs/id/<hash>` endpoint.
#[derive(Clone)]
pub struct SubgraphClient {
    http: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: Value,
}

#[derive(Debug, serde::Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, serde::Deserialize)]
struct GraphQlError {
    message: String,
}

impl SubgraphClient {
    pub fn new(http: reqwest::Client, url: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            http,
            url: url.into(),
            bearer_token,
        }
    }

    pub async fn query<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<T, indexer_errors::IndexerError> {
        let mut request = self.http.post(&self.url).json(&GraphQlRequest { query, variables });
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| indexer_error(IndexerErrorCode::IE024).with_cause(e))?;

        let body: GraphQlResponse<T> = response
            .json()
            .await
            .map_err(|e| indexer_error(IndexerErrorCode::IE024).with_cause(e))?;

        if let Some(err) = body.errors.into_iter().next() {
            return Err(indexer_error(IndexerErrorCode::IE024).with_message(err.message));
        }

        body.data
            .ok_or_else(|| indexer_error(IndexerErrorCode::IE024).with_message("subgraph response had no data"))
    }
}

/// Interface to an EVM chain's current head, as seen by the node the
/// transaction manager also submits transactions through. Kept abstract so
/// this crate has no hard dependency on a particular RPC client.
#[async_trait]
pub trait ChainHeadProvider: Send + Sync {
    async fn latest_block_number(&self) -> anyhow::Result<u64>;
}

/// Bounds how stale a subgraph's view of chain state may be before we trust
/// its response, per §4.1.
pub struct FreshnessChecker {
    client: SubgraphClient,
    chain_head: Arc<dyn ChainHeadProvider>,
    threshold_blocks: u64,
    max_retries: u32,
    retry_interval: Duration,
}

impl FreshnessChecker {
    pub fn new(
        client: SubgraphClient,
        chain_head: Arc<dyn ChainHeadProvider>,
        threshold_blocks: u64,
        max_retries: u32,
        retry_interval: Duration,
    ) -> Self {
        Self {
            client,
            chain_head,
            threshold_blocks,
            max_retries,
            retry_interval,
        }
    }

    /// Merges `_meta { block { number } }` into the tail of `query` so the
    /// response carries the subgraph's indexed block alongside the
    /// caller's requested data.
    fn merge_meta_query(query: &str) -> String {
        let trimmed = query.trim_end();
        let last_brace = trimmed
            .rfind('}')
            .expect("query must be a well-formed GraphQL document with at least one `}`");
        format!(
            "{}\n  _meta {{ block {{ number }} }}\n{}",
            &trimmed[..last_brace],
            &trimmed[last_brace..]
        )
    }

    /// Runs `query`, retrying until the subgraph's indexed block is within
    /// `threshold_blocks` of the chain head, or `max_retries` is exhausted.
    pub async fn checked_query<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<T, indexer_errors::IndexerError> {
        let merged = Self::merge_meta_query(query);

        #[derive(serde::Deserialize)]
        struct Meta {
            block: MetaBlock,
        }
        #[derive(serde::Deserialize)]
        struct MetaBlock {
            number: u64,
        }
        #[derive(serde::Deserialize)]
        struct WithMeta<T> {
            #[serde(rename = "_meta")]
            meta: Option<Meta>,
            #[serde(flatten)]
            rest: T,
        }

        let mut attempts = 0u32;
        loop {
            let (query_result, head_result) = tokio::join!(
                self.client.query::<WithMeta<T>>(&merged, variables.clone()),
                self.chain_head.latest_block_number()
            );

            let response = query_result?;
            let latest_network_block = head_result.map_err(|e| indexer_error(IndexerErrorCode::IE024).with_cause(e))?;

            let Some(meta) = response.meta else {
                return Err(indexer_error(IndexerErrorCode::IE024)
                    .with_message("query response is missing _meta.block.number"));
            };
            let latest_indexed_block = meta.block.number;

            if latest_indexed_block > latest_network_block {
                warn!(
                    latest_indexed_block,
                    latest_network_block, "subgraph reports an indexed block ahead of the network head"
                );
            }

            let lag = latest_network_block.saturating_sub(latest_indexed_block);
            if lag <= self.threshold_blocks {
                return Ok(response.rest);
            }

            attempts += 1;
            if attempts > self.max_retries {
                return Err(indexer_error(IndexerErrorCode::IE025).with_message(format!(
                    "subgraph lagged {lag} blocks behind network head after {} retries",
                    self.max_retries
                )));
            }
            sleep(self.retry_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_meta_into_query_tail() {
        let query = "query Foo($x: Int) { things(first: $x) { id } }";
        let merged = FreshnessChecker::merge_meta_query(query);
        assert!(merged.contains("_meta { block { number } }"));
        assert!(merged.trim_end().ends_with('}'));
    }

    struct FixedHead(u64);

    #[async_trait]
    impl ChainHeadProvider for FixedHead {
        async fn latest_block_number(&self) -> anyhow::Result<u64> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn exhausting_retries_raises_ie025() {
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "_meta": { "block": { "number": 1 } }, "things": [] }
            })))
            .mount(&mock_server)
            .await;

        let client = SubgraphClient::new(reqwest::Client::new(), mock_server.uri(), None);
        let checker = FreshnessChecker::new(
            client,
            Arc::new(FixedHead(1_000)),
            5,
            2,
            Duration::from_millis(1),
        );

        #[derive(serde::Deserialize)]
        struct Data {
            things: Vec<Value>,
        }

        let result = checker
            .checked_query::<Data>("query { things { id } }", serde_json::json!({}))
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().starts_with("IE025"));
    }
}

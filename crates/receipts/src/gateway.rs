// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! HTTP client for the gateway's receipt-collection endpoints.

use indexer_errors::{indexer_error, IndexerErrorCode};
use thegraph_core::Address;

use crate::encoding::encode_receipts_buffer;
use crate::types::{AllocationReceipt, PartialVoucher, Voucher};

/// The largest receipt batch the gateway will convert in one request.
pub const MAX_RECEIPTS_PER_REQUEST: usize = 25_000;

#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(serde::Deserialize)]
struct VoucherResponse {
    allocation: Option<Address>,
    fees: Option<String>,
    amount: Option<String>,
    signature: Option<String>,
}

#[derive(serde::Deserialize)]
struct PartialVoucherResponse {
    allocation: Option<Address>,
    fees: Option<String>,
    signature: Option<String>,
    #[serde(rename = "receiptIdMin")]
    receipt_id_min: Option<String>,
    #[serde(rename = "receiptIdMax")]
    receipt_id_max: Option<String>,
}

impl GatewayClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn parse_voucher(body: VoucherResponse, protocol_network: &str) -> Result<Voucher, indexer_errors::IndexerError> {
        let fees = body.fees.or(body.amount);
        match (body.allocation, fees, body.signature) {
            (Some(allocation), Some(amount), Some(signature)) => Ok(Voucher {
                allocation,
                protocol_network: protocol_network.to_string(),
                amount,
                signature,
            }),
            _ => Err(indexer_error(IndexerErrorCode::IE054).with_message("failed to parse response")),
        }
    }

    /// `POST /collect-receipts` for a batch within the gateway's capacity.
    pub async fn collect_receipts(
        &self,
        allocation: Address,
        protocol_network: &str,
        receipts: &[AllocationReceipt],
    ) -> Result<Voucher, indexer_errors::IndexerError> {
        let buffer = encode_receipts_buffer(allocation, receipts);
        let response = self
            .http
            .post(self.endpoint("collect-receipts"))
            .header("content-type", "application/octet-stream")
            .body(buffer)
            .send()
            .await
            .map_err(|e| indexer_error(IndexerErrorCode::IE054).with_cause(e))?;

        let body: VoucherResponse = response
            .json()
            .await
            .map_err(|e| indexer_error(IndexerErrorCode::IE054).with_cause(e))?;

        Self::parse_voucher(body, protocol_network)
    }

    /// `POST /partial-voucher` for one shard of an oversized batch.
    pub async fn partial_voucher(
        &self,
        allocation: Address,
        receipts: &[AllocationReceipt],
    ) -> Result<PartialVoucher, indexer_errors::IndexerError> {
        let buffer = encode_receipts_buffer(allocation, receipts);
        let response = self
            .http
            .post(self.endpoint("partial-voucher"))
            .header("content-type", "application/octet-stream")
            .body(buffer)
            .send()
            .await
            .map_err(|e| indexer_error(IndexerErrorCode::IE054).with_cause(e))?;

        let body: PartialVoucherResponse = response
            .json()
            .await
            .map_err(|e| indexer_error(IndexerErrorCode::IE054).with_cause(e))?;

        match (body.allocation, body.fees, body.signature, body.receipt_id_min, body.receipt_id_max) {
            (Some(allocation), Some(fees), Some(signature), Some(receipt_id_min), Some(receipt_id_max)) => Ok(PartialVoucher {
                allocation,
                fees,
                signature,
                receipt_id_min,
                receipt_id_max,
            }),
            _ => Err(indexer_error(IndexerErrorCode::IE054).with_message("failed to parse response")),
        }
    }

    /// `POST /voucher` with the JSON-encoded partial vouchers for one
    /// allocation, exchanging them for the final voucher.
    pub async fn voucher(
        &self,
        allocation: Address,
        protocol_network: &str,
        partial_vouchers: &[PartialVoucher],
    ) -> Result<Voucher, indexer_errors::IndexerError> {
        #[derive(serde::Serialize)]
        struct WirePartialVoucher {
            fees: String,
            signature: String,
        }

        let response = self
            .http
            .post(self.endpoint("voucher"))
            .json(&serde_json::json!({
                "allocation": allocation,
                "partialVouchers": partial_vouchers.iter().map(|v| WirePartialVoucher {
                    fees: v.fees.clone(),
                    signature: v.signature.clone(),
                }).collect::<Vec<_>>(),
            }))
            .send()
            .await
            .map_err(|e| indexer_error(IndexerErrorCode::IE054).with_cause(e))?;

        let body: VoucherResponse = response
            .json()
            .await
            .map_err(|e| indexer_error(IndexerErrorCode::IE054).with_cause(e))?;

        Self::parse_voucher(body, protocol_network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thegraph_core::alloy::primitives::address;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn reconciles_amount_field_to_fees() {
        let mock_server = MockServer::start().await;
        let allocation = address!("0000000000000000000000000000000000000001");

        Mock::given(method("POST"))
            .and(path("/collect-receipts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "allocation": allocation,
                "amount": "100",
                "signature": "0xdeadbeef"
            })))
            .mount(&mock_server)
            .await;

        let client = GatewayClient::new(reqwest::Client::new(), mock_server.uri());
        let voucher = client.collect_receipts(allocation, "eip155:1", &[]).await.unwrap();
        assert_eq!(voucher.amount, "100");
    }

    #[tokio::test]
    async fn missing_signature_is_a_parse_failure() {
        let mock_server = MockServer::start().await;
        let allocation = address!("0000000000000000000000000000000000000001");

        Mock::given(method("POST"))
            .and(path("/collect-receipts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "allocation": allocation,
                "amount": "100"
            })))
            .mount(&mock_server)
            .await;

        let client = GatewayClient::new(reqwest::Client::new(), mock_server.uri());
        let result = client.collect_receipts(allocation, "eip155:1", &[]).await;
        assert!(result.is_err());
    }
}

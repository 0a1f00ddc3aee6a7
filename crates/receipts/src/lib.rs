// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! The receipt-to-voucher collection pipeline (C8): a delay-priority queue
//! that converts per-allocation query receipts into gateway-signed
//! vouchers, and batches vouchers for on-chain redemption.

pub mod db;
pub mod encoding;
pub mod gateway;
pub mod heap;
pub mod redemption;
pub mod types;

use std::sync::Mutex;
use std::time::Duration;

use sqlx::PgPool;
use thegraph_core::Address;
use tokio::time::sleep;
use tracing::{info, warn};

use indexer_errors::{indexer_error, IndexerErrorCode};

use gateway::{GatewayClient, MAX_RECEIPTS_PER_REQUEST};
use heap::ReceiptHeap;
use redemption::{redemption_tick, RedemptionConfig, VoucherExchange};
use types::{AllocationReceiptsBatch, Voucher};

const COLLECT_TICK_INTERVAL: Duration = Duration::from_secs(10);
const REDEMPTION_TICK_INTERVAL: Duration = Duration::from_secs(30);

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Owns the delay heap and the gateway/database clients for one protocol
/// network's receipt/voucher pipeline.
pub struct ReceiptPipeline {
    pool: PgPool,
    gateway: GatewayClient,
    protocol_network: String,
    heap: Mutex<ReceiptHeap>,
}

impl ReceiptPipeline {
    /// Restores any batches left over from a previous run (receipts whose
    /// allocation was already closed before the process last stopped).
    pub async fn new(pool: PgPool, gateway: GatewayClient, protocol_network: impl Into<String>) -> Result<Self, indexer_errors::IndexerError> {
        let protocol_network = protocol_network.into();
        let pipeline = Self {
            pool,
            gateway,
            protocol_network,
            heap: Mutex::new(ReceiptHeap::new()),
        };
        pipeline.queue_pending_receipts_from_database().await?;
        Ok(pipeline)
    }

    async fn queue_pending_receipts_from_database(&self) -> Result<(), indexer_errors::IndexerError> {
        let batches = db::queue_pending_receipts_from_database(&self.pool).await?;
        let mut heap = self.heap.lock().expect("receipt heap lock poisoned");
        for batch in batches {
            if batch.protocol_network == self.protocol_network {
                heap.push(batch);
            }
        }
        Ok(())
    }

    /// Upserts an `allocation_summaries` row for each id in one transaction.
    pub async fn remember_allocations(&self, allocations: &[Address]) -> Result<(), indexer_errors::IndexerError> {
        db::remember_allocations(&self.pool, allocations, &self.protocol_network).await
    }

    /// Closes `allocation` and queues its receipts behind the gateway's
    /// grace period. Returns `false` if there was nothing to collect.
    pub async fn collect_receipts(&self, allocation: Address) -> Result<bool, indexer_errors::IndexerError> {
        let Some(batch) = db::collect_receipts(&self.pool, allocation, &self.protocol_network).await? else {
            return Ok(false);
        };
        self.heap.lock().expect("receipt heap lock poisoned").push(batch);
        Ok(true)
    }

    /// Pops every batch whose grace period has elapsed and exchanges it
    /// for a voucher. Run this every [`COLLECT_TICK_INTERVAL`].
    pub async fn collect_tick(&self) {
        let due = {
            let mut heap = self.heap.lock().expect("receipt heap lock poisoned");
            heap.pop_due(now_ms())
        };

        for batch in due {
            assert!(
                !batch.receipts.is_empty(),
                "programmer error: popped an empty receipt batch for {}",
                batch.allocation
            );
            if let Err(e) = self.obtain_receipts_voucher(&batch).await {
                warn!(error = %e, allocation = %batch.allocation, "failed to collect receipts and exchange them for a voucher, batch stays on disk for next restart");
            }
        }
    }

    /// Exchanges one batch's receipts for a voucher per §4.6, splitting
    /// into `partial-voucher` shards when the batch exceeds the gateway's
    /// single-shot capacity.
    async fn obtain_receipts_voucher(&self, batch: &AllocationReceiptsBatch) -> Result<(), indexer_errors::IndexerError> {
        let voucher = if batch.receipts.len() <= MAX_RECEIPTS_PER_REQUEST {
            self.gateway.collect_receipts(batch.allocation, &self.protocol_network, &batch.receipts).await?
        } else {
            let mut partials = Vec::new();
            for chunk in batch.receipts.chunks(MAX_RECEIPTS_PER_REQUEST) {
                partials.push(self.gateway.partial_voucher(batch.allocation, chunk).await?);
            }
            encoding::group_partial_vouchers(&partials)
                .map_err(|msg| indexer_error(IndexerErrorCode::IE054).with_message(msg))?;
            self.gateway.voucher(batch.allocation, &self.protocol_network, &partials).await?
        };

        let receipt_ids: Vec<i64> = batch.receipts.iter().map(|r| r.id).collect();
        db::finalize_voucher(&self.pool, &receipt_ids, &voucher).await?;

        info!(allocation = %batch.allocation, amount = %voucher.amount, "collected receipts and recorded voucher");
        Ok(())
    }

    /// Runs one voucher redemption tick. Run this every
    /// [`REDEMPTION_TICK_INTERVAL`].
    pub async fn redemption_tick(&self, exchange: &dyn VoucherExchange, config: &RedemptionConfig) -> Result<(), indexer_errors::IndexerError> {
        redemption_tick(&self.pool, exchange, config).await
    }

    /// Spawns the 10s collection sweeper and the 30s redemption ticker as
    /// independent background loops.
    pub fn spawn_tickers(self: std::sync::Arc<Self>, exchange: std::sync::Arc<dyn VoucherExchange>, redemption_config: RedemptionConfig) {
        let collector = self.clone();
        tokio::spawn(async move {
            loop {
                collector.collect_tick().await;
                sleep(COLLECT_TICK_INTERVAL).await;
            }
        });

        let redeemer = self;
        tokio::spawn(async move {
            loop {
                if let Err(e) = redeemer.redemption_tick(exchange.as_ref(), &redemption_config).await {
                    warn!(error = %e, "voucher redemption tick failed");
                }
                sleep(REDEMPTION_TICK_INTERVAL).await;
            }
        });
    }
}

pub use types::{AllocationReceipt, AllocationReceiptsBatch as ReceiptBatch, PartialVoucher, Voucher as VoucherRecord};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use thegraph_core::alloy::primitives::address;

    struct FakeExchange {
        redeemed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl VoucherExchange for FakeExchange {
        async fn allocation_redeemed(&self, _allocation: Address) -> anyhow::Result<bool> {
            Ok(false)
        }
        async fn redeem_many(&self, _vouchers: &[Voucher]) -> anyhow::Result<()> {
            self.redeemed.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn voucher_record_alias_matches_gateway_type() {
        let v: VoucherRecord = Voucher {
            allocation: address!("0000000000000000000000000000000000000001"),
            protocol_network: "eip155:1".into(),
            amount: "1".into(),
            signature: "0x00".into(),
        };
        assert_eq!(v.amount, "1");
    }

    #[tokio::test]
    async fn fake_exchange_marks_redeemed_on_call() {
        let exchange = FakeExchange {
            redeemed: std::sync::atomic::AtomicBool::new(false),
        };
        exchange.redeem_many(&[]).await.unwrap();
        assert!(exchange.redeemed.load(std::sync::atomic::Ordering::SeqCst));
    }
}

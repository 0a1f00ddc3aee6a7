// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! The 30s voucher redemption ticker: batches pending vouchers above a
//! threshold and submits them to the allocation exchange contract through
//! the transaction manager.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use sqlx::PgPool;
use thegraph_core::Address;
use tracing::{info, warn};

use indexer_errors::indexer_error;

use crate::db;
use crate::types::Voucher;

/// The on-chain side of voucher redemption. Implementations wrap the
/// transaction manager (C6) and the allocation exchange contract.
#[async_trait]
pub trait VoucherExchange: Send + Sync {
    /// True if the exchange contract already marked `allocation` redeemed.
    async fn allocation_redeemed(&self, allocation: Address) -> anyhow::Result<bool>;
    /// Submits `allocationExchange.redeemMany(vouchers)`.
    async fn redeem_many(&self, vouchers: &[Voucher]) -> anyhow::Result<()>;
}

pub struct RedemptionConfig {
    pub max_batch_size: i64,
    pub redemption_threshold: BigDecimal,
    pub batch_threshold: BigDecimal,
}

/// Runs one redemption tick per §4.6's "Voucher redemption" algorithm.
pub async fn redemption_tick(
    pool: &PgPool,
    exchange: &dyn VoucherExchange,
    config: &RedemptionConfig,
) -> Result<(), indexer_errors::IndexerError> {
    let pending = db::fetch_pending_vouchers(pool, config.max_batch_size).await?;

    let mut eligible = Vec::new();
    for voucher in pending {
        match exchange.allocation_redeemed(voucher.allocation).await {
            Ok(true) => {
                if let Err(e) = db::delete_voucher(pool, voucher.allocation, &voucher.protocol_network).await {
                    warn!(error = %e, allocation = %voucher.allocation, "failed to delete already-redeemed voucher, retrying next tick");
                }
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, allocation = %voucher.allocation, "failed to check allocationsRedeemed");
                continue;
            }
        }

        let amount: BigDecimal = match voucher.amount.parse() {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, allocation = %voucher.allocation, "voucher has an unparseable amount");
                continue;
            }
        };

        if amount < config.redemption_threshold {
            info!(allocation = %voucher.allocation, amount = %voucher.amount, "voucher below threshold");
        } else {
            eligible.push(voucher);
        }
    }

    let batch: Vec<Voucher> = eligible.into_iter().take(config.max_batch_size as usize).collect();
    if batch.is_empty() {
        return Ok(());
    }

    let total: BigDecimal = batch
        .iter()
        .filter_map(|v| v.amount.parse::<BigDecimal>().ok())
        .fold(BigDecimal::from(0), |acc, v| acc + v);

    if total < config.batch_threshold {
        info!(total = %total, "batch value too low, waiting for more vouchers");
        return Ok(());
    }

    match exchange.redeem_many(&batch).await {
        Ok(()) => {
            db::settle_redeemed_vouchers(pool, &batch).await?;
            Ok(())
        }
        Err(e) => {
            let err = indexer_error(indexer_errors::IndexerErrorCode::IE055).with_cause(e);
            warn!(error = %err, "failed to redeem voucher batch on chain");
            Err(err)
        }
    }
}

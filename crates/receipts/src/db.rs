// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Durable state for the receipt/voucher pipeline: `allocation_receipts`,
//! `allocation_summaries`, and `vouchers`.
//!
//! Queries are built with the runtime-checked `sqlx::query`/`query_as`
//! builders rather than the `query!` macros, so this crate compiles without
//! a live database or a checked-in offline query cache.

use bigdecimal::BigDecimal;
use sqlx::{PgPool, Row};
use thegraph_core::Address;
use tracing::warn;

use indexer_errors::{indexer_error, IndexerErrorCode};

use crate::types::{AllocationReceipt, AllocationReceiptsBatch, Voucher};

const RECEIPT_COLLECT_DELAY_MS: i64 = 1_200_000;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Upserts an `allocation_summaries` row for each id, in one transaction.
pub async fn remember_allocations(
    pool: &PgPool,
    allocations: &[Address],
    protocol_network: &str,
) -> Result<(), indexer_errors::IndexerError> {
    let mut tx = pool.begin().await.map_err(|e| indexer_error(IndexerErrorCode::IE056).with_cause(e))?;

    for allocation in allocations {
        sqlx::query(
            "INSERT INTO allocation_summaries (allocation, protocol_network, collected_fees, withdrawn_fees) \
             VALUES ($1, $2, 0, 0) \
             ON CONFLICT (allocation, protocol_network) DO NOTHING",
        )
        .bind(allocation.to_string())
        .bind(protocol_network)
        .execute(&mut *tx)
        .await
        .map_err(|e| indexer_error(IndexerErrorCode::IE056).with_cause(e))?;
    }

    tx.commit().await.map_err(|e| indexer_error(IndexerErrorCode::IE056).with_cause(e))?;
    Ok(())
}

/// Marks `allocation` closed and gathers its receipts into a batch, in one
/// transaction. Returns `Ok(None)` if there were no receipts to collect.
pub async fn collect_receipts(
    pool: &PgPool,
    allocation: Address,
    protocol_network: &str,
) -> Result<Option<AllocationReceiptsBatch>, indexer_errors::IndexerError> {
    let mut tx = pool.begin().await.map_err(|e| indexer_error(IndexerErrorCode::IE053).with_cause(e))?;

    sqlx::query(
        "UPDATE allocation_summaries SET closed_at = $1 WHERE allocation = $2 AND protocol_network = $3",
    )
    .bind(now_ms())
    .bind(allocation.to_string())
    .bind(protocol_network)
    .execute(&mut *tx)
    .await
    .map_err(|e| indexer_error(IndexerErrorCode::IE053).with_cause(e))?;

    let rows = sqlx::query(
        "SELECT id, fees, signature FROM allocation_receipts \
         WHERE allocation = $1 AND protocol_network = $2 ORDER BY id",
    )
    .bind(allocation.to_string())
    .bind(protocol_network)
    .fetch_all(&mut *tx)
    .await
    .map_err(|e| indexer_error(IndexerErrorCode::IE053).with_cause(e))?;

    tx.commit().await.map_err(|e| indexer_error(IndexerErrorCode::IE053).with_cause(e))?;

    if rows.is_empty() {
        return Ok(None);
    }

    let receipts = rows
        .into_iter()
        .map(|row| row_to_receipt(row, allocation, protocol_network))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(AllocationReceiptsBatch {
        allocation,
        protocol_network: protocol_network.to_string(),
        receipts,
        timeout: now_ms() + RECEIPT_COLLECT_DELAY_MS,
    }))
}

fn row_to_receipt(
    row: sqlx::postgres::PgRow,
    allocation: Address,
    protocol_network: &str,
) -> Result<AllocationReceipt, indexer_errors::IndexerError> {
    let id: i64 = row.try_get("id").map_err(|e| indexer_error(IndexerErrorCode::IE053).with_cause(e))?;
    let fees: BigDecimal = row.try_get("fees").map_err(|e| indexer_error(IndexerErrorCode::IE053).with_cause(e))?;
    let signature: String = row.try_get("signature").map_err(|e| indexer_error(IndexerErrorCode::IE053).with_cause(e))?;

    let fees = thegraph_core::alloy::primitives::U256::from_str_radix(&fees.to_string(), 10)
        .map_err(|e| indexer_error(IndexerErrorCode::IE053).with_message(format!("invalid fees value: {e}")))?;

    let sig_bytes = hex::decode(signature.trim_start_matches("0x"))
        .map_err(|e| indexer_error(IndexerErrorCode::IE053).with_message(format!("invalid signature hex: {e}")))?;
    let mut signature = [0u8; 65];
    if sig_bytes.len() != 65 {
        return Err(indexer_error(IndexerErrorCode::IE053).with_message("signature is not 65 bytes"));
    }
    signature.copy_from_slice(&sig_bytes);

    Ok(AllocationReceipt {
        id,
        allocation,
        fees,
        signature,
        protocol_network: protocol_network.to_string(),
    })
}

/// Deletes the collected receipts, adds `voucher.amount` to the summary's
/// `collected_fees`, and upserts the voucher row, all in one transaction.
pub async fn finalize_voucher(
    pool: &PgPool,
    receipt_ids: &[i64],
    voucher: &Voucher,
) -> Result<(), indexer_errors::IndexerError> {
    let mut tx = pool.begin().await.map_err(|e| indexer_error(IndexerErrorCode::IE054).with_cause(e))?;

    sqlx::query("DELETE FROM allocation_receipts WHERE id = ANY($1)")
        .bind(receipt_ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| indexer_error(IndexerErrorCode::IE054).with_cause(e))?;

    let amount: BigDecimal = voucher
        .amount
        .parse()
        .map_err(|e| indexer_error(IndexerErrorCode::IE054).with_message(format!("invalid voucher amount: {e}")))?;

    sqlx::query(
        "UPDATE allocation_summaries SET collected_fees = collected_fees + $1 \
         WHERE allocation = $2 AND protocol_network = $3",
    )
    .bind(&amount)
    .bind(voucher.allocation.to_string())
    .bind(&voucher.protocol_network)
    .execute(&mut *tx)
    .await
    .map_err(|e| indexer_error(IndexerErrorCode::IE054).with_cause(e))?;

    sqlx::query(
        "INSERT INTO vouchers (allocation, protocol_network, amount, signature) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (allocation, protocol_network) DO UPDATE SET amount = EXCLUDED.amount, signature = EXCLUDED.signature",
    )
    .bind(voucher.allocation.to_string())
    .bind(&voucher.protocol_network)
    .bind(&voucher.amount)
    .bind(&voucher.signature)
    .execute(&mut *tx)
    .await
    .map_err(|e| indexer_error(IndexerErrorCode::IE054).with_cause(e))?;

    tx.commit().await.map_err(|e| indexer_error(IndexerErrorCode::IE054).with_cause(e))?;
    Ok(())
}

/// Rebuilds the in-memory heap from durable state after a restart: one
/// batch per allocation with a non-null `closed_at`.
pub async fn queue_pending_receipts_from_database(
    pool: &PgPool,
) -> Result<Vec<AllocationReceiptsBatch>, indexer_errors::IndexerError> {
    let rows = sqlx::query(
        "SELECT allocation, protocol_network, closed_at FROM allocation_summaries WHERE closed_at IS NOT NULL",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| indexer_error(IndexerErrorCode::IE053).with_cause(e))?;

    let mut batches = Vec::new();
    for row in rows {
        let allocation_str: String = row.try_get("allocation").map_err(|e| indexer_error(IndexerErrorCode::IE053).with_cause(e))?;
        let protocol_network: String =
            row.try_get("protocol_network").map_err(|e| indexer_error(IndexerErrorCode::IE053).with_cause(e))?;
        let closed_at: i64 = row.try_get("closed_at").map_err(|e| indexer_error(IndexerErrorCode::IE053).with_cause(e))?;

        let allocation: Address = allocation_str
            .parse()
            .map_err(|e| indexer_error(IndexerErrorCode::IE053).with_message(format!("invalid allocation address: {e}")))?;

        let receipt_rows = sqlx::query(
            "SELECT id, fees, signature FROM allocation_receipts \
             WHERE allocation = $1 AND protocol_network = $2 ORDER BY id",
        )
        .bind(&allocation_str)
        .bind(&protocol_network)
        .fetch_all(pool)
        .await
        .map_err(|e| indexer_error(IndexerErrorCode::IE053).with_cause(e))?;

        if receipt_rows.is_empty() {
            continue;
        }

        let receipts = receipt_rows
            .into_iter()
            .map(|row| row_to_receipt(row, allocation, &protocol_network))
            .collect::<Result<Vec<_>, _>>()?;

        batches.push(AllocationReceiptsBatch {
            allocation,
            protocol_network,
            receipts,
            timeout: closed_at + RECEIPT_COLLECT_DELAY_MS,
        });
    }

    Ok(batches)
}

/// Up to `max_batch_size` pending vouchers ordered by `amount` descending.
pub async fn fetch_pending_vouchers(pool: &PgPool, max_batch_size: i64) -> Result<Vec<Voucher>, indexer_errors::IndexerError> {
    let rows = sqlx::query(
        "SELECT allocation, protocol_network, amount, signature FROM vouchers \
         ORDER BY amount DESC LIMIT $1",
    )
    .bind(max_batch_size)
    .fetch_all(pool)
    .await
    .map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))?;

    rows.into_iter()
        .map(|row| {
            let allocation_str: String = row.try_get("allocation").map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))?;
            let allocation = allocation_str
                .parse()
                .map_err(|e| indexer_error(IndexerErrorCode::IE055).with_message(format!("invalid allocation address: {e}")))?;
            Ok(Voucher {
                allocation,
                protocol_network: row.try_get("protocol_network").map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))?,
                amount: row.try_get("amount").map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))?,
                signature: row.try_get("signature").map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))?,
            })
        })
        .collect()
}

/// Deletes a voucher row, e.g. after the chain confirms it's already
/// redeemed or after a successful batch redemption.
pub async fn delete_voucher(pool: &PgPool, allocation: Address, protocol_network: &str) -> Result<(), indexer_errors::IndexerError> {
    sqlx::query("DELETE FROM vouchers WHERE allocation = $1 AND protocol_network = $2")
        .bind(allocation.to_string())
        .bind(protocol_network)
        .execute(pool)
        .await
        .map_err(|e| {
            warn!(error = %e, %allocation, "failed to delete redeemed voucher, retrying next tick");
            indexer_error(IndexerErrorCode::IE055).with_cause(e)
        })?;
    Ok(())
}

/// Adds each voucher's amount to its allocation's `withdrawn_fees` and
/// deletes the voucher rows, in one transaction, after a successful batch
/// redemption on chain.
pub async fn settle_redeemed_vouchers(pool: &PgPool, vouchers: &[Voucher]) -> Result<(), indexer_errors::IndexerError> {
    let mut tx = pool.begin().await.map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))?;

    for voucher in vouchers {
        let amount: BigDecimal = voucher
            .amount
            .parse()
            .map_err(|e| indexer_error(IndexerErrorCode::IE055).with_message(format!("invalid voucher amount: {e}")))?;

        sqlx::query(
            "UPDATE allocation_summaries SET withdrawn_fees = withdrawn_fees + $1 \
             WHERE allocation = $2 AND protocol_network = $3",
        )
        .bind(&amount)
        .bind(voucher.allocation.to_string())
        .bind(&voucher.protocol_network)
        .execute(&mut *tx)
        .await
        .map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))?;

        sqlx::query("DELETE FROM vouchers WHERE allocation = $1 AND protocol_network = $2")
            .bind(voucher.allocation.to_string())
            .bind(&voucher.protocol_network)
            .execute(&mut *tx)
            .await
            .map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))?;
    }

    tx.commit().await.map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))?;
    Ok(())
}

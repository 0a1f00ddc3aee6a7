// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Runtime-checked queries against the `scalar_tap_ravs` table shared with
//! the sender's TAP client. Query strings are built and bound at runtime
//! rather than with `sqlx::query!`, since this workspace ships without a
//! live database or a checked-in offline query cache.

use bigdecimal::BigDecimal;
use sqlx::PgPool;

use indexer_errors::{indexer_error, IndexerErrorCode};

use crate::types::Rav;

/// RAVs flagged `last = true` that have neither been redeemed nor
/// finalized yet — candidates for a fresh redemption attempt.
pub async fn unredeemed_finalized_false_ravs(pool: &PgPool, protocol_network: &str) -> Result<Vec<Rav>, indexer_errors::IndexerError> {
    sqlx::query_as::<_, Rav>(
        r#"
        SELECT allocation_id, sender_address, value_aggregate, signature, last, final AS final_, redeemed_at
        FROM scalar_tap_ravs
        WHERE last = true AND final = false AND redeemed_at IS NULL AND protocol_network = $1
        "#,
    )
    .bind(protocol_network)
    .fetch_all(pool)
    .await
    .map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))
}

/// RAVs marked redeemed but not yet final — candidates for reorg
/// compensation, since their redeem transaction may have been orphaned.
pub async fn redeemed_not_final_allocation_ids(pool: &PgPool, protocol_network: &str) -> Result<Vec<String>, indexer_errors::IndexerError> {
    sqlx::query_scalar::<_, String>(
        r#"
        SELECT allocation_id
        FROM scalar_tap_ravs
        WHERE last = true AND final = false AND redeemed_at IS NOT NULL AND protocol_network = $1
        "#,
    )
    .bind(protocol_network)
    .fetch_all(pool)
    .await
    .map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))
}

/// Un-redeems RAVs whose recorded redeem transaction is no longer observed
/// on chain: `redeemedAt` is reset to `NULL` so the next tick retries them.
pub async fn compensate_reorg(pool: &PgPool, allocation_ids: &[String], protocol_network: &str) -> Result<(), indexer_errors::IndexerError> {
    if allocation_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"
        UPDATE scalar_tap_ravs
        SET redeemed_at = NULL
        WHERE allocation_id = ANY($1) AND protocol_network = $2
        "#,
    )
    .bind(allocation_ids)
    .bind(protocol_network)
    .execute(pool)
    .await
    .map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))?;
    Ok(())
}

/// Promotes RAVs whose redemption has aged past `finality_time_secs` to
/// `final = true`.
pub async fn promote_finalized(pool: &PgPool, now_ms: i64, finality_time_secs: i64, protocol_network: &str) -> Result<(), indexer_errors::IndexerError> {
    let cutoff = now_ms - finality_time_secs * 1000;
    sqlx::query(
        r#"
        UPDATE scalar_tap_ravs
        SET final = true
        WHERE last = true AND final = false AND redeemed_at IS NOT NULL AND redeemed_at < $1 AND protocol_network = $2
        "#,
    )
    .bind(cutoff)
    .bind(protocol_network)
    .execute(pool)
    .await
    .map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))?;
    Ok(())
}

/// Marks a RAV redeemed at `now_ms` after a successful on-chain call.
pub async fn mark_redeemed(pool: &PgPool, allocation_id: &str, sender_address: &str, now_ms: i64, protocol_network: &str) -> Result<(), indexer_errors::IndexerError> {
    sqlx::query(
        r#"
        UPDATE scalar_tap_ravs
        SET redeemed_at = $1
        WHERE allocation_id = $2 AND sender_address = $3 AND protocol_network = $4
        "#,
    )
    .bind(now_ms)
    .bind(allocation_id)
    .bind(sender_address)
    .bind(protocol_network)
    .execute(pool)
    .await
    .map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))?;
    Ok(())
}

/// Adds each redeemed RAV's `valueAggregate` to its allocation's
/// `withdrawnFees` in one transaction, run once after a redemption batch.
pub async fn settle_withdrawn_fees(pool: &PgPool, redeemed: &[(String, BigDecimal)], protocol_network: &str) -> Result<(), indexer_errors::IndexerError> {
    if redeemed.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await.map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))?;
    for (allocation_id, value) in redeemed {
        sqlx::query(
            r#"
            UPDATE allocation_summaries
            SET withdrawn_fees = withdrawn_fees + $1
            WHERE allocation = $2 AND protocol_network = $3
            "#,
        )
        .bind(value)
        .bind(allocation_id)
        .bind(protocol_network)
        .execute(&mut *tx)
        .await
        .map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))?;
    }
    tx.commit().await.map_err(|e| indexer_error(IndexerErrorCode::IE055).with_cause(e))?;
    Ok(())
}

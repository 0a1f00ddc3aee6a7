// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! The transaction manager: a single serializer in front of the wallet that
//! waits under a gas ceiling, retries with bumped fees, classifies reverts,
//! and resubmits on the same nonce.

use std::time::Duration;

use async_trait::async_trait;
use indexer_errors::{indexer_error, IndexerErrorCode};
use tokio::time::sleep;
use tracing::{info, warn};

pub mod revert;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Legacy,
    Eip1559,
}

/// Gas fee data as reported by the chain's fee market, in wei.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeeData {
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
}

impl FeeData {
    pub fn transaction_type(&self) -> TransactionType {
        if self.max_fee_per_gas.is_some() && self.max_priority_fee_per_gas.is_some() {
            TransactionType::Eip1559
        } else {
            TransactionType::Legacy
        }
    }

    /// `(maxFee - maxPriority) / 2` for EIP-1559, or `gasPrice` for Legacy.
    pub fn base_fee_per_gas(&self) -> Option<u128> {
        match self.transaction_type() {
            TransactionType::Eip1559 => {
                let max_fee = self.max_fee_per_gas?;
                let max_priority = self.max_priority_fee_per_gas?;
                Some(max_fee.saturating_sub(max_priority) / 2)
            }
            TransactionType::Legacy => self.gas_price,
        }
    }
}

#[async_trait]
pub trait FeeOracle: Send + Sync {
    async fn fee_data(&self) -> anyhow::Result<FeeData>;
}

/// Retry state carried across send attempts. Nonce is captured on the first
/// send and reused across retries (resubmissions, never a fresh nonce,
/// except for the explicit "nonce is too low" bump).
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    pub attempt: u32,
    pub tx_type: TransactionType,
    pub nonce: u64,
    pub gas_limit: u128,
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    /// Fixed-point millis, e.g. 1200 = +20%.
    pub gas_bump_millis: u32,
}

impl TransactionConfig {
    pub fn new(nonce: u64, estimate: u128, fee_data: FeeData, gas_bump_millis: u32) -> Self {
        Self {
            attempt: 0,
            tx_type: fee_data.transaction_type(),
            nonce,
            gas_limit: (estimate * 3).div_ceil(2),
            gas_price: fee_data.gas_price,
            max_fee_per_gas: fee_data.max_fee_per_gas,
            max_priority_fee_per_gas: fee_data.max_priority_fee_per_gas,
            gas_bump_millis,
        }
    }

    fn bump(value: u128, bump_millis: u32) -> u128 {
        value.saturating_mul(bump_millis as u128) / 1000
    }

    fn bump_gas_price(&mut self) {
        if let Some(v) = self.gas_price {
            self.gas_price = Some(Self::bump(v, self.gas_bump_millis));
        }
        if let Some(v) = self.max_fee_per_gas {
            self.max_fee_per_gas = Some(Self::bump(v, self.gas_bump_millis));
        }
        if let Some(v) = self.max_priority_fee_per_gas {
            self.max_priority_fee_per_gas = Some(Self::bump(v, self.gas_bump_millis));
        }
    }

    fn bump_gas_limit(&mut self) {
        self.gas_limit = Self::bump(self.gas_limit, self.gas_bump_millis);
    }
}

/// What a single attempt at `send` produced. The manager classifies `Error`
/// messages itself, matching the source's string-based error taxonomy.
pub enum SendAttempt<R> {
    Confirmed(R),
    /// The transaction landed on chain but reverted (`status == 0`); the
    /// hex-encoded return data is supplied for revert-reason decoding.
    Reverted(String),
    Error(String),
}

#[async_trait]
pub trait TransactionSender<R: Send>: Send + Sync {
    /// A pure gas estimate; may be re-invoked on every attempt.
    async fn estimate(&self) -> anyhow::Result<u128>;
    /// Submits (or resubmits) with `config` and waits for the outcome.
    async fn send(&self, config: &TransactionConfig) -> SendAttempt<R>;
}

#[derive(Debug, Clone)]
pub enum ExecuteOutcome<R> {
    Receipt(R),
    Paused,
    Unauthorized,
}

impl<R> ExecuteOutcome<R> {
    pub fn is_receipt(&self) -> bool {
        matches!(self, ExecuteOutcome::Receipt(_))
    }
}

pub struct TransactionManagerConfig {
    pub base_fee_per_gas_max: u128,
    pub gas_increase_factor_millis: u32,
    pub max_transaction_attempts: i64,
}

/// Waits until the chain's base fee falls under `max_base_fee`, sleeping 30s
/// between checks and logging a warning once, then info on each subsequent
/// wait.
pub async fn wait_for_gas_ceiling(oracle: &dyn FeeOracle, max_base_fee: u128) -> anyhow::Result<FeeData> {
    let mut warned = false;
    loop {
        let fee_data = oracle.fee_data().await?;
        let base_fee = fee_data.base_fee_per_gas().unwrap_or(0);
        if base_fee < max_base_fee {
            return Ok(fee_data);
        }
        if !warned {
            warn!(base_fee, max_base_fee, "base fee per gas above ceiling, waiting");
            warned = true;
        } else {
            info!(base_fee, max_base_fee, "still waiting for base fee per gas to fall below ceiling");
        }
        sleep(Duration::from_secs(30)).await;
    }
}

fn classify_error(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if lower.contains("nonce has already been used")
        || lower.contains("transaction with the same hash was already imported")
    {
        ErrorClass::NonceReplayed
    } else if lower.contains("nonce is too low") {
        ErrorClass::NonceTooLow
    } else if lower.contains("try increasing the fee")
        || lower.contains("gas price supplied is too low")
        || lower.contains("timeout exceeded")
    {
        ErrorClass::FeeTooLow
    } else {
        ErrorClass::Unknown
    }
}

enum ErrorClass {
    NonceReplayed,
    NonceTooLow,
    FeeTooLow,
    Unknown,
}

/// Runs `sender` to completion under nonce `nonce`, honoring pause/operator
/// gates, the gas ceiling, and the retry/classification rules of §4.4.
pub async fn execute<R: Send>(
    config: &TransactionManagerConfig,
    fee_oracle: &dyn FeeOracle,
    paused: &tokio::sync::watch::Receiver<bool>,
    is_operator: &tokio::sync::watch::Receiver<bool>,
    nonce: u64,
    sender: &dyn TransactionSender<R>,
) -> Result<ExecuteOutcome<R>, indexer_errors::IndexerError> {
    if *paused.borrow() {
        return Ok(ExecuteOutcome::Paused);
    }
    if !*is_operator.borrow() {
        return Ok(ExecuteOutcome::Unauthorized);
    }

    let fee_data = wait_for_gas_ceiling(fee_oracle, config.base_fee_per_gas_max)
        .await
        .map_err(|e| indexer_error(IndexerErrorCode::IE057).with_cause(e))?;

    let estimate = sender
        .estimate()
        .await
        .map_err(|e| indexer_error(IndexerErrorCode::IE057).with_cause(e))?;

    let mut tx_config = TransactionConfig::new(nonce, estimate, fee_data, config.gas_increase_factor_millis);

    loop {
        match sender.send(&tx_config).await {
            SendAttempt::Confirmed(receipt) => return Ok(ExecuteOutcome::Receipt(receipt)),
            SendAttempt::Reverted(return_data) => match revert::decode_revert_reason(&return_data) {
                Some(reason) if reason.eq_ignore_ascii_case("out of gas") => {
                    warn!(reason = %reason, "transaction ran out of gas, bumping gas limit and retrying");
                    tx_config.bump_gas_limit();
                    tx_config.nonce += 1;

                    tx_config.attempt += 1;
                    let unbounded = config.max_transaction_attempts <= 0;
                    if !unbounded && tx_config.attempt as i64 > config.max_transaction_attempts {
                        sleep(Duration::from_secs(30)).await;
                        return Err(indexer_error(IndexerErrorCode::IE050).with_message(reason));
                    }
                }
                Some(reason) => return Err(indexer_error(IndexerErrorCode::IE057).with_message(reason)),
                None => return Err(indexer_error(IndexerErrorCode::IE051)),
            },
            SendAttempt::Error(message) => {
                match classify_error(&message) {
                    ErrorClass::NonceReplayed => {
                        sleep(Duration::from_secs(30)).await;
                        return Err(indexer_error(IndexerErrorCode::IE058).with_message(message));
                    }
                    ErrorClass::NonceTooLow => {
                        tx_config.nonce += 1;
                    }
                    ErrorClass::FeeTooLow => {
                        tx_config.bump_gas_price();
                    }
                    ErrorClass::Unknown => {
                        tx_config.bump_gas_limit();
                        tx_config.nonce += 1;
                    }
                }

                tx_config.attempt += 1;
                let unbounded = config.max_transaction_attempts <= 0;
                if !unbounded && tx_config.attempt as i64 > config.max_transaction_attempts {
                    sleep(Duration::from_secs(30)).await;
                    return Err(indexer_error(IndexerErrorCode::IE057).with_message(message));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn eip1559_base_fee_is_half_the_spread() {
        let fee = FeeData {
            gas_price: None,
            max_fee_per_gas: Some(200),
            max_priority_fee_per_gas: Some(100),
        };
        assert_eq!(fee.transaction_type(), TransactionType::Eip1559);
        assert_eq!(fee.base_fee_per_gas(), Some(50));
    }

    #[test]
    fn legacy_base_fee_is_gas_price() {
        let fee = FeeData {
            gas_price: Some(42),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
        };
        assert_eq!(fee.transaction_type(), TransactionType::Legacy);
        assert_eq!(fee.base_fee_per_gas(), Some(42));
    }

    struct SteppedOracle {
        calls: AtomicU32,
    }

    #[async_trait]
    impl FeeOracle for SteppedOracle {
        async fn fee_data(&self) -> anyhow::Result<FeeData> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let max_fee = if n == 0 { 200 } else { 80 };
            Ok(FeeData {
                gas_price: None,
                max_fee_per_gas: Some(max_fee),
                max_priority_fee_per_gas: Some(0),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_under_gas_ceiling_then_proceeds() {
        let oracle = SteppedOracle { calls: AtomicU32::new(0) };
        let handle = tokio::spawn(async move { wait_for_gas_ceiling(&oracle, 50).await });
        tokio::time::advance(Duration::from_secs(31)).await;
        let fee = handle.await.unwrap().unwrap();
        assert_eq!(fee.base_fee_per_gas(), Some(40));
    }

    #[test]
    fn gas_limit_is_estimate_times_one_point_five() {
        let config = TransactionConfig::new(1, 100, FeeData::default(), 1200);
        assert_eq!(config.gas_limit, 150);
    }
}

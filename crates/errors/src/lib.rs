// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! The agent's closed set of coded errors.
//!
//! Every fallible operation in the core reports one of these codes rather than
//! a free-form error, so operators can grep logs and dashboards by a stable
//! identifier. Each code carries a canonical human message, a documentation
//! link, an optional underlying cause, and bumps a `indexer_error{code=...}`
//! Prometheus counter when constructed.

use std::fmt;

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec};

lazy_static! {
    static ref INDEXER_ERROR_COUNTER: IntCounterVec = register_int_counter_vec!(
        "indexer_error",
        "Count of indexer errors by code",
        &["code"]
    )
    .expect("failed to register indexer_error metric");
}

macro_rules! error_codes {
    ($($variant:ident => ($code:literal, $msg:literal)),+ $(,)?) => {
        /// A coded error kind. The variant names match the `graphprotocol/indexer`
        /// error catalog; not every code in the IE001..IE075 range is reachable
        /// from this crate's scope, only the ones this core can actually raise.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum IndexerErrorCode {
            $($variant),+
        }

        impl IndexerErrorCode {
            pub fn code(&self) -> &'static str {
                match self {
                    $(Self::$variant => $code),+
                }
            }

            pub fn canonical_message(&self) -> &'static str {
                match self {
                    $(Self::$variant => $msg),+
                }
            }
        }
    };
}

error_codes! {
    IE010 => ("IE010", "Failed to query indexer allocations"),
    IE018 => ("IE018", "Failed to query indexing status"),
    IE019 => ("IE019", "Failed to query proof of indexing"),
    IE020 => ("IE020", "Failed to create subgraph deployment"),
    IE024 => ("IE024", "Failed to query subgraph"),
    IE025 => ("IE025", "Subgraph data is behind chain head"),
    IE026 => ("IE026", "Failed to deploy subgraph deployment"),
    IE027 => ("IE027", "Failed to pause subgraph deployment"),
    IE028 => ("IE028", "Failed to reassign subgraph deployment"),
    IE035 => ("IE035", "Unhandled promise rejection"),
    IE036 => ("IE036", "Uncaught exception"),
    IE050 => ("IE050", "Transaction failed: out of gas"),
    IE051 => ("IE051", "Transaction reverted: unable to parse the revert reason"),
    IE053 => ("IE053", "Failed to queue receipts for collection"),
    IE054 => ("IE054", "Failed to collect receipts and exchange them for a voucher"),
    IE055 => ("IE055", "Failed to redeem voucher or RAV on chain"),
    IE056 => ("IE056", "Failed to remember allocation for collecting receipts"),
    IE057 => ("IE057", "Transaction reverted"),
    IE058 => ("IE058", "Transaction may have already been submitted"),
    IE070 => ("IE070", "Failed to query block hash from number"),
    IE073 => ("IE073", "Failed to query subgraph features"),
    IE074 => ("IE074", "Failed to deploy subgraph deployment: network not supported"),
    IE075 => ("IE075", "Invalid graft base lineage"),
    IE076 => ("IE076", "Failed to resume subgraph deployment"),
}

/// The disposition of an error, used by callers deciding whether to retry
/// in place, re-queue the unit of work, or surface it to the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient: caller keeps its previous state and retries next tick.
    RetryInPlace,
    /// Transient: the unit of work is pushed back onto its queue.
    Requeue,
    /// Fatal for the transaction in flight, but safe to attempt again.
    FatalForTransaction,
    /// Fatal for the current process session; requires reconciliation.
    FatalForSession,
    /// A broken invariant in caller-supplied data.
    ProgrammerError,
}

impl IndexerErrorCode {
    pub fn disposition(&self) -> Disposition {
        use Disposition::*;
        use IndexerErrorCode::*;
        match self {
            IE010 | IE018 | IE019 | IE024 | IE025 => RetryInPlace,
            IE053 | IE054 | IE055 | IE056 => Requeue,
            IE050 | IE051 | IE057 => FatalForTransaction,
            IE058 => FatalForSession,
            IE075 => ProgrammerError,
            _ => RetryInPlace,
        }
    }

    fn doc_url(&self) -> String {
        format!(
            "https://github.com/graphprotocol/indexer/blob/main/docs/errors.md#{}",
            self.code().to_lowercase()
        )
    }
}

/// A single coded error, optionally wrapping an underlying cause.
#[derive(Debug)]
pub struct IndexerError {
    pub code: IndexerErrorCode,
    pub message: String,
    pub doc_url: String,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl IndexerError {
    pub fn new(code: IndexerErrorCode) -> Self {
        INDEXER_ERROR_COUNTER.with_label_values(&[code.code()]).inc();
        Self {
            message: code.canonical_message().to_owned(),
            doc_url: code.doc_url(),
            code,
            cause: None,
        }
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn disposition(&self) -> Disposition {
        self.code.disposition()
    }
}

impl fmt::Display for IndexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.code.code(), self.message, self.doc_url)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for IndexerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Shorthand for constructing an [`IndexerError`] from a code.
pub fn indexer_error(code: IndexerErrorCode) -> IndexerError {
    IndexerError::new(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_code_message_and_url() {
        let err = indexer_error(IndexerErrorCode::IE075)
            .with_message("Failed to find the graft root for target subgraph deployment (QmTarget) after 2 iterations.");
        let rendered = err.to_string();
        assert!(rendered.starts_with("IE075:"));
        assert!(rendered.contains("QmTarget"));
        assert!(rendered.contains("docs/errors.md#ie075"));
    }

    #[test]
    fn carries_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = indexer_error(IndexerErrorCode::IE054).with_cause(cause);
        assert!(err.to_string().contains("boom"));
        assert_eq!(err.disposition(), Disposition::Requeue);
    }

    #[test]
    fn disposition_table_matches_spec() {
        assert_eq!(IndexerErrorCode::IE010.disposition(), Disposition::RetryInPlace);
        assert_eq!(IndexerErrorCode::IE058.disposition(), Disposition::FatalForSession);
        assert_eq!(IndexerErrorCode::IE050.disposition(), Disposition::FatalForTransaction);
        assert_eq!(IndexerErrorCode::IE075.disposition(), Disposition::ProgrammerError);
    }
}

//! Adjustment error model.

use std::time::Duration;

use thiserror::Error;

use stockguard_core::{DomainError, ExpectedVersion, StockId};
use stockguard_infra::{LockError, StoreError};

/// Result type returned by every adjustment strategy.
pub type AdjustResult<T> = Result<T, AdjustError>;

/// Adjustment failure as seen by the caller of a strategy.
///
/// ## Error Categories
///
/// - **InsufficientQuantity**: business rule; never retried automatically
/// - **VersionConflict**: transient collision; re-read and retry
/// - **NotFound**: the record is absent; fatal for the operation
/// - **Timeout** / **RetriesExhausted**: a caller-imposed bound ran out
/// - **Domain**: invalid input (zero amount, overflow)
/// - **Lock** / **Store** / **Poisoned**: infrastructure failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdjustError {
    #[error("insufficient quantity for stock {id} (requested: {requested}, available: {available})")]
    InsufficientQuantity {
        id: StockId,
        requested: u64,
        available: u64,
    },

    #[error("version conflict on stock {id} (expected: {expected}, actual: {actual})")]
    VersionConflict {
        id: StockId,
        expected: u64,
        actual: u64,
    },

    #[error("stock {0} not found")]
    NotFound(StockId),

    #[error("timed out after {waited:?} adjusting stock {id}")]
    Timeout { id: StockId, waited: Duration },

    #[error("gave up on stock {id} after {attempts} attempts: {last}")]
    RetriesExhausted {
        id: StockId,
        attempts: u32,
        last: Box<AdjustError>,
    },

    #[error("invalid adjustment: {0}")]
    Domain(DomainError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(StoreError),

    #[error("coordination state poisoned: {0}")]
    Poisoned(String),
}

impl AdjustError {
    /// Whether retrying the whole operation with a fresh read may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AdjustError::VersionConflict { .. })
    }

    pub(crate) fn from_domain(id: StockId, err: DomainError) -> Self {
        match err {
            DomainError::InsufficientQuantity {
                requested,
                available,
            } => AdjustError::InsufficientQuantity {
                id,
                requested,
                available,
            },
            other => AdjustError::Domain(other),
        }
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        AdjustError::Poisoned(what.to_string())
    }
}

impl From<StoreError> for AdjustError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => AdjustError::NotFound(id),
            StoreError::Conflict {
                id,
                expected,
                actual,
            } => AdjustError::VersionConflict {
                id,
                expected: match expected {
                    ExpectedVersion::Exact(v) => v,
                    ExpectedVersion::Any => actual,
                },
                actual,
            },
            StoreError::Lock(lock) => AdjustError::Lock(lock),
            other => AdjustError::Store(other),
        }
    }
}

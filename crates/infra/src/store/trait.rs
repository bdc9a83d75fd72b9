use thiserror::Error;

use stockguard_core::{ExpectedVersion, StockId};
use stockguard_inventory::StockRecord;

use crate::advisory_lock::LockError;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Stock store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, locking) as opposed
/// to domain errors (validation, insufficient quantity).
///
/// ## Error Categories
///
/// - **NotFound**: no record under the id
/// - **AlreadyExists**: seeding an id twice
/// - **Conflict**: conditional write found a different version stamp
/// - **Lock**: the row lock could not be taken or released
/// - **Poisoned**: an in-process lock was poisoned by a panic
/// - **Backend**: database/network failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("stock record {0} not found")]
    NotFound(StockId),

    #[error("stock record {0} already exists")]
    AlreadyExists(StockId),

    #[error("version conflict on stock record {id} (expected: {expected:?}, actual: {actual})")]
    Conflict {
        id: StockId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("row lock failed: {0}")]
    Lock(#[from] LockError),

    #[error("store state poisoned: {0}")]
    Poisoned(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// An exclusive read of one record, held until committed or dropped.
///
/// While a lease is alive no other exclusive read or write of the same id
/// proceeds. Writes made through the lease become visible on
/// [`commit`](RowLease::commit); dropping the lease without committing rolls
/// them back. Either way the row lock is released.
pub trait RowLease {
    /// The record as of the latest write through this lease.
    fn record(&self) -> &StockRecord;

    /// Write `quantity` (bumps the version stamp once).
    fn write(&mut self, quantity: u64) -> StoreResult<&StockRecord>;

    /// Make the lease's writes durable and release the row lock.
    fn commit(self) -> StoreResult<StockRecord>
    where
        Self: Sized;
}

/// Durable id → record mapping consumed by every adjustment strategy.
///
/// Implementations must be safe to share across threads. All methods block
/// the calling thread; none of them are reentrant with respect to a lease held
/// by the same thread on the same id.
pub trait StockStore: Send + Sync {
    type Lease<'a>: RowLease
    where
        Self: 'a;

    /// Seed a new record (version 0).
    fn insert(&self, id: StockId, quantity: u64) -> StoreResult<StockRecord>;

    /// Plain read, no locking.
    fn get(&self, id: StockId) -> StoreResult<StockRecord>;

    /// Exclusive read: blocks until no other lease on `id` is alive.
    fn get_for_exclusive_read(&self, id: StockId) -> StoreResult<Self::Lease<'_>>;

    /// Unconditional write (still bumps the version stamp).
    fn write(&self, id: StockId, quantity: u64) -> StoreResult<StockRecord>;

    /// Write only if the stored version matches `expected`, bumping it atomically.
    fn write_if_version(
        &self,
        id: StockId,
        quantity: u64,
        expected: ExpectedVersion,
    ) -> StoreResult<StockRecord>;

    /// Remove every record (test teardown).
    fn clear(&self) -> StoreResult<()>;
}

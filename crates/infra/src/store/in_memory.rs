use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::{debug, warn};

use stockguard_core::{AggregateRoot, ExpectedVersion, StockId};
use stockguard_inventory::StockRecord;

use super::r#trait::{RowLease, StockStore, StoreError, StoreResult};
use crate::lock_table::KeyedLockTable;

/// In-memory stock store.
///
/// Intended for tests/dev. Row-level exclusivity is modeled with a
/// [`KeyedLockTable`]: leases hold the row lock for their whole lifetime and
/// plain/conditional writes take it just long enough to apply, so they queue
/// behind a live lease the way an `UPDATE` queues behind `SELECT … FOR UPDATE`.
#[derive(Debug, Default)]
pub struct InMemoryStockStore {
    records: RwLock<HashMap<StockId, StockRecord>>,
    row_locks: KeyedLockTable,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_records(&self) -> StoreResult<RwLockReadGuard<'_, HashMap<StockId, StockRecord>>> {
        self.records
            .read()
            .map_err(|_| StoreError::Poisoned("stock records".to_string()))
    }

    fn write_records(&self) -> StoreResult<RwLockWriteGuard<'_, HashMap<StockId, StockRecord>>> {
        self.records
            .write()
            .map_err(|_| StoreError::Poisoned("stock records".to_string()))
    }

    /// Run `f` while holding the row lock of `id`.
    fn with_row_lock<T>(&self, id: StockId, f: impl FnOnce() -> StoreResult<T>) -> StoreResult<T> {
        self.row_locks.acquire(id.lock_key())?;
        let result = f();
        self.row_locks.release(id.lock_key())?;
        result
    }

    fn apply(&self, id: StockId, expected: ExpectedVersion, quantity: u64) -> StoreResult<StockRecord> {
        let mut records = self.write_records()?;
        let current = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if !expected.matches(current.version()) {
            return Err(StoreError::Conflict {
                id,
                expected,
                actual: current.version(),
            });
        }

        *current = current.committed(quantity, Utc::now());
        Ok(current.clone())
    }
}

impl StockStore for InMemoryStockStore {
    type Lease<'a>
        = InMemoryLease<'a>
    where
        Self: 'a;

    fn insert(&self, id: StockId, quantity: u64) -> StoreResult<StockRecord> {
        let mut records = self.write_records()?;
        if records.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        let record = StockRecord::seeded(id, quantity, Utc::now());
        records.insert(id, record.clone());
        Ok(record)
    }

    fn get(&self, id: StockId) -> StoreResult<StockRecord> {
        self.read_records()?
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn get_for_exclusive_read(&self, id: StockId) -> StoreResult<Self::Lease<'_>> {
        self.row_locks.acquire(id.lock_key())?;

        let record = match self.get(id) {
            Ok(record) => record,
            Err(err) => {
                self.row_locks.release(id.lock_key())?;
                return Err(err);
            }
        };

        debug!(%id, version = record.version(), "row lease granted");
        Ok(InMemoryLease {
            store: self,
            record,
            dirty: false,
            open: true,
        })
    }

    fn write(&self, id: StockId, quantity: u64) -> StoreResult<StockRecord> {
        self.with_row_lock(id, || self.apply(id, ExpectedVersion::Any, quantity))
    }

    fn write_if_version(
        &self,
        id: StockId,
        quantity: u64,
        expected: ExpectedVersion,
    ) -> StoreResult<StockRecord> {
        self.with_row_lock(id, || self.apply(id, expected, quantity))
    }

    fn clear(&self) -> StoreResult<()> {
        self.write_records()?.clear();
        Ok(())
    }
}

/// Exclusive lease on one in-memory record.
#[derive(Debug)]
pub struct InMemoryLease<'a> {
    store: &'a InMemoryStockStore,
    record: StockRecord,
    dirty: bool,
    open: bool,
}

impl RowLease for InMemoryLease<'_> {
    fn record(&self) -> &StockRecord {
        &self.record
    }

    fn write(&mut self, quantity: u64) -> StoreResult<&StockRecord> {
        self.record = self.record.committed(quantity, Utc::now());
        self.dirty = true;
        Ok(&self.record)
    }

    fn commit(mut self) -> StoreResult<StockRecord> {
        let id = self.record.id_typed();
        if self.dirty {
            let mut records = self.store.write_records()?;
            let slot = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            *slot = self.record.clone();
        }

        self.open = false;
        self.store.row_locks.release(id.lock_key())?;
        debug!(%id, version = self.record.version(), "row lease committed");
        Ok(self.record.clone())
    }
}

impl Drop for InMemoryLease<'_> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let id = self.record.id_typed();
        if let Err(err) = self.store.row_locks.release(id.lock_key()) {
            warn!(%id, error = %err, "failed to release row lease on rollback");
        } else {
            debug!(%id, "row lease rolled back");
        }
    }
}

//! Version-checked adjuster.
//!
//! No lock is held between the read and the write: the write succeeds only if
//! the row still carries the version that was read. A lost race surfaces as
//! [`AdjustError::VersionConflict`]; retrying is the caller's job (see
//! [`AdvisoryLockAdjuster`](crate::AdvisoryLockAdjuster) with a
//! [`RetryPolicy`](crate::RetryPolicy)).

use std::sync::Arc;

use tracing::{debug, instrument};

use stockguard_core::{AggregateRoot, Amount, ExpectedVersion, StockId};
use stockguard_infra::StockStore;
use stockguard_inventory::StockRecord;

use crate::adjuster::StockAdjuster;
use crate::error::{AdjustError, AdjustResult};

/// A computed quantity waiting to be written against the version it was read at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    pub id: StockId,
    pub quantity: u64,
    pub read_version: u64,
}

#[derive(Debug)]
pub struct OptimisticAdjuster<S> {
    store: Arc<S>,
}

impl<S: StockStore> OptimisticAdjuster<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Read the record and compute the decreased quantity without writing.
    pub fn prepare_decrease(&self, id: StockId, amount: u64) -> AdjustResult<PendingWrite> {
        let amount = Amount::new(amount).map_err(AdjustError::Domain)?;
        let snapshot = self.store.get(id)?;
        let quantity = snapshot
            .decreased(amount)
            .map_err(|e| AdjustError::from_domain(id, e))?;
        Ok(PendingWrite {
            id,
            quantity,
            read_version: snapshot.version(),
        })
    }

    /// Read the record and compute the increased quantity without writing.
    pub fn prepare_increase(&self, id: StockId, amount: u64) -> AdjustResult<PendingWrite> {
        let amount = Amount::new(amount).map_err(AdjustError::Domain)?;
        let snapshot = self.store.get(id)?;
        let quantity = snapshot
            .increased(amount)
            .map_err(|e| AdjustError::from_domain(id, e))?;
        Ok(PendingWrite {
            id,
            quantity,
            read_version: snapshot.version(),
        })
    }

    /// Write `pending` if the row is still at `pending.read_version`.
    pub fn apply(&self, pending: PendingWrite) -> AdjustResult<StockRecord> {
        let committed = self.store.write_if_version(
            pending.id,
            pending.quantity,
            ExpectedVersion::Exact(pending.read_version),
        )?;
        debug!(id = %pending.id, version = committed.version(), "version-checked write committed");
        Ok(committed)
    }
}

impl<S: StockStore> StockAdjuster for OptimisticAdjuster<S> {
    #[instrument(skip(self), err)]
    fn decrease(&self, id: StockId, amount: u64) -> AdjustResult<StockRecord> {
        self.apply(self.prepare_decrease(id, amount)?)
    }

    #[instrument(skip(self), err)]
    fn increase(&self, id: StockId, amount: u64) -> AdjustResult<StockRecord> {
        self.apply(self.prepare_increase(id, amount)?)
    }
}

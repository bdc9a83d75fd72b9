//! Row-lease adjuster.
//!
//! Each operation takes an exclusive lease on the row, computes the new
//! quantity from the leased record and commits. Concurrent callers on the same
//! id queue inside the store; callers on other ids are unaffected. Short stock
//! fails immediately and the lease is dropped, which rolls the transaction back.

use std::sync::Arc;

use tracing::{debug, instrument};

use stockguard_core::{AggregateRoot, Amount, StockId};
use stockguard_infra::{RowLease, StockStore};
use stockguard_inventory::StockRecord;

use crate::adjuster::StockAdjuster;
use crate::error::{AdjustError, AdjustResult};

#[derive(Debug)]
pub struct PessimisticAdjuster<S> {
    store: Arc<S>,
}

impl<S: StockStore> PessimisticAdjuster<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn adjust(
        &self,
        id: StockId,
        amount: u64,
        next: impl FnOnce(&StockRecord, Amount) -> AdjustResult<u64>,
    ) -> AdjustResult<StockRecord> {
        let amount = Amount::new(amount).map_err(AdjustError::Domain)?;

        let mut lease = self.store.get_for_exclusive_read(id)?;
        let quantity = next(lease.record(), amount)?;
        lease.write(quantity)?;
        let committed = lease.commit()?;

        debug!(%id, quantity = committed.quantity(), version = committed.version(), "adjusted under row lease");
        Ok(committed)
    }
}

impl<S: StockStore> StockAdjuster for PessimisticAdjuster<S> {
    #[instrument(skip(self), err)]
    fn decrease(&self, id: StockId, amount: u64) -> AdjustResult<StockRecord> {
        self.adjust(id, amount, |record, amount| {
            record
                .decreased(amount)
                .map_err(|e| AdjustError::from_domain(id, e))
        })
    }

    #[instrument(skip(self), err)]
    fn increase(&self, id: StockId, amount: u64) -> AdjustResult<StockRecord> {
        self.adjust(id, amount, |record, amount| {
            record
                .increased(amount)
                .map_err(|e| AdjustError::from_domain(id, e))
        })
    }
}

//! Single process-wide mutex adjuster.
//!
//! Every operation on every id serializes on one mutex, and every parked
//! decrease shares one condition. A short decrease parks holding no lock until
//! some increase makes enough stock visible. Correct, but callers on unrelated
//! ids wait on each other, and a signal for one id may first land on a
//! decrease parked on another id, which then wakes the rest. Prefer
//! [`PerKeyMutexAdjuster`](crate::PerKeyMutexAdjuster).

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use stockguard_core::{Amount, StockId};
use stockguard_infra::StockStore;
use stockguard_inventory::StockRecord;

use crate::adjuster::StockAdjuster;
use crate::error::{AdjustError, AdjustResult};
use crate::monitor::{Monitor, SlotPhase, WakePolicy};

#[derive(Debug)]
pub struct CoarseMutexAdjuster<S> {
    store: Arc<S>,
    monitor: Monitor<()>,
    wake: WakePolicy,
}

impl<S: StockStore> CoarseMutexAdjuster<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_wake_policy(store, WakePolicy::default())
    }

    pub fn with_wake_policy(store: Arc<S>, wake: WakePolicy) -> Self {
        Self {
            store,
            monitor: Monitor::new(),
            wake,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Like [`decrease`](StockAdjuster::decrease), but stop waiting for stock after `timeout`.
    #[instrument(skip(self), err)]
    pub fn decrease_within(
        &self,
        id: StockId,
        amount: u64,
        timeout: Duration,
    ) -> AdjustResult<StockRecord> {
        let amount = Amount::new(amount).map_err(AdjustError::Domain)?;
        self.monitor
            .decrease(&*self.store, id, amount, Some(timeout), self.wake)
    }

    /// Number of decreases currently parked, across all ids.
    pub fn waiters(&self) -> AdjustResult<usize> {
        Ok(self.monitor.lock()?.waiters)
    }

    pub fn phase(&self) -> AdjustResult<SlotPhase> {
        self.monitor.phase()
    }
}

impl<S: StockStore> StockAdjuster for CoarseMutexAdjuster<S> {
    #[instrument(skip(self), err)]
    fn decrease(&self, id: StockId, amount: u64) -> AdjustResult<StockRecord> {
        let amount = Amount::new(amount).map_err(AdjustError::Domain)?;
        self.monitor
            .decrease(&*self.store, id, amount, None, self.wake)
    }

    #[instrument(skip(self), err)]
    fn increase(&self, id: StockId, amount: u64) -> AdjustResult<StockRecord> {
        let amount = Amount::new(amount).map_err(AdjustError::Domain)?;
        self.monitor.increase(&*self.store, id, amount, self.wake)
    }
}

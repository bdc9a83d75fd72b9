//! One mutex per stock id.
//!
//! Same wait/signal protocol as [`CoarseMutexAdjuster`](crate::CoarseMutexAdjuster),
//! but each id gets its own monitor, created on first use. Callers on
//! different ids never contend beyond a brief registry lookup, and a signal on
//! one id can only wake decreases parked on that id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, instrument};

use stockguard_core::{Amount, StockId};
use stockguard_infra::StockStore;
use stockguard_inventory::StockRecord;

use crate::adjuster::StockAdjuster;
use crate::error::{AdjustError, AdjustResult};
use crate::monitor::{Monitor, SlotPhase, WakePolicy};

type KeySlot = Monitor<Option<StockRecord>>;

/// Get-or-create map from id to monitor.
///
/// Lookups take the read lock; only a miss takes the write lock, and it
/// re-checks before inserting, so concurrent first uses of an id always end
/// up sharing one slot. Slots are never evicted.
#[derive(Debug, Default)]
struct KeyRegistry {
    slots: RwLock<HashMap<StockId, Arc<KeySlot>>>,
}

impl KeyRegistry {
    fn slot(&self, id: StockId) -> AdjustResult<Arc<KeySlot>> {
        if let Some(slot) = self.existing(id)? {
            return Ok(slot);
        }

        let mut slots = self
            .slots
            .write()
            .map_err(|_| AdjustError::poisoned("key registry"))?;
        let slot = slots.entry(id).or_insert_with(|| {
            debug!(%id, "creating key slot");
            Arc::new(KeySlot::new())
        });
        Ok(slot.clone())
    }

    fn existing(&self, id: StockId) -> AdjustResult<Option<Arc<KeySlot>>> {
        let slots = self
            .slots
            .read()
            .map_err(|_| AdjustError::poisoned("key registry"))?;
        Ok(slots.get(&id).cloned())
    }

    fn len(&self) -> AdjustResult<usize> {
        Ok(self
            .slots
            .read()
            .map_err(|_| AdjustError::poisoned("key registry"))?
            .len())
    }
}

#[derive(Debug)]
pub struct PerKeyMutexAdjuster<S> {
    store: Arc<S>,
    registry: KeyRegistry,
    wake: WakePolicy,
}

impl<S: StockStore> PerKeyMutexAdjuster<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_wake_policy(store, WakePolicy::default())
    }

    pub fn with_wake_policy(store: Arc<S>, wake: WakePolicy) -> Self {
        Self {
            store,
            registry: KeyRegistry::default(),
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
        self.registry
            .slot(id)?
            .decrease(&*self.store, id, amount, Some(timeout), self.wake)
    }

    /// Number of ids that have a slot.
    pub fn tracked_keys(&self) -> AdjustResult<usize> {
        self.registry.len()
    }

    /// The record last read or written under `id`'s slot, if any.
    ///
    /// Informational only: adjustments always re-read the store.
    pub fn cached(&self, id: StockId) -> AdjustResult<Option<StockRecord>> {
        match self.registry.existing(id)? {
            Some(slot) => Ok(slot.lock()?.cache.clone()),
            None => Ok(None),
        }
    }

    /// Number of decreases parked on `id`.
    pub fn waiters(&self, id: StockId) -> AdjustResult<usize> {
        match self.registry.existing(id)? {
            Some(slot) => Ok(slot.lock()?.waiters),
            None => Ok(0),
        }
    }

    pub fn phase(&self, id: StockId) -> AdjustResult<SlotPhase> {
        match self.registry.existing(id)? {
            Some(slot) => slot.phase(),
            None => Ok(SlotPhase::Idle),
        }
    }
}

impl<S: StockStore> StockAdjuster for PerKeyMutexAdjuster<S> {
    #[instrument(skip(self), err)]
    fn decrease(&self, id: StockId, amount: u64) -> AdjustResult<StockRecord> {
        let amount = Amount::new(amount).map_err(AdjustError::Domain)?;
        self.registry
            .slot(id)?
            .decrease(&*self.store, id, amount, None, self.wake)
    }

    #[instrument(skip(self), err)]
    fn increase(&self, id: StockId, amount: u64) -> AdjustResult<StockRecord> {
        let amount = Amount::new(amount).map_err(AdjustError::Domain)?;
        self.registry
            .slot(id)?
            .increase(&*self.store, id, amount, self.wake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    use stockguard_infra::InMemoryStockStore;

    fn adjuster() -> Arc<PerKeyMutexAdjuster<InMemoryStockStore>> {
        let store = Arc::new(InMemoryStockStore::new());
        for id in 1..=3 {
            store.insert(StockId::new(id), 0).unwrap();
        }
        Arc::new(PerKeyMutexAdjuster::new(store))
    }

    #[test]
    fn concurrent_first_use_shares_one_slot() {
        let registry = Arc::new(KeyRegistry::default());
        let id = StockId::new(1);
        let slots: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.slot(id).unwrap())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();

        assert_eq!(registry.len().unwrap(), 1);
        assert!(slots.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn slots_are_created_lazily_and_kept() {
        let adjuster = adjuster();
        assert_eq!(adjuster.tracked_keys().unwrap(), 0);
        assert_eq!(adjuster.cached(StockId::new(1)).unwrap(), None);

        adjuster.increase(StockId::new(1), 4).unwrap();
        adjuster.increase(StockId::new(2), 1).unwrap();
        adjuster.decrease(StockId::new(1), 4).unwrap();
        assert_eq!(adjuster.tracked_keys().unwrap(), 2);

        let cached = adjuster.cached(StockId::new(1)).unwrap().unwrap();
        assert_eq!(cached.quantity(), 0);
        assert_eq!(adjuster.phase(StockId::new(1)).unwrap(), SlotPhase::Idle);
    }

    #[test]
    fn parked_decrease_does_not_block_other_ids() {
        let adjuster = adjuster();
        let (a, b) = (StockId::new(1), StockId::new(2));

        let waiter = {
            let adjuster = adjuster.clone();
            thread::spawn(move || adjuster.decrease(a, 5))
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while adjuster.waiters(a).unwrap() == 0 {
            assert!(Instant::now() < deadline, "waiter never parked");
            thread::sleep(Duration::from_millis(2));
        }

        // Traffic on b completes while a's waiter is parked.
        adjuster.increase(b, 3).unwrap();
        adjuster.decrease(b, 3).unwrap();
        assert_eq!(adjuster.waiters(b).unwrap(), 0);
        assert_eq!(adjuster.waiters(a).unwrap(), 1);
        assert_eq!(adjuster.phase(a).unwrap(), SlotPhase::Waiting);

        adjuster.increase(a, 5).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap().quantity(), 0);
    }

    #[test]
    fn small_decrease_proceeds_behind_a_large_one() {
        let adjuster = adjuster();
        let id = StockId::new(1);
        let park = |amount, n| {
            let waiter = {
                let adjuster = adjuster.clone();
                thread::spawn(move || adjuster.decrease_within(id, amount, Duration::from_secs(5)))
            };
            let deadline = Instant::now() + Duration::from_secs(5);
            while adjuster.waiters(id).unwrap() < n {
                assert!(Instant::now() < deadline, "waiter never parked");
                thread::sleep(Duration::from_millis(2));
            }
            waiter
        };
        let large = park(100, 1);
        let small = park(10, 2);

        adjuster.increase(id, 10).unwrap();
        assert_eq!(small.join().unwrap().unwrap().quantity(), 0);
        assert_eq!(adjuster.waiters(id).unwrap(), 1);

        adjuster.increase(id, 100).unwrap();
        assert_eq!(large.join().unwrap().unwrap().quantity(), 0);
        assert_eq!(adjuster.phase(id).unwrap(), SlotPhase::Idle);
    }

    #[test]
    fn decrease_within_times_out_and_unparks() {
        let adjuster = adjuster();
        let id = StockId::new(3);
        assert!(matches!(
            adjuster.decrease_within(id, 1, Duration::from_millis(20)),
            Err(AdjustError::Timeout { .. })
        ));
        assert_eq!(adjuster.waiters(id).unwrap(), 0);
    }
}

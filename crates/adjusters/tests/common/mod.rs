#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use stockguard_adjusters::{
    AdvisoryLockAdjuster, CoarseMutexAdjuster, OptimisticAdjuster, PerKeyMutexAdjuster,
    PessimisticAdjuster, RetryPolicy, StockAdjuster,
};
use stockguard_core::{ExpectedVersion, StockId};
use stockguard_infra::store::InMemoryLease;
use stockguard_infra::{InMemoryAdvisoryLock, InMemoryStockStore, StockStore, StoreResult};
use stockguard_inventory::StockRecord;

pub fn init_tracing() {
    stockguard_observability::init();
}

pub fn seeded(records: &[(i64, u64)]) -> Arc<InMemoryStockStore> {
    let store = Arc::new(InMemoryStockStore::new());
    for &(id, quantity) in records {
        store.insert(StockId::new(id), quantity).unwrap();
    }
    store
}

pub fn quantity<S: StockStore>(store: &S, id: i64) -> u64 {
    store.get(StockId::new(id)).unwrap().quantity()
}

/// Every strategy, named, over one shared store.
///
/// The optimistic adjuster is wrapped in the advisory decorator so that lost
/// races are retried rather than surfaced.
pub fn all_strategies(
    store: &Arc<InMemoryStockStore>,
) -> Vec<(&'static str, Arc<dyn StockAdjuster>)> {
    let locks = Arc::new(InMemoryAdvisoryLock::new());
    vec![
        ("pessimistic", Arc::new(PessimisticAdjuster::new(store.clone()))),
        (
            "optimistic+advisory",
            Arc::new(AdvisoryLockAdjuster::with_policy(
                OptimisticAdjuster::new(store.clone()),
                locks.clone(),
                RetryPolicy::fixed(100, Duration::from_millis(1)),
            )),
        ),
        (
            "pessimistic+advisory",
            Arc::new(AdvisoryLockAdjuster::new(
                PessimisticAdjuster::new(store.clone()),
                locks,
            )),
        ),
        ("coarse", Arc::new(CoarseMutexAdjuster::new(store.clone()))),
        ("per-key", Arc::new(PerKeyMutexAdjuster::new(store.clone()))),
    ]
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

/// In-memory store whose writes take a while, recording how many overlap.
#[derive(Debug, Default)]
pub struct SlowStore {
    inner: InMemoryStockStore,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn slowly<T>(&self, f: impl FnOnce() -> T) -> T {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        thread::sleep(self.delay);
        let out = f();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

impl StockStore for SlowStore {
    type Lease<'a>
        = InMemoryLease<'a>
    where
        Self: 'a;

    fn insert(&self, id: StockId, quantity: u64) -> StoreResult<StockRecord> {
        self.inner.insert(id, quantity)
    }

    fn get(&self, id: StockId) -> StoreResult<StockRecord> {
        self.inner.get(id)
    }

    fn get_for_exclusive_read(&self, id: StockId) -> StoreResult<Self::Lease<'_>> {
        self.inner.get_for_exclusive_read(id)
    }

    fn write(&self, id: StockId, quantity: u64) -> StoreResult<StockRecord> {
        self.slowly(|| self.inner.write(id, quantity))
    }

    fn write_if_version(
        &self,
        id: StockId,
        quantity: u64,
        expected: ExpectedVersion,
    ) -> StoreResult<StockRecord> {
        self.slowly(|| self.inner.write_if_version(id, quantity, expected))
    }

    fn clear(&self) -> StoreResult<()> {
        self.inner.clear()
    }
}

//! Blocking decreases, signalling and key isolation of the mutex strategies.

mod common;

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use common::{SlowStore, eventually, init_tracing, quantity, seeded};
use stockguard_adjusters::{
    CoarseMutexAdjuster, PerKeyMutexAdjuster, SlotPhase, StockAdjuster, WakePolicy,
};
use stockguard_core::StockId;
use stockguard_infra::StockStore;

const ONE: StockId = StockId::new(1);
const TWO: StockId = StockId::new(2);

#[test]
fn two_key_scenario_per_key() {
    init_tracing();
    let store = seeded(&[(1, 100), (2, 100)]);
    let adjuster = Arc::new(PerKeyMutexAdjuster::new(store.clone()));

    let (done_tx, done_rx) = mpsc::channel();
    let decreases: Vec<_> = [ONE, ONE, TWO]
        .into_iter()
        .map(|id| {
            let adjuster = adjuster.clone();
            let done_tx = done_tx.clone();
            thread::spawn(move || {
                let record = adjuster.decrease(id, 100).unwrap();
                done_tx.send(id).unwrap();
                record
            })
        })
        .collect();

    // One decrease on key 1 completes, the other parks; key 2 is unaffected.
    let mut finished = vec![
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
    ];
    finished.sort_by_key(|id| id.get());
    assert_eq!(finished, vec![ONE, TWO]);
    eventually("parked decrease on key 1", || adjuster.waiters(ONE).unwrap() == 1);
    assert_eq!(quantity(&*store, 1), 0);

    // Half the stock is not enough: the waiter re-checks and parks again.
    assert_eq!(adjuster.increase(ONE, 50).unwrap().quantity(), 50);
    eventually("waiter to re-park", || adjuster.waiters(ONE).unwrap() == 1);
    assert!(done_rx.try_recv().is_err());

    // The second increase reaches 100 with the waiter still parked.
    assert_eq!(adjuster.increase(ONE, 50).unwrap().quantity(), 100);
    assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), ONE);

    for decrease in decreases {
        decrease.join().unwrap();
    }
    assert_eq!(quantity(&*store, 1), 0);
    assert_eq!(quantity(&*store, 2), 0);
    assert_eq!(adjuster.phase(ONE).unwrap(), SlotPhase::Idle);
}

#[test]
fn two_key_scenario_coarse() {
    let store = seeded(&[(1, 100), (2, 100)]);
    let adjuster = Arc::new(CoarseMutexAdjuster::new(store.clone()));

    let decreases: Vec<_> = [ONE, ONE, TWO]
        .into_iter()
        .map(|id| {
            let adjuster = adjuster.clone();
            thread::spawn(move || adjuster.decrease(id, 100))
        })
        .collect();

    eventually("one parked decrease", || {
        adjuster.waiters().unwrap() == 1 && quantity(&*store, 2) == 0
    });
    adjuster.increase(ONE, 50).unwrap();
    adjuster.increase(ONE, 50).unwrap();

    for decrease in decreases {
        decrease.join().unwrap().unwrap();
    }
    assert_eq!(quantity(&*store, 1), 0);
    assert_eq!(quantity(&*store, 2), 0);
}

#[test]
fn one_signal_is_consumed_once() {
    for wake in [WakePolicy::One, WakePolicy::All] {
        let store = seeded(&[(1, 0)]);
        let adjuster = Arc::new(PerKeyMutexAdjuster::with_wake_policy(store.clone(), wake));

        let (done_tx, done_rx) = mpsc::channel();
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let adjuster = adjuster.clone();
                let done_tx = done_tx.clone();
                thread::spawn(move || {
                    let record = adjuster.decrease(ONE, 10).unwrap();
                    done_tx.send(()).unwrap();
                    record
                })
            })
            .collect();
        eventually("two parked decreases", || adjuster.waiters(ONE).unwrap() == 2);

        // Enough for exactly one of them.
        adjuster.increase(ONE, 10).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err(), "{wake:?}");
        eventually("loser to re-park", || adjuster.waiters(ONE).unwrap() == 1);
        assert_eq!(quantity(&*store, 1), 0);

        adjuster.increase(ONE, 10).unwrap();
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(quantity(&*store, 1), 0, "{wake:?}");
    }
}

#[test]
fn parked_decrease_holds_no_lock() {
    let store = seeded(&[(1, 0)]);
    let adjuster = Arc::new(PerKeyMutexAdjuster::new(store.clone()));
    let waiter = {
        let adjuster = adjuster.clone();
        thread::spawn(move || adjuster.decrease(ONE, 5))
    };
    eventually("parked decrease", || adjuster.waiters(ONE).unwrap() == 1);

    // Other callers on the same key get through while the waiter is parked.
    adjuster.increase(ONE, 2).unwrap();
    assert_eq!(adjuster.decrease(ONE, 2).unwrap().quantity(), 0);

    adjuster.increase(ONE, 5).unwrap();
    assert_eq!(waiter.join().unwrap().unwrap().quantity(), 0);
}

#[test]
fn per_key_writes_on_different_ids_overlap() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(20)));
    store.insert(ONE, 0).unwrap();
    store.insert(TWO, 0).unwrap();
    let adjuster = Arc::new(PerKeyMutexAdjuster::new(store.clone()));

    let workers: Vec<_> = [ONE, TWO]
        .into_iter()
        .map(|id| {
            let adjuster = adjuster.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    adjuster.increase(id, 1).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(store.max_in_flight(), 2);
    assert_eq!(quantity(&*store, 1), 10);
    assert_eq!(quantity(&*store, 2), 10);
}

#[test]
fn coarse_serializes_different_ids() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(10)));
    store.insert(ONE, 0).unwrap();
    store.insert(TWO, 0).unwrap();
    let adjuster = Arc::new(CoarseMutexAdjuster::new(store.clone()));

    let started = Instant::now();
    let workers: Vec<_> = [ONE, TWO]
        .into_iter()
        .map(|id| {
            let adjuster = adjuster.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    adjuster.increase(id, 1).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(store.max_in_flight(), 1);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(quantity(&*store, 1), 5);
    assert_eq!(quantity(&*store, 2), 5);
}

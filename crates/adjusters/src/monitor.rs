//! Wait/signal protocol shared by the in-process mutex adjusters.
//!
//! A [`Monitor`] is a mutex plus one condition variable. While it holds the
//! mutex a caller reads the record **fresh from the store**, and a decrease
//! that finds too little stock parks on the condition instead of failing.
//! Every wake re-reads the store before re-checking, so a snapshot taken
//! before waiting is never reused. An increase writes and then signals.
//!
//! Every write that leaves stock behind advances the monitor's `epoch`. Under
//! [`WakePolicy::One`] a woken waiter that sees a new epoch but still cannot
//! proceed (it wants more than is there, or it is parked on another id of a
//! shared monitor) wakes all other waiters before parking again, so the signal
//! is never swallowed. Each waiter forwards at most once per epoch.
//!
//! ```text
//!            lock              short stock
//!   Idle ──────────▶ HoldingLock ──────────▶ Waiting
//!    ▲                  │   ▲                   │
//!    └──── unlock ──────┘   └── signal/timeout ─┘
//! ```

use std::sync::{Condvar, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use tracing::debug;

use stockguard_core::{Amount, StockId};
use stockguard_infra::StockStore;
use stockguard_inventory::StockRecord;

use crate::error::{AdjustError, AdjustResult};

/// How many parked decreases an increase wakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakePolicy {
    /// Wake one waiter. A waiter that succeeds and leaves stock behind passes
    /// the signal on to the next one; a waiter that cannot use it wakes the rest.
    #[default]
    One,
    /// Wake every waiter; each re-checks against the store.
    All,
}

/// Observable phase of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    /// Nobody holds the mutex and nobody is parked.
    Idle,
    /// Some caller holds the mutex.
    HoldingLock,
    /// The mutex is free but decreases are parked on the condition.
    Waiting,
}

/// Per-monitor memory of the last record seen under the mutex.
pub(crate) trait SlotCache: Default + Send {
    fn remember(&mut self, record: &StockRecord);
}

impl SlotCache for () {
    fn remember(&mut self, _record: &StockRecord) {}
}

impl SlotCache for Option<StockRecord> {
    fn remember(&mut self, record: &StockRecord) {
        *self = Some(record.clone());
    }
}

#[derive(Debug, Default)]
pub(crate) struct MonitorState<C> {
    pub(crate) waiters: usize,
    /// Count of writes that left stock behind.
    pub(crate) epoch: u64,
    pub(crate) cache: C,
}

#[derive(Debug, Default)]
pub(crate) struct Monitor<C> {
    state: Mutex<MonitorState<C>>,
    changed: Condvar,
}

impl<C: SlotCache> Monitor<C> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> AdjustResult<MutexGuard<'_, MonitorState<C>>> {
        self.state
            .lock()
            .map_err(|_| AdjustError::poisoned("stock monitor"))
    }

    pub(crate) fn phase(&self) -> AdjustResult<SlotPhase> {
        match self.state.try_lock() {
            Ok(state) if state.waiters > 0 => Ok(SlotPhase::Waiting),
            Ok(_) => Ok(SlotPhase::Idle),
            Err(TryLockError::WouldBlock) => Ok(SlotPhase::HoldingLock),
            Err(TryLockError::Poisoned(_)) => Err(AdjustError::poisoned("stock monitor")),
        }
    }

    /// Decrease `id` by `amount`, parking while the store shows too little.
    ///
    /// With `timeout` set, gives up with [`AdjustError::Timeout`] once that
    /// much time has passed without enough stock appearing.
    pub(crate) fn decrease<S: StockStore + ?Sized>(
        &self,
        store: &S,
        id: StockId,
        amount: Amount,
        timeout: Option<Duration>,
        wake: WakePolicy,
    ) -> AdjustResult<StockRecord> {
        let started = Instant::now();
        let mut state = self.lock()?;

        let mut record = store.get(id)?;
        state.cache.remember(&record);
        let mut seen = state.epoch;

        while !record.can_decrease(amount) {
            let remaining = match timeout {
                None => None,
                Some(timeout) => {
                    let remaining = timeout.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        return Err(AdjustError::Timeout {
                            id,
                            waited: started.elapsed(),
                        });
                    }
                    Some(remaining)
                }
            };

            debug!(%id, requested = amount.get(), available = record.quantity(), "short stock, waiting");
            state.waiters += 1;
            state = match remaining {
                None => self
                    .changed
                    .wait(state)
                    .map_err(|_| AdjustError::poisoned("stock monitor"))?,
                Some(remaining) => {
                    self.changed
                        .wait_timeout(state, remaining)
                        .map_err(|_| AdjustError::poisoned("stock monitor"))?
                        .0
                }
            };
            state.waiters -= 1;

            let fresh = state.epoch != seen;
            seen = state.epoch;
            let reread = store.get(id);
            let usable = matches!(&reread, Ok(current) if current.can_decrease(amount));
            if fresh && !usable && wake == WakePolicy::One && state.waiters > 0 {
                debug!(%id, waiters = state.waiters, "signal not usable here, waking the rest");
                self.changed.notify_all();
            }

            record = reread?;
            state.cache.remember(&record);
        }

        let quantity = record
            .decreased(amount)
            .map_err(|e| AdjustError::from_domain(id, e))?;
        let committed = store.write(id, quantity)?;
        state.cache.remember(&committed);

        if committed.quantity() > 0 {
            state.epoch += 1;
            if wake == WakePolicy::One && state.waiters > 0 {
                self.changed.notify_one();
            }
        }
        Ok(committed)
    }

    /// Increase `id` by `amount` and wake parked decreases.
    pub(crate) fn increase<S: StockStore + ?Sized>(
        &self,
        store: &S,
        id: StockId,
        amount: Amount,
        wake: WakePolicy,
    ) -> AdjustResult<StockRecord> {
        let mut state = self.lock()?;

        let record = store.get(id)?;
        let quantity = record
            .increased(amount)
            .map_err(|e| AdjustError::from_domain(id, e))?;
        let committed = store.write(id, quantity)?;
        state.cache.remember(&committed);
        state.epoch += 1;

        match wake {
            WakePolicy::One => self.changed.notify_one(),
            WakePolicy::All => self.changed.notify_all(),
        }
        Ok(committed)
    }
}

//! Blocking table of exclusively-held integer keys.
//!
//! Backs the in-memory row leases of [`crate::store::InMemoryStockStore`] and
//! the in-memory [`crate::advisory_lock::InMemoryAdvisoryLock`]. A key is either
//! absent (free) or mapped to the thread that acquired it; waiters park on a
//! single condition variable and re-check their own key on every wake.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crate::advisory_lock::LockError;

#[derive(Debug, Default)]
pub struct KeyedLockTable {
    held: Mutex<HashMap<i64, ThreadId>>,
    released: Condvar,
}

impl KeyedLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, HashMap<i64, ThreadId>>, LockError> {
        self.held
            .lock()
            .map_err(|_| LockError::Poisoned("keyed lock table".to_string()))
    }

    /// Block until `key` is free, then take it for the current thread.
    pub fn acquire(&self, key: i64) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut held = self.state()?;
        loop {
            match held.get(&key) {
                None => {
                    held.insert(key, me);
                    return Ok(());
                }
                Some(owner) if *owner == me => return Err(LockError::Reentrant { key }),
                Some(_) => {
                    held = self
                        .released
                        .wait(held)
                        .map_err(|_| LockError::Poisoned("keyed lock table".to_string()))?;
                }
            }
        }
    }

    /// Free `key` and wake every parked acquirer.
    ///
    /// Release does not check the calling thread: a holder may hand its guard to
    /// another thread before dropping it.
    pub fn release(&self, key: i64) -> Result<(), LockError> {
        let mut held = self.state()?;
        if held.remove(&key).is_none() {
            return Err(LockError::NotHeld { key });
        }
        drop(held);
        self.released.notify_all();
        Ok(())
    }

    pub fn is_held(&self, key: i64) -> bool {
        self.state().map(|held| held.contains_key(&key)).unwrap_or(false)
    }
}

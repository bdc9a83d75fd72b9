use tracing::debug;

use super::r#trait::{AdvisoryLock, LockError};
use crate::lock_table::KeyedLockTable;

/// In-process advisory lock.
///
/// Intended for tests/dev and single-process deployments: it excludes threads
/// sharing this value, not independent processes.
#[derive(Debug, Default)]
pub struct InMemoryAdvisoryLock {
    table: KeyedLockTable,
}

impl InMemoryAdvisoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: i64) -> bool {
        self.table.is_held(key)
    }
}

impl AdvisoryLock for InMemoryAdvisoryLock {
    fn acquire(&self, key: i64) -> Result<(), LockError> {
        self.table.acquire(key)?;
        debug!(key, "advisory lock acquired");
        Ok(())
    }

    fn release(&self, key: i64) -> Result<(), LockError> {
        self.table.release(key)?;
        debug!(key, "advisory lock released");
        Ok(())
    }
}

use thiserror::Error;

/// Advisory lock operation error.
///
/// ## Error Categories
///
/// - **Reentrant**: the caller already holds the key (nested acquisition would deadlock)
/// - **NotHeld**: release of a key this lock does not hold
/// - **Poisoned**: an in-process coordination lock was poisoned by a panic
/// - **Backend**: the shared store (Postgres, Redis) failed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("lock {key} is already held by the current thread")]
    Reentrant { key: i64 },

    #[error("lock {key} is not held")]
    NotHeld { key: i64 },

    #[error("lock state poisoned: {0}")]
    Poisoned(String),

    #[error("lock backend error: {0}")]
    Backend(String),
}

/// A named mutual-exclusion primitive keyed by an integer.
///
/// Implementations backed by a shared store (Postgres, Redis) exclude holders
/// across processes; the in-memory implementation only within one process.
///
/// Acquisition is **not** reentrant: acquiring a key the caller already holds
/// fails with [`LockError::Reentrant`] where the backend can detect it.
pub trait AdvisoryLock: Send + Sync {
    /// Block until `key` is granted to the caller.
    fn acquire(&self, key: i64) -> Result<(), LockError>;

    /// Release `key`.
    fn release(&self, key: i64) -> Result<(), LockError>;
}

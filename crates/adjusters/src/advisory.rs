//! Named-lock decorator.
//!
//! Wraps another [`StockAdjuster`] so every operation runs inside the advisory
//! lock for `id.lock_key()`. The lock is released after every attempt,
//! including failed and panicking ones, and transient failures of the wrapped
//! adjuster are retried under the configured [`RetryPolicy`].
//!
//! ```text
//! loop {
//!     acquire(key)
//!     outcome = inner.op(id, n)
//!     release(key)
//!     transient and policy allows? sleep, retry : return outcome
//! }
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{error, instrument, warn};

use stockguard_core::StockId;
use stockguard_infra::AdvisoryLock;
use stockguard_inventory::StockRecord;

use crate::adjuster::StockAdjuster;
use crate::error::{AdjustError, AdjustResult};
use crate::retry::RetryPolicy;

/// Release-on-drop handle for one advisory acquisition.
struct HeldLock<'a, L: AdvisoryLock + ?Sized> {
    locks: &'a L,
    key: i64,
    released: bool,
}

impl<'a, L: AdvisoryLock + ?Sized> HeldLock<'a, L> {
    fn acquire(locks: &'a L, key: i64) -> AdjustResult<Self> {
        locks.acquire(key)?;
        Ok(Self {
            locks,
            key,
            released: false,
        })
    }

    fn release(mut self) {
        self.released = true;
        self.unlock();
    }

    fn unlock(&self) {
        // The wrapped operation has already committed or failed; a release
        // failure must not be reported as its outcome.
        if let Err(err) = self.locks.release(self.key) {
            error!(key = self.key, error = %err, "failed to release advisory lock");
        }
    }
}

impl<L: AdvisoryLock + ?Sized> Drop for HeldLock<'_, L> {
    fn drop(&mut self) {
        if !self.released {
            self.unlock();
        }
    }
}

#[derive(Debug)]
pub struct AdvisoryLockAdjuster<A, L> {
    inner: A,
    locks: Arc<L>,
    policy: RetryPolicy,
}

impl<A: StockAdjuster, L: AdvisoryLock> AdvisoryLockAdjuster<A, L> {
    /// Decorate `inner` with the default policy (unbounded, fixed 50ms).
    pub fn new(inner: A, locks: Arc<L>) -> Self {
        Self::with_policy(inner, locks, RetryPolicy::default())
    }

    pub fn with_policy(inner: A, locks: Arc<L>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            locks,
            policy,
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn run(
        &self,
        id: StockId,
        op: impl Fn(&A) -> AdjustResult<StockRecord>,
    ) -> AdjustResult<StockRecord> {
        let started = Instant::now();
        let mut retries = 0u32;

        loop {
            let held = HeldLock::acquire(&*self.locks, id.lock_key())?;
            let outcome = op(&self.inner);
            held.release();

            let err = match outcome {
                Err(err) if err.is_transient() => err,
                other => return other,
            };

            if !self.policy.should_retry(retries) {
                return Err(AdjustError::RetriesExhausted {
                    id,
                    attempts: retries + 1,
                    last: Box::new(err),
                });
            }

            retries += 1;
            let delay = self.policy.delay_for_attempt(retries);
            if self.policy.past_deadline(started.elapsed(), delay) {
                return Err(AdjustError::Timeout {
                    id,
                    waited: started.elapsed(),
                });
            }

            warn!(%id, retry = retries, delay_ms = delay.as_millis() as u64, error = %err, "transient failure, retrying");
            thread::sleep(delay);
        }
    }
}

impl<A: StockAdjuster, L: AdvisoryLock> StockAdjuster for AdvisoryLockAdjuster<A, L> {
    #[instrument(skip(self), err)]
    fn decrease(&self, id: StockId, amount: u64) -> AdjustResult<StockRecord> {
        self.run(id, |inner| inner.decrease(id, amount))
    }

    #[instrument(skip(self), err)]
    fn increase(&self, id: StockId, amount: u64) -> AdjustResult<StockRecord> {
        self.run(id, |inner| inner.increase(id, amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use stockguard_infra::InMemoryAdvisoryLock;

    /// Fails with a version conflict `conflicts` times, then succeeds.
    struct Flaky {
        conflicts: u32,
        calls: AtomicU32,
        locks: Arc<InMemoryAdvisoryLock>,
    }

    impl Flaky {
        fn new(conflicts: u32, locks: Arc<InMemoryAdvisoryLock>) -> Self {
            Self {
                conflicts,
                calls: AtomicU32::new(0),
                locks,
            }
        }

        fn call(&self, id: StockId) -> AdjustResult<StockRecord> {
            assert!(self.locks.is_held(id.lock_key()), "called outside the lock");
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.conflicts {
                return Err(AdjustError::VersionConflict {
                    id,
                    expected: n as u64,
                    actual: n as u64 + 1,
                });
            }
            Ok(StockRecord::seeded(id, 0, Utc::now()))
        }
    }

    impl StockAdjuster for Flaky {
        fn decrease(&self, id: StockId, _amount: u64) -> AdjustResult<StockRecord> {
            self.call(id)
        }

        fn increase(&self, id: StockId, _amount: u64) -> AdjustResult<StockRecord> {
            self.call(id)
        }
    }

    struct Failing;

    impl StockAdjuster for Failing {
        fn decrease(&self, id: StockId, amount: u64) -> AdjustResult<StockRecord> {
            Err(AdjustError::InsufficientQuantity {
                id,
                requested: amount,
                available: 0,
            })
        }

        fn increase(&self, _id: StockId, _amount: u64) -> AdjustResult<StockRecord> {
            panic!("boom");
        }
    }

    fn quick(max_retries: u32) -> RetryPolicy {
        RetryPolicy::fixed(max_retries, Duration::from_millis(1))
    }

    #[test]
    fn transient_failures_are_retried_until_success() {
        let locks = Arc::new(InMemoryAdvisoryLock::new());
        let adjuster =
            AdvisoryLockAdjuster::with_policy(Flaky::new(3, locks.clone()), locks.clone(), quick(5));
        let id = StockId::new(7);

        adjuster.decrease(id, 1).unwrap();
        assert_eq!(adjuster.inner().calls.load(Ordering::SeqCst), 4);
        assert!(!locks.is_held(id.lock_key()));
    }

    #[test]
    fn bounded_policy_reports_exhaustion() {
        let locks = Arc::new(InMemoryAdvisoryLock::new());
        let adjuster = AdvisoryLockAdjuster::with_policy(
            Flaky::new(u32::MAX, locks.clone()),
            locks.clone(),
            quick(2),
        );
        let id = StockId::new(7);

        match adjuster.decrease(id, 1).unwrap_err() {
            AdjustError::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(last.is_transient());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(adjuster.inner().calls.load(Ordering::SeqCst), 3);
        assert!(!locks.is_held(id.lock_key()));
    }

    #[test]
    fn deadline_stops_retrying() {
        let locks = Arc::new(InMemoryAdvisoryLock::new());
        let policy = RetryPolicy::unbounded(Duration::from_millis(20))
            .with_deadline(Duration::from_millis(50));
        let adjuster =
            AdvisoryLockAdjuster::with_policy(Flaky::new(u32::MAX, locks.clone()), locks.clone(), policy);

        assert!(matches!(
            adjuster.increase(StockId::new(1), 1),
            Err(AdjustError::Timeout { .. })
        ));
        assert!(adjuster.inner().calls.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn non_transient_errors_return_immediately_and_release() {
        let locks = Arc::new(InMemoryAdvisoryLock::new());
        let adjuster = AdvisoryLockAdjuster::new(Failing, locks.clone());
        let id = StockId::new(3);

        assert!(matches!(
            adjuster.decrease(id, 5),
            Err(AdjustError::InsufficientQuantity { requested: 5, .. })
        ));
        assert!(!locks.is_held(id.lock_key()));
    }

    #[test]
    fn panicking_operation_still_releases() {
        let locks = Arc::new(InMemoryAdvisoryLock::new());
        let adjuster = AdvisoryLockAdjuster::new(Failing, locks.clone());
        let id = StockId::new(3);

        let result = catch_unwind(AssertUnwindSafe(|| adjuster.increase(id, 1)));
        assert!(result.is_err());
        assert!(!locks.is_held(id.lock_key()));
    }
}

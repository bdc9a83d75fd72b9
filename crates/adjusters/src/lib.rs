//! Concurrency-controlled stock adjustment strategies.
//!
//! Every strategy implements [`StockAdjuster`] and preserves the same
//! invariant: each successful `decrease(id, n)` lowers the persisted quantity
//! by exactly `n`, each successful `increase(id, n)` raises it by exactly `n`,
//! and the quantity never goes negative. They differ in where the mutual
//! exclusion lives and in what a caller sees when stock is short:
//!
//! | Strategy | Exclusion | Short stock |
//! |----------|-----------|-------------|
//! | [`PessimisticAdjuster`] | store row lease | error |
//! | [`OptimisticAdjuster`] | version check at write | error |
//! | [`AdvisoryLockAdjuster`] | named lock around a wrapped strategy | whatever the wrapped strategy does |
//! | [`CoarseMutexAdjuster`] | one process-wide mutex | block until replenished |
//! | [`PerKeyMutexAdjuster`] | one mutex per stock id | block until replenished |

pub mod adjuster;
pub mod advisory;
pub mod coarse;
pub mod error;
pub mod optimistic;
pub mod per_key;
pub mod pessimistic;
pub mod retry;

mod monitor;

pub use adjuster::StockAdjuster;
pub use advisory::AdvisoryLockAdjuster;
pub use coarse::CoarseMutexAdjuster;
pub use error::{AdjustError, AdjustResult};
pub use monitor::{SlotPhase, WakePolicy};
pub use optimistic::{OptimisticAdjuster, PendingWrite};
pub use per_key::PerKeyMutexAdjuster;
pub use pessimistic::PessimisticAdjuster;
pub use retry::{BackoffStrategy, RetryPolicy};

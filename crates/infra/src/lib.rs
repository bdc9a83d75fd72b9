//! Infrastructure layer: stores, advisory locks, config.

pub mod advisory_lock;
pub mod config;
pub mod lock_table;
pub mod store;

pub use advisory_lock::{AdvisoryLock, InMemoryAdvisoryLock, LockError, PostgresAdvisoryLock};
pub use config::{ConfigError, InfraConfig};
pub use store::{InMemoryStockStore, PostgresStockStore, RowLease, StockStore, StoreError, StoreResult};

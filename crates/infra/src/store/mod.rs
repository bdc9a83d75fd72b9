//! Stock record store boundary.
//!
//! The store is an external collaborator of the adjustment strategies: it owns
//! the durable copy of each record and offers plain reads, exclusive (row-locked)
//! reads, unconditional writes and version-checked writes.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryLease, InMemoryStockStore};
pub use postgres::{PostgresLease, PostgresStockStore};
pub use r#trait::{RowLease, StockStore, StoreError, StoreResult};

//! Inventory domain module.
//!
//! This crate contains the stock record and its business rules, implemented
//! purely as deterministic domain logic (no IO, no locking, no storage).

pub mod stock;

pub use stock::StockRecord;

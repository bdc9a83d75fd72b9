//! Named, integer-keyed advisory locks.
//!
//! The lock carries no business data: it only serializes holders of the same
//! key. Store-backed implementations (Postgres, Redis) serialize across
//! processes; the in-memory one within a process.

pub mod in_memory;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;
pub mod r#trait;

pub use in_memory::InMemoryAdvisoryLock;
pub use postgres::PostgresAdvisoryLock;
#[cfg(feature = "redis")]
pub use redis::RedisAdvisoryLock;
pub use r#trait::{AdvisoryLock, LockError};

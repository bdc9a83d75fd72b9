//! Postgres-backed stock store.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS stock (
//!     id         BIGINT PRIMARY KEY,
//!     quantity   BIGINT NOT NULL CHECK (quantity >= 0),
//!     version    BIGINT NOT NULL DEFAULT 0,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```
//!
//! ## Locking
//!
//! - `get_for_exclusive_read` opens a transaction and runs `SELECT … FOR UPDATE`;
//!   the row lock is held until the lease commits (or rolls back on drop).
//! - `write_if_version` is a single `UPDATE … WHERE id = $1 AND version = $2`;
//!   zero affected rows means the version moved (or the row is gone).
//! - Every write sets `version = version + 1`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database (unique violation `23505`) on insert | `AlreadyExists` |
//! | Database (check violation `23514`) | `Backend` (negative quantity rejected by the schema) |
//! | anything else | `Backend` |
//!
//! ## Thread Safety
//!
//! The store is `Send + Sync`. Its synchronous trait methods block the calling
//! thread on the runtime `Handle` given at construction, so they must be called
//! from plain threads, never from inside an async task. Pooled connections are
//! only ever dropped with that runtime entered.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

use stockguard_core::{AggregateRoot, ExpectedVersion, StockId};
use stockguard_inventory::StockRecord;

use super::r#trait::{RowLease, StockStore, StoreError, StoreResult};
use crate::config::InfraConfig;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS stock (
        id         BIGINT PRIMARY KEY,
        quantity   BIGINT NOT NULL CHECK (quantity >= 0),
        version    BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

#[derive(Debug, Clone)]
pub struct PostgresStockStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresStockStore {
    /// `handle` must belong to a multi-threaded runtime that outlives the store.
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Connect using `DATABASE_URL` and the configured pool size.
    pub fn connect(config: &InfraConfig, handle: Handle) -> StoreResult<Self> {
        let url = config
            .require_database_url()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let pool = handle
            .block_on(
                PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect(url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self::new(pool, handle))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `stock` table if it does not exist.
    pub fn ensure_schema(&self) -> StoreResult<()> {
        self.handle
            .block_on(sqlx::query(SCHEMA).execute(&self.pool))
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch(&self, id: StockId) -> StoreResult<StockRecord> {
        let row = sqlx::query("SELECT id, quantity, version, updated_at FROM stock WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref()
            .map(record_from_row)
            .transpose()?
            .ok_or(StoreError::NotFound(id))
    }

    async fn update(
        &self,
        id: StockId,
        quantity: u64,
        expected: ExpectedVersion,
    ) -> StoreResult<StockRecord> {
        let quantity = to_column(quantity)?;
        let row = match expected {
            ExpectedVersion::Any => {
                sqlx::query(
                    r#"
                    UPDATE stock
                    SET quantity = $2, version = version + 1, updated_at = NOW()
                    WHERE id = $1
                    RETURNING id, quantity, version, updated_at
                    "#,
                )
                .bind(id.get())
                .bind(quantity)
                .fetch_optional(&self.pool)
                .await
            }
            ExpectedVersion::Exact(version) => {
                sqlx::query(
                    r#"
                    UPDATE stock
                    SET quantity = $2, version = version + 1, updated_at = NOW()
                    WHERE id = $1 AND version = $3
                    RETURNING id, quantity, version, updated_at
                    "#,
                )
                .bind(id.get())
                .bind(quantity)
                .bind(to_column(version)?)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(|e| map_sqlx_error("write", e))?;

        match row {
            Some(row) => record_from_row(&row),
            // Nothing matched: either the row is gone or the version moved.
            None => {
                let current = self.fetch(id).await?;
                Err(StoreError::Conflict {
                    id,
                    expected,
                    actual: current.version(),
                })
            }
        }
    }

    async fn lock_row(&self, id: StockId) -> StoreResult<PostgresLease> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let row = sqlx::query(
            "SELECT id, quantity, version, updated_at FROM stock WHERE id = $1 FOR UPDATE",
        )
        .bind(id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("select_for_update", e))?;

        let record = row
            .as_ref()
            .map(record_from_row)
            .transpose()?
            .ok_or(StoreError::NotFound(id))?;

        Ok(PostgresLease {
            tx: Some(tx),
            handle: self.handle.clone(),
            record,
        })
    }
}

impl StockStore for PostgresStockStore {
    type Lease<'a>
        = PostgresLease
    where
        Self: 'a;

    #[instrument(skip(self), err)]
    fn insert(&self, id: StockId, quantity: u64) -> StoreResult<StockRecord> {
        let row = self
            .handle
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO stock (id, quantity, version, updated_at)
                    VALUES ($1, $2, 0, NOW())
                    RETURNING id, quantity, version, updated_at
                    "#,
                )
                .bind(id.get())
                .bind(to_column(quantity)?)
                .fetch_one(&self.pool),
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::AlreadyExists(id)
                } else {
                    map_sqlx_error("insert", e)
                }
            })?;
        record_from_row(&row)
    }

    fn get(&self, id: StockId) -> StoreResult<StockRecord> {
        self.handle.block_on(self.fetch(id))
    }

    #[instrument(skip(self), err)]
    fn get_for_exclusive_read(&self, id: StockId) -> StoreResult<Self::Lease<'_>> {
        let lease = self.handle.block_on(self.lock_row(id))?;
        debug!(%id, version = lease.record.version(), "row lease granted");
        Ok(lease)
    }

    #[instrument(skip(self), err)]
    fn write(&self, id: StockId, quantity: u64) -> StoreResult<StockRecord> {
        self.handle
            .block_on(self.update(id, quantity, ExpectedVersion::Any))
    }

    #[instrument(skip(self), err)]
    fn write_if_version(
        &self,
        id: StockId,
        quantity: u64,
        expected: ExpectedVersion,
    ) -> StoreResult<StockRecord> {
        self.handle.block_on(self.update(id, quantity, expected))
    }

    fn clear(&self) -> StoreResult<()> {
        self.handle
            .block_on(sqlx::query("DELETE FROM stock").execute(&self.pool))
            .map_err(|e| map_sqlx_error("clear", e))?;
        Ok(())
    }
}

/// `SELECT … FOR UPDATE` held inside an open transaction.
///
/// Dropping the lease without [`commit`](RowLease::commit) rolls the
/// transaction back, which also releases the row lock.
pub struct PostgresLease {
    tx: Option<Transaction<'static, Postgres>>,
    handle: Handle,
    record: StockRecord,
}

impl std::fmt::Debug for PostgresLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresLease")
            .field("open", &self.tx.is_some())
            .field("record", &self.record)
            .finish()
    }
}

impl RowLease for PostgresLease {
    fn record(&self) -> &StockRecord {
        &self.record
    }

    fn write(&mut self, quantity: u64) -> StoreResult<&StockRecord> {
        let id = self.record.id_typed();
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| StoreError::Backend("lease already finished".to_string()))?;

        let row = self
            .handle
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE stock
                    SET quantity = $2, version = version + 1, updated_at = NOW()
                    WHERE id = $1
                    RETURNING id, quantity, version, updated_at
                    "#,
                )
                .bind(id.get())
                .bind(to_column(quantity)?)
                .fetch_one(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("lease_write", e))?;

        self.record = record_from_row(&row)?;
        Ok(&self.record)
    }

    fn commit(mut self) -> StoreResult<StockRecord> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::Backend("lease already finished".to_string()))?;
        self.handle
            .block_on(tx.commit())
            .map_err(|e| map_sqlx_error("commit", e))?;
        debug!(id = %self.record.id_typed(), "row lease committed");
        Ok(self.record.clone())
    }
}

impl Drop for PostgresLease {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _runtime = self.handle.enter();
            if let Err(err) = self.handle.block_on(tx.rollback()) {
                warn!(id = %self.record.id_typed(), error = %err, "row lease rollback failed");
            }
        }
    }
}

fn record_from_row(row: &PgRow) -> StoreResult<StockRecord> {
    let decode = |e: sqlx::Error| StoreError::Backend(format!("failed to decode stock row: {e}"));

    let id: i64 = row.try_get("id").map_err(decode)?;
    let quantity: i64 = row.try_get("quantity").map_err(decode)?;
    let version: i64 = row.try_get("version").map_err(decode)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(decode)?;

    Ok(StockRecord::from_parts(
        StockId::new(id),
        from_column(quantity, "quantity")?,
        from_column(version, "version")?,
        updated_at,
    ))
}

fn to_column(value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Backend(format!("{value} exceeds BIGINT range")))
}

fn from_column(value: i64, column: &str) -> StoreResult<u64> {
    u64::try_from(value)
        .map_err(|_| StoreError::Backend(format!("negative {column} in stock row: {value}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolClosed => StoreError::Backend(format!("{operation}: connection pool closed")),
        other => StoreError::Backend(format!("{operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

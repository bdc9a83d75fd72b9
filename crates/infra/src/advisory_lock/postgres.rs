//! Postgres session-level advisory locks.
//!
//! `pg_advisory_lock` is scoped to the database session that took it, so each
//! acquisition checks a connection out of the pool and parks it in `sessions`
//! until the matching release unlocks on that same connection. The lock is
//! visible to every process connected to the same database.
//!
//! A session whose unlock fails, or that is still held when the lock is
//! dropped, is closed rather than returned to the pool.
//!
//! Callers block inside Postgres while another session holds the key, which
//! keeps one pooled connection busy per blocked caller: size the pool for the
//! expected number of concurrent lockers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

use super::r#trait::{AdvisoryLock, LockError};

struct Session {
    conn: PoolConnection<Postgres>,
    owner: ThreadId,
}

/// Advisory lock backed by `pg_advisory_lock` / `pg_advisory_unlock`.
pub struct PostgresAdvisoryLock {
    pool: PgPool,
    handle: Handle,
    sessions: Mutex<HashMap<i64, Session>>,
}

impl std::fmt::Debug for PostgresAdvisoryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresAdvisoryLock")
            .field("held", &self.sessions().map(|s| s.len()).unwrap_or(0))
            .finish()
    }
}

impl PostgresAdvisoryLock {
    /// `handle` must belong to a multi-threaded runtime that outlives this value;
    /// calls block the current (non-async) thread on it.
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool,
            handle,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> Result<MutexGuard<'_, HashMap<i64, Session>>, LockError> {
        self.sessions
            .lock()
            .map_err(|_| LockError::Poisoned("advisory sessions".to_string()))
    }
}

impl AdvisoryLock for PostgresAdvisoryLock {
    #[instrument(skip(self), err)]
    fn acquire(&self, key: i64) -> Result<(), LockError> {
        let _runtime = self.handle.enter();
        let me = thread::current().id();
        if let Some(session) = self.sessions()?.get(&key) {
            if session.owner == me {
                return Err(LockError::Reentrant { key });
            }
        }

        let mut conn = self
            .handle
            .block_on(self.pool.acquire())
            .map_err(|e| map_sqlx_error("acquire connection", e))?;

        self.handle
            .block_on(
                sqlx::query("SELECT pg_advisory_lock($1)")
                    .bind(key)
                    .execute(&mut *conn),
            )
            .map_err(|e| map_sqlx_error("pg_advisory_lock", e))?;

        debug!(key, "postgres advisory lock acquired");
        self.sessions()?.insert(key, Session { conn, owner: me });
        Ok(())
    }

    #[instrument(skip(self), err)]
    fn release(&self, key: i64) -> Result<(), LockError> {
        let _runtime = self.handle.enter();
        let mut session = self
            .sessions()?
            .remove(&key)
            .ok_or(LockError::NotHeld { key })?;

        let unlocked = self.handle.block_on(async {
            let row = sqlx::query("SELECT pg_advisory_unlock($1) AS unlocked")
                .bind(key)
                .fetch_one(&mut *session.conn)
                .await?;
            row.try_get::<bool, _>("unlocked")
        });

        match unlocked {
            Ok(true) => {
                debug!(key, "postgres advisory lock released");
                Ok(())
            }
            Ok(false) => {
                warn!(key, "postgres session did not hold the advisory lock");
                self.discard(key, session.conn);
                Err(LockError::NotHeld { key })
            }
            Err(err) => {
                self.discard(key, session.conn);
                Err(map_sqlx_error("pg_advisory_unlock", err))
            }
        }
    }
}

impl PostgresAdvisoryLock {
    /// Close a session instead of returning it to the pool, so any lock it
    /// may still hold dies with it.
    fn discard(&self, key: i64, conn: PoolConnection<Postgres>) {
        if let Err(err) = self.handle.block_on(conn.close()) {
            warn!(key, error = %err, "failed to close advisory lock session");
        }
    }
}

impl Drop for PostgresAdvisoryLock {
    fn drop(&mut self) {
        // Closing a pooled connection spawns onto the runtime.
        let _runtime = self.handle.enter();
        if let Ok(sessions) = self.sessions.get_mut() {
            if !sessions.is_empty() {
                warn!(held = sessions.len(), "dropping advisory lock with held sessions");
            }
            for (_, mut session) in sessions.drain() {
                session.conn.close_on_drop();
            }
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LockError {
    LockError::Backend(format!("{operation}: {err}"))
}

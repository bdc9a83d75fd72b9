//! Redis-backed advisory lock (optional).
//!
//! Acquisition is `SET lock:<key> <token> NX PX <ttl>` polled until it succeeds;
//! release deletes the key only if it still carries our token. The TTL is a
//! lease: a holder that stalls longer than `ttl` loses exclusivity.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::r#trait::{AdvisoryLock, LockError};
use crate::config::InfraConfig;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

#[derive(Debug)]
struct Held {
    token: String,
    owner: ThreadId,
}

#[derive(Debug)]
pub struct RedisAdvisoryLock {
    client: redis::Client,
    ttl: Duration,
    poll_interval: Duration,
    held: Mutex<HashMap<i64, Held>>,
}

impl RedisAdvisoryLock {
    pub fn new(
        redis_url: impl AsRef<str>,
        ttl: Duration,
        poll_interval: Duration,
    ) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            ttl,
            poll_interval,
            held: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &InfraConfig) -> Result<Self, LockError> {
        let url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| LockError::Backend("REDIS_URL is not configured".to_string()))?;
        Self::new(url, config.lock_ttl, config.lock_poll_interval)
    }

    fn held(&self) -> Result<MutexGuard<'_, HashMap<i64, Held>>, LockError> {
        self.held
            .lock()
            .map_err(|_| LockError::Poisoned("redis lock tokens".to_string()))
    }

    fn lock_key(key: i64) -> String {
        format!("lock:stock:{key}")
    }
}

impl AdvisoryLock for RedisAdvisoryLock {
    #[instrument(skip(self), err)]
    fn acquire(&self, key: i64) -> Result<(), LockError> {
        let me = thread::current().id();
        if let Some(held) = self.held()?.get(&key) {
            if held.owner == me {
                return Err(LockError::Reentrant { key });
            }
        }

        let token = Uuid::now_v7().to_string();
        let lock_key = Self::lock_key(key);
        let ttl_ms = self.ttl.as_millis() as u64;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| LockError::Backend(e.to_string()))?;

        loop {
            let result: Option<String> = redis::cmd("SET")
                .arg(&lock_key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query(&mut conn)
                .map_err(|e| LockError::Backend(e.to_string()))?;

            if result.is_some() {
                break;
            }
            thread::sleep(self.poll_interval);
        }

        debug!(key, "redis advisory lock acquired");
        self.held()?.insert(key, Held { token, owner: me });
        Ok(())
    }

    #[instrument(skip(self), err)]
    fn release(&self, key: i64) -> Result<(), LockError> {
        let held = self.held()?.remove(&key).ok_or(LockError::NotHeld { key })?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| LockError::Backend(e.to_string()))?;

        let deleted: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::lock_key(key))
            .arg(&held.token)
            .invoke(&mut conn)
            .map_err(|e| LockError::Backend(e.to_string()))?;

        if deleted == 0 {
            warn!(key, "redis lock expired or was taken over before release");
            return Err(LockError::NotHeld { key });
        }

        debug!(key, "redis advisory lock released");
        Ok(())
    }
}

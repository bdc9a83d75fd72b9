//! Configuration loading and representation.
//!
//! Everything is read from the process environment, mirroring how the
//! services are deployed:
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `DATABASE_URL` | unset | Postgres connection string (required for the Postgres store/lock) |
//! | `REDIS_URL` | unset | Redis connection string (required for the Redis lock) |
//! | `STOCKGUARD_DB_MAX_CONNECTIONS` | `10` | Pool size |
//! | `STOCKGUARD_LOCK_TTL_MS` | `30000` | Redis lock lease |
//! | `STOCKGUARD_LOCK_POLL_MS` | `10` | Redis lock poll interval |

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be set")]
    Missing { name: &'static str },

    #[error("{name} is not a valid number: {value}")]
    InvalidNumber { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfraConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub max_connections: u32,
    pub lock_ttl: Duration,
    pub lock_poll_interval: Duration,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            max_connections: 10,
            lock_ttl: Duration::from_secs(30),
            lock_poll_interval: Duration::from_millis(10),
        }
    }
}

impl InfraConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            redis_url: lookup("REDIS_URL").filter(|v| !v.trim().is_empty()),
            max_connections: parse_or(
                &lookup,
                "STOCKGUARD_DB_MAX_CONNECTIONS",
                defaults.max_connections as u64,
            )? as u32,
            lock_ttl: Duration::from_millis(parse_or(
                &lookup,
                "STOCKGUARD_LOCK_TTL_MS",
                defaults.lock_ttl.as_millis() as u64,
            )?),
            lock_poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "STOCKGUARD_LOCK_POLL_MS",
                defaults.lock_poll_interval.as_millis() as u64,
            )?),
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing { name: "DATABASE_URL" })
    }
}

fn parse_or<F>(lookup: &F, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
            name,
            value: raw,
        }),
    }
}

//! Runtime configuration.
//!
//! Layers, lowest precedence first: in-code defaults, optional
//! `config/stockledger.toml`, then `STOCKLEDGER__<SECTION>__<KEY>`
//! environment variables.

use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::LedgerResult;

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    pub database: DatabaseConfig,
    pub lock: LockConfig,
    pub retry: RetryConfig,
    pub outbox: OutboxConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Postgres connection URL
    pub url: String,
    /// Pool size
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    /// Longest wait for a business lock before `LockTimeout`
    pub timeout_ms: u64,
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first
    pub max_attempts: u32,
    /// Delay unit; attempt `n` waits `n * backoff_ms`
    pub backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutboxConfig {
    /// Records claimed per relay pass
    pub batch_size: usize,
    /// Failed deliveries before a record goes `DEAD`
    pub max_attempts: u32,
    /// Sleep between relay passes when idle
    pub poll_interval_ms: u64,
    /// Delay before the first retry of a failed record; doubles per attempt
    pub retry_backoff_ms: u64,
    /// Upper bound for the retry delay
    pub max_backoff_ms: u64,
    /// How long a claimed record stays with its relay before others may reclaim it
    pub lease_ms: u64,
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/stockledger".to_string(),
                max_connections: 10,
            },
            lock: LockConfig { timeout_ms: 5_000 },
            retry: RetryConfig {
                max_attempts: 3,
                backoff_ms: 50,
            },
            outbox: OutboxConfig {
                batch_size: 100,
                max_attempts: 5,
                poll_interval_ms: 1_000,
                retry_backoff_ms: 1_000,
                max_backoff_ms: 300_000,
                lease_ms: 300_000,
            },
        }
    }
}

impl LedgerConfig {
    /// Load from `config/stockledger.toml` and the environment.
    pub fn load() -> LedgerResult<Self> {
        Self::load_from("config/stockledger")
    }

    pub fn load_from(file: &str) -> LedgerResult<Self> {
        let defaults = Self::default();
        let config = Config::builder()
            .set_default("database.url", defaults.database.url)?
            .set_default("database.max_connections", defaults.database.max_connections)?
            .set_default("lock.timeout_ms", defaults.lock.timeout_ms)?
            .set_default("retry.max_attempts", defaults.retry.max_attempts)?
            .set_default("retry.backoff_ms", defaults.retry.backoff_ms)?
            .set_default("outbox.batch_size", defaults.outbox.batch_size as u64)?
            .set_default("outbox.max_attempts", defaults.outbox.max_attempts)?
            .set_default("outbox.poll_interval_ms", defaults.outbox.poll_interval_ms)?
            .set_default("outbox.retry_backoff_ms", defaults.outbox.retry_backoff_ms)?
            .set_default("outbox.max_backoff_ms", defaults.outbox.max_backoff_ms)?
            .set_default("outbox.lease_ms", defaults.outbox.lease_ms)?
            .add_source(File::with_name(file).required(false))
            .add_source(
                Environment::with_prefix("STOCKLEDGER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = LedgerConfig::load_from("does/not/exist").unwrap();
        assert_eq!(config.lock.timeout(), Duration::from_secs(5));
        assert_eq!(config.outbox.batch_size, 100);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.outbox.lease(), Duration::from_secs(300));
        assert!(config.outbox.retry_backoff() <= config.outbox.max_backoff());
    }
}

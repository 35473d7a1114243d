//! Lock configuration for cross-replica exclusion.
//!
//! # Example
//!
//! ```toml
//! enable_db_lock = true
//!
//! [db_lock]
//! lock_ttl = "15s"
//! lock_retry_interval = "5s"
//! db = { type = "postgres", url = "postgres://pruner@db/lock" }
//!
//! # Used only when enable_db_lock is false.
//! [lock]
//! consul_cluster_config = "http://127.0.0.1:8500"
//! lock_ttl = "15s"
//! lock_retry_interval = "5s"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ConfigError, DatabaseConfig};

/// Default name of the lock row / Consul key for this daemon family.
pub const DEFAULT_LOCK_NAME: &str = "pruner";

/// Timing shared by both lock strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTiming {
    /// Interval between acquisition attempts, and between renewal retries
    /// after a transient error.
    pub retry_interval: Duration,
    /// How long a lock stays held without renewal.
    pub ttl: Duration,
    /// Interval between renewals while held. Always shorter than `ttl`.
    pub renew_interval: Duration,
}

impl LockTiming {
    fn new(retry_interval: Duration, ttl: Duration, renew_interval: Option<Duration>) -> Self {
        Self {
            retry_interval,
            ttl,
            renew_interval: renew_interval.unwrap_or(ttl / 3),
        }
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.ttl.is_zero() {
            return Err(ConfigError::Validation(format!(
                "{section}.lock_ttl must be greater than zero"
            )));
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::Validation(format!(
                "{section}.lock_retry_interval must be greater than zero"
            )));
        }
        if self.renew_interval.is_zero() || self.renew_interval >= self.ttl {
            return Err(ConfigError::Validation(format!(
                "{section}.renew_interval must be greater than zero and shorter than lock_ttl"
            )));
        }
        Ok(())
    }
}

/// Table lock configuration (`[db_lock]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DbLockConfig {
    /// Database holding the `pruner_lock` table.
    pub db: DatabaseConfig,

    /// Interval between acquisition attempts.
    /// Default: 5s
    #[serde(default = "default_retry_interval", with = "super::duration")]
    pub lock_retry_interval: Duration,

    /// Lock time-to-live.
    /// Default: 15s
    #[serde(default = "default_ttl", with = "super::duration")]
    pub lock_ttl: Duration,

    /// Renewal cadence while held.
    /// Default: a third of `lock_ttl`
    #[serde(
        default,
        with = "super::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub renew_interval: Option<Duration>,

    /// Row key in the lock table. Daemon families sharing one table must use
    /// distinct names.
    /// Default: "pruner"
    #[serde(default = "default_lock_name")]
    pub lock_name: String,
}

impl DbLockConfig {
    pub fn timing(&self) -> LockTiming {
        LockTiming::new(self.lock_retry_interval, self.lock_ttl, self.renew_interval)
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        self.timing().validate("db_lock")?;
        validate_lock_name("db_lock", &self.lock_name)?;
        self.db.validate()
    }
}

/// Consul lock configuration (`[lock]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsulLockConfig {
    /// Consul HTTP endpoint, e.g. `http://127.0.0.1:8500`.
    /// When absent, the Consul lock is disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consul_cluster_config: Option<String>,

    /// Interval between acquisition attempts.
    /// Default: 5s
    #[serde(default = "default_retry_interval", with = "super::duration")]
    pub lock_retry_interval: Duration,

    /// Session TTL.
    /// Default: 15s
    #[serde(default = "default_ttl", with = "super::duration")]
    pub lock_ttl: Duration,

    /// Renewal cadence while held.
    /// Default: a third of `lock_ttl`
    #[serde(
        default,
        with = "super::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub renew_interval: Option<Duration>,

    /// Lock name, appended to `key_prefix` to form the KV key.
    /// Default: "pruner"
    #[serde(default = "default_lock_name")]
    pub lock_name: String,

    /// KV prefix for lock keys.
    /// Default: "v1/locks"
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Timeout for individual Consul HTTP requests.
    /// Default: 5s
    #[serde(default = "default_request_timeout", with = "super::duration")]
    pub request_timeout: Duration,
}

impl Default for ConsulLockConfig {
    fn default() -> Self {
        Self {
            consul_cluster_config: None,
            lock_retry_interval: default_retry_interval(),
            lock_ttl: default_ttl(),
            renew_interval: None,
            lock_name: default_lock_name(),
            key_prefix: default_key_prefix(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl ConsulLockConfig {
    pub fn timing(&self) -> LockTiming {
        LockTiming::new(self.lock_retry_interval, self.lock_ttl, self.renew_interval)
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        self.timing().validate("lock")?;
        validate_lock_name("lock", &self.lock_name)?;

        // Consul rejects session TTLs under 10s.
        if self.lock_ttl < Duration::from_secs(10) {
            return Err(ConfigError::Validation(
                "lock.lock_ttl must be at least 10s for Consul sessions".into(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "lock.request_timeout must be greater than zero".into(),
            ));
        }

        if let Some(endpoint) = &self.consul_cluster_config {
            let parsed = url::Url::parse(endpoint).map_err(|e| {
                ConfigError::Validation(format!(
                    "lock.consul_cluster_config is not a valid URL: {e}"
                ))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::Validation(
                    "lock.consul_cluster_config must use http or https".into(),
                ));
            }
        }
        Ok(())
    }
}

fn validate_lock_name(section: &str, name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "{section}.lock_name cannot be empty"
        )));
    }
    Ok(())
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_ttl() -> Duration {
    Duration::from_secs(15)
}

fn default_lock_name() -> String {
    DEFAULT_LOCK_NAME.to_string()
}

fn default_key_prefix() -> String {
    "v1/locks".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

/// The lock strategy this replica runs with, resolved once at startup.
#[derive(Debug, Clone)]
pub enum LockStrategy {
    /// Shared `pruner_lock` table.
    Database(DbLockConfig),
    /// Consul session + KV lock.
    Consul(ConsulLockConfig),
    /// No cross-replica exclusion.
    None,
}

impl LockStrategy {
    /// Lock name and timing, when a lock is configured.
    pub fn settings(&self) -> Option<(&str, LockTiming)> {
        match self {
            LockStrategy::Database(c) => Some((c.lock_name.as_str(), c.timing())),
            LockStrategy::Consul(c) => Some((c.lock_name.as_str(), c.timing())),
            LockStrategy::None => None,
        }
    }
}

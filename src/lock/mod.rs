//! Cross-replica exclusion.
//!
//! A [`DistributedLock`] is a named, TTL-bounded lock. Not being able to take
//! the lock because another replica holds it is an ordinary outcome
//! (`Ok(false)`); [`LockError`] is reserved for faults talking to the backend.
//!
//! Backends:
//! - [`TableLock`]: a row in the `pruner_lock` table (SQLite or PostgreSQL)
//! - [`ConsulLock`]: a Consul session bound to a KV key

mod consul;
mod maintainer;
mod table;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
pub use consul::ConsulLock;
pub use maintainer::{LockMaintainer, MaintainerError, MaintainerState};
pub use table::TableLock;
use thiserror::Error;
use uuid::Uuid;

use crate::{config::LockStrategy, db::DbError};

/// Identity of this process in every lock call.
///
/// Generated once at startup and never regenerated, so a replica that loses
/// and re-acquires the lock is still recognisable as the same owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockIdentity(Uuid);

impl LockIdentity {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for LockIdentity {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for LockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    /// The lock service could not be reached or answered with a server error.
    #[error("Lock service unavailable: {0}")]
    Unavailable(String),

    /// The lock service answered in a way this client does not understand.
    #[error("Unexpected lock service response: {0}")]
    Protocol(String),

    #[error("Lock table error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid lock configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for LockError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            LockError::Unavailable(err.to_string())
        } else {
            LockError::Protocol(err.to_string())
        }
    }
}

/// A named lock with time-bounded ownership.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Short backend name for log fields.
    fn backend(&self) -> &'static str;

    /// Claim `name` for `owner` for `ttl`.
    ///
    /// Returns `Ok(true)` when `owner` holds the lock afterwards, including
    /// when it already held it.
    async fn acquire(&self, name: &str, owner: LockIdentity, ttl: Duration)
    -> Result<bool, LockError>;

    /// Extend a lock `owner` currently holds. Returns `Ok(false)` when the
    /// lock has expired or belongs to someone else; the lock is not extended.
    async fn renew(&self, name: &str, owner: LockIdentity, ttl: Duration)
    -> Result<bool, LockError>;

    /// Give the lock up. Releasing a lock `owner` does not hold is a no-op.
    async fn release(&self, name: &str, owner: LockIdentity) -> Result<(), LockError>;
}

/// Build the lock handle for the resolved strategy.
///
/// The table lock needs its database opened by the caller and handed over as
/// a [`crate::db::DbPool`]; Consul needs nothing beyond its configuration.
pub fn build_lock(
    strategy: &LockStrategy,
    lock_db: Option<&crate::db::DbPool>,
) -> Result<Option<Arc<dyn DistributedLock>>, LockError> {
    match strategy {
        LockStrategy::Database(_) => {
            let pool = lock_db
                .ok_or_else(|| LockError::Config("lock database was not opened".to_string()))?;
            Ok(Some(Arc::new(TableLock::new(pool.locks()))))
        }
        LockStrategy::Consul(config) => Ok(Some(Arc::new(ConsulLock::from_config(config)?))),
        LockStrategy::None => Ok(None),
    }
}

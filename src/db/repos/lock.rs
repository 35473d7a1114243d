use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{db::error::DbResult, models::LockRecord};

/// Storage for the `pruner_lock` table.
///
/// Every mutating method is a single conditional statement; callers never
/// read a record and then write it.
#[async_trait]
pub trait LockRepo: Send + Sync {
    /// Claim `name` for `owner` until `now + ttl`.
    ///
    /// Succeeds when no row exists, the existing row expired at or before
    /// `now`, or `owner` already holds it. Returns whether `owner` holds the
    /// lock afterwards.
    async fn try_acquire(
        &self,
        name: &str,
        owner: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> DbResult<bool>;

    /// Extend the expiry of a lock that `owner` holds and that has not yet
    /// expired at `now`. Returns false, leaving the row untouched, otherwise.
    async fn renew(
        &self,
        name: &str,
        owner: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> DbResult<bool>;

    /// Delete the row if `owner` holds it. No-op otherwise.
    async fn release(&self, name: &str, owner: Uuid) -> DbResult<()>;

    /// Current row for `name`, expired or not.
    async fn get(&self, name: &str) -> DbResult<Option<LockRecord>>;
}

/// `now + ttl` in Unix milliseconds, saturating on overflow.
pub(crate) fn expiry_millis(now: DateTime<Utc>, ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now.timestamp_millis().saturating_add(ttl_ms)
}

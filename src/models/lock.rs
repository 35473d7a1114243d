use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A row of the lock table.
///
/// The lock is held by `owner` while `expires_at` is in the future. Once
/// expired the row is reclaimable by any replica even though it still exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    /// Lock name; one row per daemon family.
    pub name: String,
    /// Identity of the replica that claimed the lock.
    pub owner: Uuid,
    /// When `owner` first claimed the lock.
    pub acquired_at: DateTime<Utc>,
    /// When the claim lapses unless renewed.
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    /// Whether the record is unexpired at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Whether `owner` holds the lock at `now`.
    pub fn is_held_by(&self, owner: Uuid, now: DateTime<Utc>) -> bool {
        self.owner == owner && self.is_live(now)
    }
}

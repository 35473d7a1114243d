use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::{
    config::{RetentionStoreConfig, StoreKind},
    db::{DbResult, RetentionRepo},
};

/// Result of one prune.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneOutcome {
    /// Rows timestamped strictly before this were deleted.
    pub threshold: DateTime<Utc>,
    pub rows_deleted: u64,
}

/// Binds a store to its retention age.
pub struct PruningPolicy {
    kind: StoreKind,
    store: Arc<dyn RetentionRepo>,
    cutoff_days: u32,
    batch_size: u32,
}

impl PruningPolicy {
    pub fn new(
        kind: StoreKind,
        store: Arc<dyn RetentionRepo>,
        cutoff_days: u32,
        batch_size: u32,
    ) -> Self {
        Self {
            kind,
            store,
            cutoff_days,
            batch_size,
        }
    }

    pub fn from_config(
        kind: StoreKind,
        store: Arc<dyn RetentionRepo>,
        config: &RetentionStoreConfig,
    ) -> Self {
        Self::new(kind, store, config.cutoff_days, config.batch_size)
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn cutoff_days(&self) -> u32 {
        self.cutoff_days
    }

    /// `now - cutoff_days`, clamped to the Unix epoch. Rows are stored as
    /// nanoseconds since the epoch, so a clamped threshold deletes nothing.
    pub fn threshold(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(Duration::days(i64::from(self.cutoff_days)))
            .filter(|threshold| *threshold > DateTime::UNIX_EPOCH)
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Delete everything older than the threshold at `now`.
    pub async fn prune(&self, now: DateTime<Utc>) -> DbResult<PruneOutcome> {
        let threshold = self.threshold(now);
        let rows_deleted = self.store.delete_before(threshold, self.batch_size).await?;
        Ok(PruneOutcome {
            threshold,
            rows_deleted,
        })
    }
}

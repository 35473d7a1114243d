use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::error::DbResult;

/// Table pruned for one store, with its timestamp column holding Unix
/// nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionTable {
    pub name: &'static str,
    pub timestamp_column: &'static str,
}

impl RetentionTable {
    pub const INSTANCE_METRICS: Self = Self {
        name: "appinstancemetrics",
        timestamp_column: "timestamp",
    };
    pub const APP_METRICS: Self = Self {
        name: "app_metric",
        timestamp_column: "timestamp",
    };
    pub const SCALING_HISTORY: Self = Self {
        name: "scalinghistory",
        timestamp_column: "timestamp",
    };
}

#[async_trait]
pub trait RetentionRepo: Send + Sync {
    /// Table this repository prunes.
    fn table(&self) -> RetentionTable;

    /// Delete every row timestamped strictly before `cutoff`.
    ///
    /// Deletes in batches of `batch_size` until no matching rows remain.
    /// Returns the total number of rows deleted.
    async fn delete_before(&self, cutoff: DateTime<Utc>, batch_size: u32) -> DbResult<u64>;
}

/// Convert a cutoff to the nanosecond representation used by the tables.
pub(crate) fn cutoff_nanos(cutoff: DateTime<Utc>) -> DbResult<i64> {
    cutoff.timestamp_nanos_opt().ok_or_else(|| {
        crate::db::DbError::Validation(format!("cutoff {cutoff} is out of nanosecond range"))
    })
}

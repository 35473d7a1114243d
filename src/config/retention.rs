//! Per-store retention configuration.
//!
//! # Example
//!
//! ```toml
//! [app_metrics_db]
//! cutoff_days = 20
//! refresh_interval = "24h"
//! batch_size = 1000
//! db = { type = "postgres", url = "postgres://pruner@db/appmetrics" }
//! ```

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use super::{ConfigError, DatabaseConfig};

/// Retention policy and connection for one store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionStoreConfig {
    /// Database holding the store's table.
    pub db: DatabaseConfig,

    /// Rows older than this many days are deleted. Zero deletes everything
    /// timestamped before the moment the prune runs.
    /// Default: 20
    #[serde(default = "default_cutoff_days")]
    pub cutoff_days: u32,

    /// How often the store is pruned. Must be non-zero.
    /// Default: 24h
    #[serde(default = "default_refresh_interval", with = "super::duration")]
    pub refresh_interval: Duration,

    /// Rows removed per DELETE statement. A prune keeps issuing batches
    /// until nothing older than the cutoff remains.
    /// Default: 1000
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

/// Upper bound on `cutoff_days`; thresholds further back fall outside the
/// nanosecond timestamp range.
pub const MAX_CUTOFF_DAYS: u32 = 36_500;

fn default_cutoff_days() -> u32 {
    20
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_batch_size() -> u32 {
    1000
}

impl RetentionStoreConfig {
    pub(super) fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.cutoff_days > MAX_CUTOFF_DAYS {
            return Err(ConfigError::Validation(format!(
                "{section}.cutoff_days must be at most {MAX_CUTOFF_DAYS}, got {}",
                self.cutoff_days
            )));
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::Validation(format!(
                "{section}.refresh_interval must be greater than zero"
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Validation(format!(
                "{section}.batch_size must be greater than zero"
            )));
        }
        self.db.validate()
    }
}

/// The three stores the daemon prunes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    InstanceMetrics,
    AppMetrics,
    ScalingHistory,
}

impl StoreKind {
    /// Group member name of the runner pruning this store.
    pub fn member_name(&self) -> &'static str {
        match self {
            StoreKind::InstanceMetrics => "instancemetrics-dbpruner",
            StoreKind::AppMetrics => "appmetrics-dbpruner",
            StoreKind::ScalingHistory => "scalingengine-dbpruner",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreKind::InstanceMetrics => "instance_metrics",
            StoreKind::AppMetrics => "app_metrics",
            StoreKind::ScalingHistory => "scaling_history",
        })
    }
}

//! Configuration module for the pruner daemon.
//!
//! The daemon is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax. Durations are written
//! in humantime notation (`"15s"`, `"12h"`).
//!
//! # Example
//!
//! ```toml
//! enable_db_lock = true
//!
//! [logging]
//! level = "info"
//!
//! [instance_metrics_db]
//! cutoff_days = 20
//! refresh_interval = "12h"
//! db = { type = "postgres", url = "postgres://pruner:${DB_PASSWORD}@db/instancemetrics" }
//!
//! [db_lock]
//! lock_ttl = "15s"
//! lock_retry_interval = "5s"
//! db = { type = "postgres", url = "postgres://pruner:${DB_PASSWORD}@db/lock" }
//! ```

mod database;
pub mod duration;
mod lock;
mod observability;
mod retention;

use std::path::Path;

pub use database::*;
pub use lock::*;
pub use observability::*;
pub use retention::*;
use serde::{Deserialize, Serialize};

/// Root configuration for the pruner daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrunerConfig {
    /// Use the shared `pruner_lock` table to elect the active replica.
    /// Takes precedence over the Consul lock when both are configured.
    #[serde(default)]
    pub enable_db_lock: bool,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Retention policy for the instance metrics store.
    pub instance_metrics_db: RetentionStoreConfig,

    /// Retention policy for the application metrics store.
    pub app_metrics_db: RetentionStoreConfig,

    /// Retention policy for the scaling history store.
    pub scaling_engine_db: RetentionStoreConfig,

    /// Table lock settings. Required when `enable_db_lock` is set.
    #[serde(default)]
    pub db_lock: Option<DbLockConfig>,

    /// Consul lock settings. Only used when `consul_cluster_config` is set
    /// and the table lock is disabled.
    #[serde(default)]
    pub lock: ConsulLockConfig,
}

impl PrunerConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;

        // Pre-check: database types whose driver is not compiled in produce a
        // cryptic "unknown variant" error from serde otherwise.
        let raw: toml::Value = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        check_disabled_features(&raw)?;

        let config: PrunerConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        self.instance_metrics_db.validate("instance_metrics_db")?;
        self.app_metrics_db.validate("app_metrics_db")?;
        self.scaling_engine_db.validate("scaling_engine_db")?;

        if self.enable_db_lock {
            match &self.db_lock {
                Some(db_lock) => db_lock.validate()?,
                None => {
                    return Err(ConfigError::Validation(
                        "enable_db_lock is set but no [db_lock] section is configured".into(),
                    ));
                }
            }
        }

        if self.lock.consul_cluster_config.is_some() {
            self.lock.validate()?;
        }

        Ok(())
    }

    /// Resolve which lock strategy this replica uses.
    ///
    /// The table lock wins over Consul when both are configured.
    pub fn lock_strategy(&self) -> LockStrategy {
        if self.enable_db_lock
            && let Some(db_lock) = &self.db_lock
        {
            if self.lock.consul_cluster_config.is_some() {
                tracing::warn!(
                    "Both enable_db_lock and lock.consul_cluster_config are set; \
                     using the database lock and ignoring Consul"
                );
            }
            return LockStrategy::Database(db_lock.clone());
        }

        match &self.lock.consul_cluster_config {
            Some(_) => LockStrategy::Consul(self.lock.clone()),
            None => LockStrategy::None,
        }
    }

    /// All retention stores with the member names they run under.
    pub fn stores(&self) -> [(StoreKind, &RetentionStoreConfig); 3] {
        [
            (StoreKind::InstanceMetrics, &self.instance_metrics_db),
            (StoreKind::AppMetrics, &self.app_metrics_db),
            (StoreKind::ScalingHistory, &self.scaling_engine_db),
        ]
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Check for feature-gated configuration values before typed deserialization.
fn check_disabled_features(raw: &toml::Value) -> Result<(), ConfigError> {
    let mut issues: Vec<(String, &str)> = Vec::new();

    for section in [
        "instance_metrics_db",
        "app_metrics_db",
        "scaling_engine_db",
        "db_lock",
    ] {
        if let Some(type_val) = raw
            .get(section)
            .and_then(|v| v.get("db"))
            .and_then(|v| v.get("type"))
            .and_then(|v| v.as_str())
        {
            check_database_feature(section, type_val, &mut issues);
        }
    }

    if issues.is_empty() {
        return Ok(());
    }

    let details = issues
        .iter()
        .map(|(msg, _)| msg.as_str())
        .collect::<Vec<_>>()
        .join("\n  - ");
    let mut features = issues.iter().map(|(_, feat)| *feat).collect::<Vec<_>>();
    features.sort_unstable();
    features.dedup();

    Err(ConfigError::Validation(format!(
        "Configuration requires features not compiled in this build:\n  \
         - {details}\n\n\
         Rebuild with: cargo build --features {}",
        features.join(",")
    )))
}

fn check_database_feature(_section: &str, type_val: &str, _issues: &mut Vec<(String, &str)>) {
    match type_val {
        #[cfg(not(feature = "database-sqlite"))]
        "sqlite" => _issues.push((
            format!("{_section}.db type 'sqlite' requires the 'database-sqlite' feature"),
            "database-sqlite",
        )),
        #[cfg(not(feature = "database-postgres"))]
        "postgres" => _issues.push((
            format!("{_section}.db type 'postgres' requires the 'database-postgres' feature"),
            "database-postgres",
        )),
        _ => {}
    }
}

/// Expand environment variables in the format `${VAR_NAME}`.
/// Skips commented lines (lines where content before the variable is a comment).
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(format!("invalid env pattern: {e}")))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');

        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };

            // Skip if this variable is inside a comment
            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);

            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

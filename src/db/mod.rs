mod error;
#[cfg(feature = "database-postgres")]
pub mod postgres;
pub mod repos;
#[cfg(feature = "database-sqlite")]
pub mod sqlite;

#[cfg(test)]
pub mod tests;

use std::{sync::Arc, time::Duration};

pub use error::{DbError, DbResult};
pub use repos::*;

use crate::config::{DatabaseConfig, StoreKind};

/// Cached repository trait objects, created once at startup.
struct CachedRepos {
    instance_metrics: Arc<dyn RetentionRepo>,
    app_metrics: Arc<dyn RetentionRepo>,
    scaling_history: Arc<dyn RetentionRepo>,
    locks: Arc<dyn LockRepo>,
}

enum PoolStorage {
    #[cfg(feature = "database-sqlite")]
    Sqlite(sqlx::SqlitePool),
    #[cfg(feature = "database-postgres")]
    Postgres(sqlx::PgPool),
}

/// Connection pool to one database.
///
/// The pruner opens one of these per configured store plus one for the lock
/// table. Every pool exposes every repository; callers pick the one matching
/// the tables that database actually holds.
pub struct DbPool {
    inner: PoolStorage,
    repos: CachedRepos,
}

impl DbPool {
    /// Create a DbPool from an existing SQLite pool.
    /// Primarily useful for testing.
    #[cfg(feature = "database-sqlite")]
    pub fn from_sqlite(pool: sqlx::SqlitePool) -> Self {
        let retention = |table| -> Arc<dyn RetentionRepo> {
            Arc::new(sqlite::SqliteRetentionRepo::new(pool.clone(), table))
        };
        let repos = CachedRepos {
            instance_metrics: retention(RetentionTable::INSTANCE_METRICS),
            app_metrics: retention(RetentionTable::APP_METRICS),
            scaling_history: retention(RetentionTable::SCALING_HISTORY),
            locks: Arc::new(sqlite::SqliteLockRepo::new(pool.clone())),
        };
        DbPool {
            inner: PoolStorage::Sqlite(pool),
            repos,
        }
    }

    /// Create a DbPool from an existing PostgreSQL pool.
    /// Primarily useful for testing.
    #[cfg(feature = "database-postgres")]
    pub fn from_postgres(pool: sqlx::PgPool) -> Self {
        let retention = |table| -> Arc<dyn RetentionRepo> {
            Arc::new(postgres::PostgresRetentionRepo::new(pool.clone(), table))
        };
        let repos = CachedRepos {
            instance_metrics: retention(RetentionTable::INSTANCE_METRICS),
            app_metrics: retention(RetentionTable::APP_METRICS),
            scaling_history: retention(RetentionTable::SCALING_HISTORY),
            locks: Arc::new(postgres::PostgresLockRepo::new(pool.clone())),
        };
        DbPool {
            inner: PoolStorage::Postgres(pool),
            repos,
        }
    }

    /// Open a pool for the configured database.
    ///
    /// Connects eagerly so that an unreachable database fails startup rather
    /// than the first pruning run.
    pub async fn from_config(config: &DatabaseConfig) -> DbResult<Self> {
        match config {
            #[cfg(feature = "database-sqlite")]
            DatabaseConfig::Sqlite(cfg) => {
                let pool = sqlx::sqlite::SqlitePoolOptions::new()
                    .max_connections(cfg.max_connections)
                    .connect_with(
                        sqlx::sqlite::SqliteConnectOptions::new()
                            .filename(&cfg.path)
                            .create_if_missing(cfg.create_if_missing)
                            .journal_mode(if cfg.wal_mode {
                                sqlx::sqlite::SqliteJournalMode::Wal
                            } else {
                                sqlx::sqlite::SqliteJournalMode::Delete
                            })
                            .busy_timeout(Duration::from_millis(cfg.busy_timeout_ms)),
                    )
                    .await?;

                Ok(Self::from_sqlite(pool))
            }
            #[cfg(feature = "database-postgres")]
            DatabaseConfig::Postgres(cfg) => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .min_connections(cfg.min_connections)
                    .max_connections(cfg.max_connections)
                    .acquire_timeout(Duration::from_secs(cfg.connect_timeout_secs))
                    .idle_timeout(Duration::from_secs(cfg.idle_timeout_secs))
                    .connect(&cfg.url)
                    .await?;

                Ok(Self::from_postgres(pool))
            }
        }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> DbResult<()> {
        match &self.inner {
            #[cfg(feature = "database-sqlite")]
            PoolStorage::Sqlite(pool) => {
                tracing::info!("Running SQLite migrations");
                sqlx::migrate!("./migrations_sqlx/sqlite").run(pool).await?;
                tracing::info!("SQLite migrations completed successfully");
                Ok(())
            }
            #[cfg(feature = "database-postgres")]
            PoolStorage::Postgres(pool) => {
                tracing::info!("Running PostgreSQL migrations");
                sqlx::migrate!("./migrations_sqlx/postgres").run(pool).await?;
                tracing::info!("PostgreSQL migrations completed successfully");
                Ok(())
            }
        }
    }

    /// Retention repository for a store's table.
    pub fn retention(&self, kind: StoreKind) -> Arc<dyn RetentionRepo> {
        match kind {
            StoreKind::InstanceMetrics => Arc::clone(&self.repos.instance_metrics),
            StoreKind::AppMetrics => Arc::clone(&self.repos.app_metrics),
            StoreKind::ScalingHistory => Arc::clone(&self.repos.scaling_history),
        }
    }

    /// Get lock table repository
    pub fn locks(&self) -> Arc<dyn LockRepo> {
        Arc::clone(&self.repos.locks)
    }

    /// Close all connections, waiting for checked-out ones to be returned.
    pub async fn close(&self) {
        match &self.inner {
            #[cfg(feature = "database-sqlite")]
            PoolStorage::Sqlite(pool) => pool.close().await,
            #[cfg(feature = "database-postgres")]
            PoolStorage::Postgres(pool) => pool.close().await,
        }
    }
}

//! Process wiring: opens the databases, resolves the lock and assembles the
//! supervised group.

use std::{future::Future, sync::Arc, time::Duration};

use thiserror::Error;

use crate::{
    config::{DatabaseConfig, LockStrategy, LockTiming, PrunerConfig},
    db::{DbError, DbPool},
    lock::{DistributedLock, LockError, LockIdentity, LockMaintainer, build_lock},
    retention::{PeriodicRunner, PruningPolicy},
    supervisor::{Member, ProcessSupervisor, SupervisorError},
};

/// Group member name of the lock maintainer.
pub const LOCK_MEMBER: &str = "lock";

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Failed to connect to {store} database at {target}: {source}")]
    Connect {
        store: String,
        target: String,
        source: DbError,
    },

    #[error("Failed to migrate {store} database at {target}: {source}")]
    Migrate {
        store: String,
        target: String,
        source: DbError,
    },

    #[error("Failed to set up lock: {0}")]
    Lock(#[from] LockError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// A configured lock ready to be maintained.
pub struct LockSetup {
    pub lock: Arc<dyn DistributedLock>,
    pub name: String,
    pub timing: LockTiming,
}

/// Members in start order: the lock maintainer (if any) followed by one
/// runner per store.
pub fn build_members(
    lock: Option<LockSetup>,
    owner: LockIdentity,
    runners: Vec<(PruningPolicy, Duration)>,
) -> Vec<Member> {
    let mut members = Vec::with_capacity(runners.len() + 1);

    if let Some(setup) = lock {
        members.push(Member::new(
            LOCK_MEMBER,
            LockMaintainer::new(setup.lock, setup.name, owner, setup.timing),
        ));
    }

    for (policy, interval) in runners {
        let name = policy.kind().member_name();
        members.push(Member::new(name, PeriodicRunner::new(policy, interval)));
    }

    members
}

async fn open(store: &str, config: &DatabaseConfig) -> Result<Arc<DbPool>, DaemonError> {
    let target = config.display_target();
    match DbPool::from_config(config).await {
        Ok(pool) => {
            tracing::info!(store, target = %target, "Connected to database");
            Ok(Arc::new(pool))
        }
        Err(source) => Err(DaemonError::Connect {
            store: store.to_string(),
            target,
            source,
        }),
    }
}

/// The running process: every database connection plus the member group.
pub struct Daemon {
    supervisor: ProcessSupervisor,
    pools: Vec<Arc<DbPool>>,
}

impl Daemon {
    /// Connect to every configured database and build the group.
    ///
    /// Any connection failure is fatal; nothing has started yet.
    pub async fn connect(config: &PrunerConfig, owner: LockIdentity) -> Result<Self, DaemonError> {
        let mut pools = Vec::new();

        let strategy = config.lock_strategy();
        let lock_pool = match &strategy {
            LockStrategy::Database(db_lock) => {
                let pool = open(LOCK_MEMBER, &db_lock.db).await?;
                pools.push(Arc::clone(&pool));
                Some(pool)
            }
            _ => None,
        };

        let lock = build_lock(&strategy, lock_pool.as_deref())?;
        let lock = match (lock, strategy.settings()) {
            (Some(lock), Some((name, timing))) => {
                tracing::info!(
                    backend = lock.backend(),
                    lock = name,
                    owner = %owner,
                    "Cross-replica lock enabled"
                );
                Some(LockSetup {
                    lock,
                    name: name.to_string(),
                    timing,
                })
            }
            _ => {
                tracing::warn!(
                    "No lock configured; every replica running this config will prune independently"
                );
                None
            }
        };

        let mut runners = Vec::new();
        for (kind, store) in config.stores() {
            let pool = open(&kind.to_string(), &store.db).await?;
            runners.push((
                PruningPolicy::from_config(kind, pool.retention(kind), store),
                store.refresh_interval,
            ));
            pools.push(pool);
        }

        Ok(Self {
            supervisor: ProcessSupervisor::new(build_members(lock, owner, runners)),
            pools,
        })
    }

    /// Run until `shutdown` resolves or a member fails, then close every
    /// connection.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), DaemonError> {
        let members: Vec<&str> = self.supervisor.member_names().collect();
        tracing::info!(members = ?members, "Starting pruner");

        let result = self.supervisor.run(shutdown).await;

        for pool in &self.pools {
            pool.close().await;
        }

        result.map_err(DaemonError::from)
    }
}

/// Create the tables this daemon touches in every configured database.
pub async fn migrate(config: &PrunerConfig) -> Result<(), DaemonError> {
    let mut targets: Vec<(String, &DatabaseConfig)> = config
        .stores()
        .into_iter()
        .map(|(kind, store)| (kind.to_string(), &store.db))
        .collect();
    if config.enable_db_lock
        && let Some(db_lock) = &config.db_lock
    {
        targets.push((LOCK_MEMBER.to_string(), &db_lock.db));
    }

    for (store, db) in targets {
        let pool = open(&store, db).await?;
        if let Err(source) = pool.run_migrations().await {
            return Err(DaemonError::Migrate {
                store,
                target: db.display_target(),
                source,
            });
        }
        pool.close().await;
    }

    Ok(())
}

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;

use super::{DistributedLock, LockError, LockIdentity};
use crate::db::LockRepo;

/// Lock backed by a row in the `pruner_lock` table.
///
/// Replicas compare wall-clock time against the stored expiry, so their
/// clocks must agree to well within the TTL.
pub struct TableLock {
    repo: Arc<dyn LockRepo>,
}

impl TableLock {
    pub fn new(repo: Arc<dyn LockRepo>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl DistributedLock for TableLock {
    fn backend(&self) -> &'static str {
        "database"
    }

    async fn acquire(
        &self,
        name: &str,
        owner: LockIdentity,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        Ok(self
            .repo
            .try_acquire(name, owner.as_uuid(), Utc::now(), ttl)
            .await?)
    }

    async fn renew(
        &self,
        name: &str,
        owner: LockIdentity,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        Ok(self
            .repo
            .renew(name, owner.as_uuid(), Utc::now(), ttl)
            .await?)
    }

    async fn release(&self, name: &str, owner: LockIdentity) -> Result<(), LockError> {
        Ok(self.repo.release(name, owner.as_uuid()).await?)
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use super::{DistributedLock, LockIdentity};
use crate::{
    config::LockTiming,
    supervisor::{MemberError, Ready, Runnable},
};

/// Lifecycle of the lock as seen by this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintainerState {
    Acquiring,
    Held,
    Renewing,
    Lost,
    Released,
}

#[derive(Debug, Error)]
pub enum MaintainerError {
    #[error("lock {name:?} was lost")]
    LockLost { name: String },
}

/// Group member that takes the lock, keeps it renewed, and gives it back on
/// shutdown. Ready once the lock is held.
pub struct LockMaintainer {
    lock: Arc<dyn DistributedLock>,
    name: String,
    owner: LockIdentity,
    timing: LockTiming,
    state: watch::Sender<MaintainerState>,
}

impl LockMaintainer {
    pub fn new(
        lock: Arc<dyn DistributedLock>,
        name: impl Into<String>,
        owner: LockIdentity,
        timing: LockTiming,
    ) -> Self {
        let (state, _) = watch::channel(MaintainerState::Acquiring);
        Self {
            lock,
            name: name.into(),
            owner,
            timing,
            state,
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<MaintainerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: MaintainerState) {
        self.state.send_replace(state);
    }

    /// Retry `acquire` until the lock is held. Returns when the successful
    /// attempt started, or `None` if shutdown was requested first.
    async fn acquire(&self, shutdown: &CancellationToken) -> Option<Instant> {
        loop {
            let attempted_at = Instant::now();
            match self
                .lock
                .acquire(&self.name, self.owner, self.timing.ttl)
                .await
            {
                Ok(true) => return Some(attempted_at),
                Ok(false) => {
                    tracing::debug!(lock = %self.name, "Lock held by another replica, retrying");
                }
                Err(e) => {
                    tracing::warn!(lock = %self.name, error = %e, "Failed to acquire lock, retrying");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.timing.retry_interval) => {}
            }
        }
    }

    /// Keep the lock renewed until shutdown. Errors only when the lock is
    /// lost. `acquired_at` is when the acquiring call started; the backend's
    /// expiry counts from no later than that.
    async fn hold(
        &self,
        shutdown: &CancellationToken,
        acquired_at: Instant,
    ) -> Result<(), MaintainerError> {
        let mut last_renewed = acquired_at;
        let mut delay = self.timing.renew_interval.saturating_sub(acquired_at.elapsed());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }

            self.set_state(MaintainerState::Renewing);
            let attempted_at = Instant::now();
            match self
                .lock
                .renew(&self.name, self.owner, self.timing.ttl)
                .await
            {
                Ok(true) => {
                    tracing::debug!(lock = %self.name, "Lock renewed");
                    last_renewed = attempted_at;
                    delay = self.timing.renew_interval;
                }
                Ok(false) => {
                    return Err(MaintainerError::LockLost {
                        name: self.name.clone(),
                    });
                }
                Err(e) => {
                    let since = last_renewed.elapsed();
                    if since >= self.timing.ttl {
                        tracing::error!(
                            lock = %self.name,
                            error = %e,
                            since_renewed_secs = since.as_secs(),
                            "Lock TTL elapsed without a successful renewal"
                        );
                        return Err(MaintainerError::LockLost {
                            name: self.name.clone(),
                        });
                    }
                    tracing::warn!(lock = %self.name, error = %e, "Failed to renew lock, retrying");
                    delay = self.timing.retry_interval.min(self.timing.ttl - since);
                }
            }
            self.set_state(MaintainerState::Held);
        }
    }
}

#[async_trait]
impl Runnable for LockMaintainer {
    async fn run(
        self: Box<Self>,
        mut ready: Ready,
        shutdown: CancellationToken,
    ) -> Result<(), MemberError> {
        tracing::info!(
            lock = %self.name,
            backend = self.lock.backend(),
            owner = %self.owner,
            ttl_secs = self.timing.ttl.as_secs(),
            retry_interval_secs = self.timing.retry_interval.as_secs(),
            "Acquiring lock"
        );
        self.set_state(MaintainerState::Acquiring);

        let Some(acquired_at) = self.acquire(&shutdown).await else {
            tracing::info!(lock = %self.name, "Shutdown before lock was acquired");
            self.set_state(MaintainerState::Released);
            return Ok(());
        };

        tracing::info!(lock = %self.name, owner = %self.owner, "Lock acquired");
        self.set_state(MaintainerState::Held);
        ready.notify();

        if let Err(e) = self.hold(&shutdown, acquired_at).await {
            tracing::error!(lock = %self.name, "Lock lost, another replica may take over");
            self.set_state(MaintainerState::Lost);
            return Err(Box::new(e));
        }

        if let Err(e) = self.lock.release(&self.name, self.owner).await {
            tracing::warn!(lock = %self.name, error = %e, "Failed to release lock");
        } else {
            tracing::info!(lock = %self.name, "Lock released");
        }
        self.set_state(MaintainerState::Released);
        Ok(())
    }
}

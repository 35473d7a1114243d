use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::PruningPolicy;
use crate::supervisor::{MemberError, Ready, Runnable};

/// Runs a policy immediately and then every `interval` until stopped.
///
/// A prune that is in flight when the stop signal arrives runs to completion;
/// no new prune starts afterwards. A slow prune delays the following tick
/// rather than causing a burst of catch-up runs.
pub struct PeriodicRunner {
    policy: PruningPolicy,
    interval: Duration,
}

impl PeriodicRunner {
    pub fn new(policy: PruningPolicy, interval: Duration) -> Self {
        Self { policy, interval }
    }

    async fn tick(&self) {
        let now = Utc::now();
        match self.policy.prune(now).await {
            Ok(outcome) if outcome.rows_deleted > 0 => {
                tracing::info!(
                    store = %self.policy.kind(),
                    rows_deleted = outcome.rows_deleted,
                    threshold = %outcome.threshold,
                    "Pruned old records"
                );
            }
            Ok(outcome) => {
                tracing::debug!(
                    store = %self.policy.kind(),
                    threshold = %outcome.threshold,
                    "Prune complete, no records to delete"
                );
            }
            Err(e) => {
                tracing::error!(store = %self.policy.kind(), error = %e, "Error pruning store");
            }
        }
    }
}

#[async_trait]
impl Runnable for PeriodicRunner {
    async fn run(
        self: Box<Self>,
        mut ready: Ready,
        shutdown: CancellationToken,
    ) -> Result<(), MemberError> {
        tracing::info!(
            store = %self.policy.kind(),
            cutoff_days = self.policy.cutoff_days(),
            interval_secs = self.interval.as_secs(),
            "Starting pruner"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ready.notify();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        tracing::info!(store = %self.policy.kind(), "Pruner stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use chrono::{DateTime, TimeDelta};

    use super::*;
    use crate::{
        config::StoreKind,
        db::{DbError, DbResult, RetentionRepo, RetentionTable},
    };

    /// Records every cutoff it is asked to prune with.
    #[derive(Default)]
    struct RecordingRepo {
        cutoffs: Mutex<Vec<DateTime<Utc>>>,
        completed: AtomicUsize,
        fail_first: bool,
        prune_takes: Duration,
    }

    #[async_trait]
    impl RetentionRepo for RecordingRepo {
        fn table(&self) -> RetentionTable {
            RetentionTable::APP_METRICS
        }

        async fn delete_before(&self, cutoff: DateTime<Utc>, _batch_size: u32) -> DbResult<u64> {
            let call = {
                let mut cutoffs = self.cutoffs.lock().unwrap();
                cutoffs.push(cutoff);
                cutoffs.len()
            };
            tokio::time::sleep(self.prune_takes).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 1 {
                return Err(DbError::Internal("connection reset".to_string()));
            }
            Ok(3)
        }
    }

    impl RecordingRepo {
        fn calls(&self) -> usize {
            self.cutoffs.lock().unwrap().len()
        }
    }

    fn spawn_runner(
        repo: &Arc<RecordingRepo>,
        interval: Duration,
    ) -> (
        CancellationToken,
        tokio::sync::oneshot::Receiver<()>,
        tokio::task::JoinHandle<Result<(), MemberError>>,
    ) {
        let policy = PruningPolicy::new(
            StoreKind::AppMetrics,
            Arc::clone(repo) as Arc<dyn RetentionRepo>,
            7,
            100,
        );
        let runner = Box::new(PeriodicRunner::new(policy, interval));
        let (ready, ready_rx) = Ready::new();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(runner.run(ready, shutdown.clone()));
        (shutdown, ready_rx, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_prunes_immediately_then_every_interval() {
        let repo = Arc::new(RecordingRepo::default());
        let (shutdown, ready, task) = spawn_runner(&repo, Duration::from_secs(60));

        ready.await.expect("runner ready");
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(repo.calls(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(repo.calls(), 2);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(repo.calls(), 4);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_is_cutoff_days_before_now() {
        let repo = Arc::new(RecordingRepo::default());
        let before = Utc::now();
        let (shutdown, _ready, task) = spawn_runner(&repo, Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(1)).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        let cutoff = repo.cutoffs.lock().unwrap()[0];
        let after = Utc::now();
        assert!(cutoff >= before - TimeDelta::days(7));
        assert!(cutoff <= after - TimeDelta::days(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_prune_does_not_stop_runner() {
        let repo = Arc::new(RecordingRepo {
            fail_first: true,
            ..Default::default()
        });
        let (shutdown, _ready, task) = spawn_runner(&repo, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(25)).await;

        assert!(!task.is_finished());
        assert_eq!(repo.calls(), 3);
        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_prune_after_stop() {
        let repo = Arc::new(RecordingRepo::default());
        let (shutdown, _ready, task) = spawn_runner(&repo, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(5)).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(repo.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_prune_completes_on_stop() {
        let repo = Arc::new(RecordingRepo {
            prune_takes: Duration::from_secs(30),
            ..Default::default()
        });
        let (shutdown, _ready, task) = spawn_runner(&repo, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(repo.completed.load(Ordering::SeqCst), 0);

        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(repo.calls(), 1);
        assert_eq!(repo.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_prune_delays_instead_of_bursting() {
        let repo = Arc::new(RecordingRepo {
            prune_takes: Duration::from_secs(25),
            ..Default::default()
        });
        let (shutdown, _ready, task) = spawn_runner(&repo, Duration::from_secs(10));

        // Prunes start at 0s, 25s, 50s: each missed tick fires once when
        // the previous prune returns, then the schedule shifts.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(repo.calls(), 3);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}

//! Ordered process group.
//!
//! Members start one at a time in declared order; each must report ready
//! before the next one starts. After startup the group waits for either an
//! external shutdown request or any member exiting on its own. Either way
//! every running member is cancelled in reverse start order and awaited, and
//! the first failure (if any) becomes the group's result.

use std::{future::Future, pin::pin};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Error a member returns from [`Runnable::run`].
pub type MemberError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{name} failed: {source}")]
    Member { name: String, source: MemberError },

    #[error("{name} exited before becoming ready")]
    ExitedBeforeReady { name: String },

    #[error("{name} exited unexpectedly")]
    UnexpectedExit { name: String },
}

/// Readiness handle passed to a member at start.
///
/// Dropping it without calling [`Ready::notify`] means the member never
/// became ready.
#[derive(Debug)]
pub struct Ready(Option<oneshot::Sender<()>>);

impl Ready {
    pub(crate) fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    /// Mark the member ready. Later calls are no-ops.
    pub fn notify(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

/// A long-running group member.
#[async_trait]
pub trait Runnable: Send {
    /// Run until `shutdown` is cancelled or the member fails.
    ///
    /// Returning while `shutdown` is not cancelled is treated as a failure of
    /// the whole group.
    async fn run(self: Box<Self>, ready: Ready, shutdown: CancellationToken)
    -> Result<(), MemberError>;
}

pub struct Member {
    pub name: String,
    pub runnable: Box<dyn Runnable>,
}

impl Member {
    pub fn new(name: impl Into<String>, runnable: impl Runnable + 'static) -> Self {
        Self {
            name: name.into(),
            runnable: Box::new(runnable),
        }
    }
}

/// Sends the member index when the member task finishes, panics included.
struct ExitNotice {
    index: usize,
    tx: mpsc::UnboundedSender<usize>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.tx.send(self.index);
    }
}

struct Running {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<Result<(), MemberError>>>,
}

impl Running {
    /// Wait for the member task and turn its outcome into a group error.
    ///
    /// `requested` is whether the member was asked to stop; a clean exit
    /// that was not requested is itself a failure.
    async fn collect(&mut self, requested: bool) -> Option<SupervisorError> {
        let handle = self.handle.take()?;
        match handle.await {
            Ok(Ok(())) if requested => {
                tracing::info!(member = %self.name, "Member stopped");
                None
            }
            Ok(Ok(())) => {
                tracing::error!(member = %self.name, "Member exited unexpectedly");
                Some(SupervisorError::UnexpectedExit {
                    name: self.name.clone(),
                })
            }
            Ok(Err(source)) => {
                tracing::error!(member = %self.name, error = %source, "Member failed");
                Some(SupervisorError::Member {
                    name: self.name.clone(),
                    source,
                })
            }
            Err(join_error) => {
                tracing::error!(member = %self.name, error = %join_error, "Member task aborted");
                Some(SupervisorError::Member {
                    name: self.name.clone(),
                    source: Box::new(join_error),
                })
            }
        }
    }
}

/// Why startup or monitoring ended.
enum Trigger {
    Shutdown,
    Exited(usize),
    NotReady(usize),
}

pub struct ProcessSupervisor {
    members: Vec<Member>,
}

impl ProcessSupervisor {
    pub fn new(members: Vec<Member>) -> Self {
        Self { members }
    }

    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.name.as_str())
    }

    /// Run the group until `shutdown` resolves or a member exits.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), SupervisorError> {
        let mut shutdown = pin!(shutdown);
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let mut running: Vec<Running> = Vec::with_capacity(self.members.len());
        let mut trigger = None;

        for (index, member) in self.members.into_iter().enumerate() {
            let token = CancellationToken::new();
            let (ready, mut ready_rx) = Ready::new();
            let notice = ExitNotice {
                index,
                tx: exit_tx.clone(),
            };
            let span = tracing::info_span!("member", name = %member.name);
            let member_token = token.clone();
            let runnable = member.runnable;

            tracing::info!(member = %member.name, "Starting member");
            let handle = tokio::spawn(
                async move {
                    let _notice = notice;
                    runnable.run(ready, member_token).await
                }
                .instrument(span),
            );
            running.push(Running {
                name: member.name,
                token,
                handle: Some(handle),
            });

            let mut ready_dropped = false;
            let outcome = loop {
                // Readiness is sent before the member can exit, so it is
                // checked first.
                tokio::select! {
                    biased;
                    result = &mut ready_rx, if !ready_dropped => match result {
                        Ok(()) => break None,
                        // Sender gone: the exit notice follows.
                        Err(_) => ready_dropped = true,
                    },
                    Some(exited) = exit_rx.recv() => {
                        break Some(if exited == index {
                            Trigger::NotReady(exited)
                        } else {
                            Trigger::Exited(exited)
                        });
                    }
                    _ = &mut shutdown => break Some(Trigger::Shutdown),
                }
            };

            if outcome.is_some() {
                trigger = outcome;
                break;
            }
            tracing::info!(member = %running[index].name, "Member ready");
        }

        let trigger = match trigger {
            Some(trigger) => trigger,
            None => {
                tracing::info!(members = running.len(), "All members ready");
                tokio::select! {
                    _ = &mut shutdown => Trigger::Shutdown,
                    Some(exited) = exit_rx.recv() => Trigger::Exited(exited),
                }
            }
        };

        let mut first_error = match trigger {
            Trigger::Shutdown => {
                tracing::info!("Shutdown requested, stopping members");
                None
            }
            Trigger::Exited(index) => running[index].collect(false).await,
            Trigger::NotReady(index) => match running[index].collect(false).await {
                Some(SupervisorError::UnexpectedExit { name }) => {
                    Some(SupervisorError::ExitedBeforeReady { name })
                }
                other => other,
            },
        };

        for member in running.iter_mut().rev() {
            member.token.cancel();
            if let Some(err) = member.collect(true).await {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

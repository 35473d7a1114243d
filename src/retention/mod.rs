//! Periodic pruning of the retention stores.
//!
//! Each store gets its own [`PeriodicRunner`] driving a [`PruningPolicy`]:
//! the runner decides when, the policy decides what (everything older than
//! `cutoff_days`). Deletion is batched inside the repository so no single
//! statement holds locks on a large range of rows.

mod policy;
mod runner;

pub use policy::{PruneOutcome, PruningPolicy};
pub use runner::PeriodicRunner;

//! Observability: structured logging via `tracing`.
//!
//! Every group member logs inside its own span named after the member, so
//! log lines can be attributed to the lock maintainer or a specific store
//! runner.

mod tracing_init;

pub use tracing_init::*;

//! Replicated retention pruner.
//!
//! Periodically deletes rows older than a configured age from the instance
//! metrics, app metrics and scaling history stores. Replicas elect a single
//! active pruner through a TTL lock held either in a shared database table
//! or in Consul.

#[cfg(not(any(feature = "database-sqlite", feature = "database-postgres")))]
compile_error!("enable at least one of the `database-sqlite` or `database-postgres` features");

pub mod config;
pub mod daemon;
pub mod db;
pub mod lock;
pub mod models;
#[cfg(feature = "daemon")]
pub mod observability;
pub mod retention;
pub mod supervisor;

//! Shared database repository test infrastructure
//!
//! Each repository test module contains shared test functions that take
//! `&dyn XxxRepo`, then instantiates them against SQLite (in-memory, run with
//! every `cargo test`) and PostgreSQL (testcontainers, marked `#[ignore]`).
//!
//! ```bash
//! cargo test                       # Run fast SQLite tests only
//! cargo test -- --ignored          # Run PostgreSQL integration tests (requires Docker)
//! ```

pub mod harness;

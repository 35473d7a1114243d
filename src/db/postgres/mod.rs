mod common;
mod lock;
mod retention;

pub use lock::PostgresLockRepo;
pub use retention::PostgresRetentionRepo;

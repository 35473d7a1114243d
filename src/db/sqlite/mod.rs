mod common;
mod lock;
mod retention;

pub use lock::SqliteLockRepo;
pub use retention::SqliteRetentionRepo;

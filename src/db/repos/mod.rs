pub(crate) mod lock;
pub(crate) mod retention;

pub use lock::LockRepo;
pub use retention::{RetentionRepo, RetentionTable};

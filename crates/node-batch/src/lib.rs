//! Batch operations on remote nodes with a concurrency ceiling.
//!
//! Quota and foreign-node failures stop meaning "one item failed": they are
//! raised once for the whole batch after every operation has finished.

mod error;
mod nodes;
mod runner;

pub use error::BatchError;
pub use nodes::NodeBatchRunner;
pub use runner::{BatchConfig, BatchOutcome, BatchResult, UsageCache, run_batch};

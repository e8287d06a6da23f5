//! Component B: the queue store, and Component H: the testcase content cache.

pub mod cache;
pub mod queue;
pub mod state_markers;

pub use cache::TestcaseCache;
pub use queue::{SeedId, SeedRecord, QueueStore};
pub use state_markers::{mark_det_done, mark_redundant, mark_variable};

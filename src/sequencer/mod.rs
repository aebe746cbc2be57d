pub mod backoff;
pub mod merge;

pub use backoff::{BackoffConfig, BackoffTracker};
pub use merge::{MergeConfig, MergeScheduler, MergeStats, SequencerError};

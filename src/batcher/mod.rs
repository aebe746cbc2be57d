pub mod accumulator;
pub mod runner;

pub use accumulator::{
    AccumulatedGroup, AccumulatorConfig, BatchAccumulator, FlushReason, GroupPolicy,
};
pub use runner::{run_accumulator, BatcherError};

pub mod channel;
pub mod runner;

pub use channel::{create_channel, Receiver, Sender};
pub use runner::{Destination, Pipeline, PipelineError, PipelineHandle, PipelineReport, PipelineSettings};

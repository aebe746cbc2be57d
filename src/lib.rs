pub mod batcher;
pub mod cli;
pub mod config;
pub mod pipeline;
pub mod sequencer;
pub mod source;
pub mod storage;
pub mod writer;

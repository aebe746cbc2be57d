pub mod batch;
pub mod partition;
pub mod reader;
pub mod timestamp;

pub use batch::MessageBatch;
pub use partition::PartitionSource;
pub use reader::{FeedStats, PartitionFeeder, ReaderError};
pub use timestamp::{TimestampError, TimestampExtractor};

pub mod blob_path;
pub mod codec;
pub mod location;
pub mod log_writer;

pub use blob_path::{BlobPath, FileFormat};
pub use location::{LogLocation, RotationPolicy, RotationReason};
pub use log_writer::{EventPolicy, LogWriter, LogWriterConfig, WriterError};

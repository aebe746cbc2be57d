pub mod block;
pub mod checkpoint;
pub mod local;
pub mod memory;
pub mod traits;

pub use block::{BlockId, BlockInfo, BlockListFilter};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointManager};
pub use local::{LocalBlockStore, LocalCheckpointStore};
pub use memory::{MemoryBlockStore, MemoryCheckpointStore};
pub use traits::{BlockStore, CheckpointStore, StorageError};

use crate::storage::block::{BlockId, BlockInfo, BlockListFilter};
use crate::storage::checkpoint::Checkpoint;
use async_trait::async_trait;

/// Append-only, block-structured blob storage for one destination.
///
/// Blocks are staged with `write_block` and only become part of the blob once listed in
/// `commit_blocks`. A commit replaces the blob's block list with exactly the ids given.
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn write_block(&self, blob: &str, id: BlockId, payload: &[u8]) -> Result<(), StorageError>;

    async fn commit_blocks(&self, blob: &str, ids: &[BlockId]) -> Result<(), StorageError>;

    async fn list_blocks(
        &self,
        blob: &str,
        filter: BlockListFilter,
    ) -> Result<Vec<BlockInfo>, StorageError>;

    /// Committed length of the blob in bytes (0 when missing).
    async fn length(&self, blob: &str) -> Result<u64, StorageError>;

    async fn exists(&self, blob: &str) -> Result<bool, StorageError>;

    fn is_read_only(&self) -> bool {
        false
    }
}

/// Durable home of the checkpoint document, one per destination.
///
/// `save` must replace the previous document atomically from a reader's perspective.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, destination: &str) -> Result<Option<Checkpoint>, StorageError>;

    async fn save(&self, destination: &str, checkpoint: &Checkpoint) -> Result<(), StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("block {block} not found for blob '{blob}'")]
    BlockNotFound { blob: String, block: BlockId },

    #[error("store is read-only")]
    ReadOnly,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt storage metadata: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Unavailable(_) => true,
            StorageError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

use super::block::{BlockId, BlockInfo, BlockListFilter};
use super::checkpoint::Checkpoint;
use super::traits::{BlockStore, CheckpointStore, StorageError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default, Clone)]
struct BlobState {
    staged: HashMap<BlockId, Vec<u8>>,
    committed: Vec<(BlockId, Vec<u8>)>,
}

impl BlobState {
    fn length(&self) -> u64 {
        self.committed.iter().map(|(_, data)| data.len() as u64).sum()
    }
}

/// In-process block store.
///
/// Used by tests and dry runs. Transient failures can be injected with
/// `fail_next_operations`, and the store can be switched read-only.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blobs: Mutex<HashMap<String, BlobState>>,
    fail_next: AtomicU32,
    read_only: AtomicBool,
    commits: AtomicU32,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` write/commit calls fail with a transient error.
    pub fn fail_next_operations(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Number of successful `commit_blocks` calls.
    pub fn commit_count(&self) -> u32 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Committed content of a blob.
    pub fn contents(&self, blob: &str) -> Option<Vec<u8>> {
        let blobs = self.lock();
        let state = blobs.get(blob)?;
        if state.committed.is_empty() {
            return None;
        }
        Some(state.committed.iter().flat_map(|(_, data)| data.iter().copied()).collect())
    }

    /// Committed blocks of a blob, in order.
    pub fn committed_blocks(&self, blob: &str) -> Vec<(BlockId, Vec<u8>)> {
        self.lock()
            .get(blob)
            .map(|state| state.committed.clone())
            .unwrap_or_default()
    }

    /// Names of blobs with committed content, sorted.
    pub fn blob_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .lock()
            .iter()
            .filter(|(_, state)| !state.committed.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BlobState>> {
        // a panic while holding the lock leaves the map consistent
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_injected_failure(&self) -> Result<(), StorageError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn write_block(&self, blob: &str, id: BlockId, payload: &[u8]) -> Result<(), StorageError> {
        self.check_writable()?;
        self.check_injected_failure()?;
        self.lock()
            .entry(blob.to_string())
            .or_default()
            .staged
            .insert(id, payload.to_vec());
        Ok(())
    }

    async fn commit_blocks(&self, blob: &str, ids: &[BlockId]) -> Result<(), StorageError> {
        self.check_writable()?;
        self.check_injected_failure()?;

        let mut blobs = self.lock();
        let state = blobs.entry(blob.to_string()).or_default();

        let mut committed = Vec::with_capacity(ids.len());
        for id in ids {
            let data = match state.staged.get(id) {
                Some(data) => data.clone(),
                None => state
                    .committed
                    .iter()
                    .find(|(existing, _)| existing == id)
                    .map(|(_, data)| data.clone())
                    .ok_or_else(|| StorageError::BlockNotFound {
                        blob: blob.to_string(),
                        block: *id,
                    })?,
            };
            committed.push((*id, data));
        }

        state.committed = committed;
        state.staged.clear();
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_blocks(
        &self,
        blob: &str,
        filter: BlockListFilter,
    ) -> Result<Vec<BlockInfo>, StorageError> {
        let blobs = self.lock();
        let Some(state) = blobs.get(blob) else {
            return Ok(Vec::new());
        };

        let mut blocks: Vec<BlockInfo> = Vec::new();
        if filter.includes(true) {
            blocks.extend(state.committed.iter().map(|(id, data)| BlockInfo {
                id: *id,
                size: data.len() as u64,
                committed: true,
            }));
        }
        if filter.includes(false) {
            let mut staged: Vec<_> = state
                .staged
                .iter()
                .map(|(id, data)| BlockInfo {
                    id: *id,
                    size: data.len() as u64,
                    committed: false,
                })
                .collect();
            staged.sort_by_key(|block| block.id);
            blocks.extend(staged);
        }
        Ok(blocks)
    }

    async fn length(&self, blob: &str) -> Result<u64, StorageError> {
        Ok(self.lock().get(blob).map(BlobState::length).unwrap_or(0))
    }

    async fn exists(&self, blob: &str) -> Result<bool, StorageError> {
        Ok(self
            .lock()
            .get(blob)
            .is_some_and(|state| !state.committed.is_empty()))
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }
}

/// In-process checkpoint store keyed by destination.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    documents: Mutex<HashMap<String, Checkpoint>>,
    fail_saves: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `save` fail until switched back.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Overwrite a document directly, bypassing failure injection.
    pub fn put(&self, destination: &str, checkpoint: Checkpoint) {
        self.lock().insert(destination.to_string(), checkpoint);
    }

    pub fn get(&self, destination: &str) -> Option<Checkpoint> {
        self.lock().get(destination).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Checkpoint>> {
        self.documents.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, destination: &str) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self.get(destination))
    }

    async fn save(&self, destination: &str, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("checkpoint store unavailable".to_string()));
        }
        self.put(destination, checkpoint.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: u16) -> Vec<BlockId> {
        BlockId::new(n).sequence_through()
    }

    #[tokio::test]
    async fn test_staged_blocks_invisible_until_commit() {
        let store = MemoryBlockStore::new();
        store.write_block("a", BlockId::new(1), b"hello").await.unwrap();

        assert!(!store.exists("a").await.unwrap());
        assert_eq!(store.length("a").await.unwrap(), 0);

        store.commit_blocks("a", &ids(1)).await.unwrap();
        assert!(store.exists("a").await.unwrap());
        assert_eq!(store.length("a").await.unwrap(), 5);
        assert_eq!(store.contents("a").unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_commit_full_list_appends() {
        let store = MemoryBlockStore::new();
        store.write_block("a", BlockId::new(1), b"ab").await.unwrap();
        store.commit_blocks("a", &ids(1)).await.unwrap();
        store.write_block("a", BlockId::new(2), b"cd").await.unwrap();
        store.commit_blocks("a", &ids(2)).await.unwrap();

        assert_eq!(store.contents("a").unwrap(), b"abcd");
        let blocks = store.list_blocks("a", BlockListFilter::All).await.unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.committed));
    }

    #[tokio::test]
    async fn test_commit_unknown_block_fails() {
        let store = MemoryBlockStore::new();
        let err = store.commit_blocks("a", &ids(1)).await.unwrap_err();
        assert!(matches!(err, StorageError::BlockNotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_uncommitted() {
        let store = MemoryBlockStore::new();
        store.write_block("a", BlockId::new(1), b"x").await.unwrap();
        store.commit_blocks("a", &ids(1)).await.unwrap();
        store.write_block("a", BlockId::new(2), b"yy").await.unwrap();

        let staged = store.list_blocks("a", BlockListFilter::Uncommitted).await.unwrap();
        assert_eq!(staged, vec![BlockInfo { id: BlockId::new(2), size: 2, committed: false }]);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let store = MemoryBlockStore::new();
        store.fail_next_operations(1);
        let err = store.write_block("a", BlockId::new(1), b"x").await.unwrap_err();
        assert!(err.is_transient());
        store.write_block("a", BlockId::new(1), b"x").await.unwrap();
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let store = MemoryBlockStore::new();
        store.set_read_only(true);
        assert!(store.is_read_only());
        let err = store.write_block("a", BlockId::new(1), b"x").await.unwrap_err();
        assert!(matches!(err, StorageError::ReadOnly));
    }
}

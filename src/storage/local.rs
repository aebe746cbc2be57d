use super::block::{BlockId, BlockInfo, BlockListFilter};
use super::checkpoint::Checkpoint;
use super::traits::{BlockStore, CheckpointStore, StorageError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

const STAGING_DIR: &str = ".staging";
const MANIFEST_DIR: &str = ".blocks";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    blocks: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    id: BlockId,
    size: u64,
}

/// Directory-backed block store.
///
/// Layout under `root`:
/// - `<blob>`: committed blob content
/// - `.blocks/<blob>.json`: ordered list of committed block ids and sizes
/// - `.staging/<blob>/<id>`: staged, not yet committed blocks
///
/// Commits rebuild the blob and its manifest in temp files and rename them into place.
pub struct LocalBlockStore {
    root: PathBuf,
    read_only: bool,
    // serialises commits so concurrent writers to one root never interleave renames
    commit_lock: Mutex<()>,
}

impl LocalBlockStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_only: false,
            commit_lock: Mutex::new(()),
        }
    }

    /// Open an existing directory without permitting writes.
    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            read_only: true,
            ..Self::new(root)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of a blob's committed content.
    pub fn blob_file(&self, blob: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(checked_relative(blob)?))
    }

    fn manifest_file(&self, blob: &str) -> Result<PathBuf, StorageError> {
        let relative = checked_relative(blob)?;
        let mut path = self.root.join(MANIFEST_DIR).join(relative);
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".json");
        path.set_file_name(name);
        Ok(path)
    }

    fn staging_dir(&self, blob: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(STAGING_DIR).join(checked_relative(blob)?))
    }

    async fn load_manifest(&self, blob: &str) -> Result<Manifest, StorageError> {
        match fs::read(self.manifest_file(blob)?).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Manifest::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn staged_blocks(&self, blob: &str) -> Result<Vec<BlockInfo>, StorageError> {
        let dir = self.staging_dir(blob)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut blocks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.parse::<BlockId>().ok()) else {
                tracing::debug!(path = %entry.path().display(), "Skipping foreign file in staging");
                continue;
            };
            let size = entry.metadata().await?.len();
            blocks.push(BlockInfo {
                id,
                size,
                committed: false,
            });
        }
        blocks.sort_by_key(|block| block.id);
        Ok(blocks)
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }
}

#[async_trait]
impl BlockStore for LocalBlockStore {
    async fn write_block(&self, blob: &str, id: BlockId, payload: &[u8]) -> Result<(), StorageError> {
        self.check_writable()?;
        let dir = self.staging_dir(blob)?;
        fs::create_dir_all(&dir).await?;
        write_atomic(&dir.join(id.to_string()), payload).await?;
        tracing::debug!(blob, block = %id, bytes = payload.len(), "Staged block");
        Ok(())
    }

    async fn commit_blocks(&self, blob: &str, ids: &[BlockId]) -> Result<(), StorageError> {
        self.check_writable()?;
        let _guard = self.commit_lock.lock().await;

        let manifest = self.load_manifest(blob).await?;
        let blob_file = self.blob_file(blob)?;
        let existing = match fs::read(&blob_file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        // slice the current blob back into its committed blocks
        let mut committed: HashMap<BlockId, &[u8]> = HashMap::new();
        let mut offset = 0usize;
        for entry in &manifest.blocks {
            let end = offset + entry.size as usize;
            let bytes = existing.get(offset..end).ok_or_else(|| {
                StorageError::Corrupt(format!(
                    "manifest for '{}' describes {} bytes but blob holds {}",
                    blob,
                    end,
                    existing.len()
                ))
            })?;
            committed.insert(entry.id, bytes);
            offset = end;
        }

        let staging = self.staging_dir(blob)?;
        let mut content = Vec::with_capacity(existing.len());
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let staged_path = staging.join(id.to_string());
            let bytes = match fs::read(&staged_path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => committed
                    .get(id)
                    .map(|bytes| bytes.to_vec())
                    .ok_or_else(|| StorageError::BlockNotFound {
                        blob: blob.to_string(),
                        block: *id,
                    })?,
                Err(e) => return Err(e.into()),
            };
            entries.push(ManifestEntry {
                id: *id,
                size: bytes.len() as u64,
            });
            content.extend_from_slice(&bytes);
        }

        if let Some(parent) = blob_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        write_atomic(&blob_file, &content).await?;

        let manifest_file = self.manifest_file(blob)?;
        if let Some(parent) = manifest_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        let manifest = Manifest { blocks: entries };
        write_atomic(&manifest_file, &serde_json::to_vec(&manifest)?).await?;

        match fs::remove_dir_all(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(blob, error = %e, "Failed to clear staged blocks after commit");
            }
        }

        tracing::debug!(blob, blocks = ids.len(), bytes = content.len(), "Committed blocks");
        Ok(())
    }

    async fn list_blocks(
        &self,
        blob: &str,
        filter: BlockListFilter,
    ) -> Result<Vec<BlockInfo>, StorageError> {
        let mut blocks = Vec::new();
        if filter.includes(true) {
            let manifest = self.load_manifest(blob).await?;
            blocks.extend(manifest.blocks.into_iter().map(|entry| BlockInfo {
                id: entry.id,
                size: entry.size,
                committed: true,
            }));
        }
        if filter.includes(false) {
            blocks.extend(self.staged_blocks(blob).await?);
        }
        Ok(blocks)
    }

    async fn length(&self, blob: &str) -> Result<u64, StorageError> {
        match fs::metadata(self.blob_file(blob)?).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, blob: &str) -> Result<bool, StorageError> {
        Ok(fs::try_exists(self.blob_file(blob)?).await?)
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// One JSON checkpoint document per destination in a directory.
pub struct LocalCheckpointStore {
    dir: PathBuf,
}

impl LocalCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn document_path(&self, destination: &str) -> Result<PathBuf, StorageError> {
        let relative = checked_relative(destination)?;
        let mut path = self.dir.join(relative);
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".json");
        path.set_file_name(name);
        Ok(path)
    }
}

#[async_trait]
impl CheckpointStore for LocalCheckpointStore {
    async fn load(&self, destination: &str) -> Result<Option<Checkpoint>, StorageError> {
        let path = self.document_path(destination)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(Checkpoint::from_json(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, destination: &str, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let path = self.document_path(destination)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        write_atomic(&path, &checkpoint.to_json()?).await
    }
}

/// Reject names that would escape the store root.
fn checked_relative(name: &str) -> Result<&Path, StorageError> {
    let path = Path::new(name);
    let valid = !name.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !valid {
        return Err(StorageError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid object name '{}'", name),
        )));
    }
    Ok(path)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

use super::traits::{CheckpointStore, StorageError};
use crate::storage::block::BlockId;
use crate::writer::blob_path::FileFormat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid checkpoint: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Resume anchor for one destination.
///
/// Always describes the last write whose block commit succeeded; it is saved only after
/// that commit, never before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Checkpoint {
    pub event_position: EventPosition,
    pub block_position: BlockPosition,
    pub blob_property: BlobProperty,
}

/// Upstream read position of the last persisted item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventPosition {
    pub offset: Option<String>,
    pub enqueued_time_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockPosition {
    pub blob_name: String,
    pub block_name: BlockId,
    pub file_format: FileFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlobProperty {
    pub blob_name: String,
    pub length: u64,
}

impl Checkpoint {
    pub fn validate(&self) -> Result<()> {
        if self.block_position.blob_name != self.blob_property.blob_name {
            return Err(CheckpointError::Invalid(format!(
                "block position blob '{}' does not match blob property '{}'",
                self.block_position.blob_name, self.blob_property.blob_name
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Loads and saves the checkpoint of a single destination.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    destination: String,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, destination: impl Into<String>) -> Self {
        Self {
            store,
            destination: destination.into(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        tracing::info!(destination = %self.destination, "Loading checkpoint");

        let Some(checkpoint) = self.store.load(&self.destination).await? else {
            tracing::info!(destination = %self.destination, "No checkpoint found");
            return Ok(None);
        };

        if let Err(e) = checkpoint.validate() {
            tracing::warn!(destination = %self.destination, error = %e, "Ignoring inconsistent checkpoint");
            return Ok(None);
        }

        tracing::info!(
            destination = %self.destination,
            blob = %checkpoint.block_position.blob_name,
            block = %checkpoint.block_position.block_name,
            length = checkpoint.blob_property.length,
            "Loaded checkpoint"
        );
        Ok(Some(checkpoint))
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.store.save(&self.destination, checkpoint).await?;
        tracing::debug!(destination = %self.destination, "Checkpoint saved");
        Ok(())
    }
}

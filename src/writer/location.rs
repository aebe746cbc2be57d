use crate::storage::block::BlockId;
use crate::writer::blob_path::{BlobPath, FileFormat};
use chrono::{DateTime, Timelike, Utc};

/// Where the writer currently appends.
///
/// Owned by a single writer task and replaced wholesale on rotation; other tasks only
/// ever see clones published through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLocation {
    pub path: BlobPath,
    /// Committed bytes in the blob
    pub size: u64,
    /// Committed blocks in the blob
    pub block_count: u32,
}

impl LogLocation {
    pub fn new(path: BlobPath) -> Self {
        Self {
            path,
            size: 0,
            block_count: 0,
        }
    }

    pub fn blob_name(&self) -> String {
        self.path.to_string()
    }

    /// Id of the last committed block (`0000` when none).
    pub fn last_block(&self) -> BlockId {
        BlockId::from_count(self.block_count).unwrap_or(BlockId::MAX)
    }

    pub fn next_block(&self) -> Option<BlockId> {
        BlockId::from_count(self.block_count.saturating_add(1))
    }
}

/// Why a new blob was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    /// No location yet
    Initial,
    NewDay,
    Capacity,
    Hour,
    Format,
}

#[derive(Debug, Clone)]
pub struct RotationPolicy {
    pub epoch_marker: String,
    pub sub_path: String,
    pub format: FileFormat,
    pub max_blob_bytes: u64,
    pub max_block_count: u32,
    pub hourly: bool,
}

impl RotationPolicy {
    /// Decide whether a group stamped `time` and `incoming` bytes long fits the current
    /// location. Returns the path to switch to when it does not.
    pub fn plan(
        &self,
        current: Option<&LogLocation>,
        time: DateTime<Utc>,
        incoming: u64,
    ) -> Option<(BlobPath, RotationReason)> {
        let date = time.date_naive();
        let hour = self.hourly.then(|| time.hour());

        let Some(location) = current else {
            let path = BlobPath::new(&self.epoch_marker, &self.sub_path, date, 0, hour, self.format);
            return Some((path, RotationReason::Initial));
        };

        if date > location.path.date {
            let path = BlobPath::new(&self.epoch_marker, &self.sub_path, date, 0, hour, self.format);
            return Some((path, RotationReason::NewDay));
        }

        let reason = if location.block_count > 0
            && (location.size.saturating_add(incoming) >= self.max_blob_bytes
                || location.block_count.saturating_add(1) > self.max_block_count)
        {
            Some(RotationReason::Capacity)
        } else if location.path.hour != hour {
            Some(RotationReason::Hour)
        } else if location.path.format != self.format {
            Some(RotationReason::Format)
        } else {
            None
        };
        let reason = reason?;

        let path = BlobPath::new(
            &self.epoch_marker,
            &self.sub_path,
            location.path.date.max(date),
            location.path.index + 1,
            hour,
            self.format,
        );
        Some((path, reason))
    }
}

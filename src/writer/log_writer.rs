use crate::batcher::accumulator::{AccumulatedGroup, GroupPolicy};
use crate::config::types::{ResumeStrategy, RetryConfig, SinkConfig, WriterConfig};
use crate::source::batch::MessageBatch;
use crate::storage::block::{BlockId, BlockListFilter};
use crate::storage::checkpoint::{
    BlobProperty, BlockPosition, Checkpoint, CheckpointError, CheckpointManager, EventPosition,
};
use crate::storage::traits::{BlockStore, StorageError};
use crate::writer::blob_path::{BlobPath, BlobPathError, FileFormat};
use crate::writer::codec::{self, CheckpointInfo, CodecError, LogHeader};
use crate::writer::location::{LogLocation, RotationPolicy, RotationReason};
use chrono::Timelike;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("encoding error: {0}")]
    Codec(#[from] CodecError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("checkpoint names an unusable blob: {0}")]
    BlobPath(#[from] BlobPathError),

    #[error("blob '{0}' has no block ids left")]
    BlockIdsExhausted(String),
}

/// Runtime settings of one destination's writer.
#[derive(Debug, Clone)]
pub struct LogWriterConfig {
    /// Destination name; keys the checkpoint document and tags log lines
    pub destination: String,
    pub rotation: RotationPolicy,
    pub max_block_bytes: usize,
    pub retry: RetryConfig,
    pub resume: ResumeStrategy,
    pub header: LogHeader,
    pub propagate_errors: bool,
}

impl LogWriterConfig {
    pub fn new(destination: impl Into<String>, writer: &WriterConfig, sink: &SinkConfig) -> Self {
        Self {
            destination: destination.into(),
            rotation: RotationPolicy {
                epoch_marker: writer.epoch_marker.clone(),
                sub_path: sink.sub_path.clone(),
                format: writer.format,
                max_blob_bytes: writer.max_blob_bytes,
                max_block_count: writer.max_block_count,
                hourly: writer.hourly_rotation,
            },
            max_block_bytes: writer.max_block_bytes,
            retry: writer.retry,
            resume: writer.resume,
            header: writer.header.clone(),
            propagate_errors: sink.propagate_errors,
        }
    }

    pub fn format(&self) -> FileFormat {
        self.rotation.format
    }

    /// Grouping rules matching this writer's blocks and rotation.
    pub fn event_policy(&self) -> EventPolicy {
        EventPolicy::new(self.rotation.format, self.rotation.hourly)
    }
}

/// Measures events by the bytes they will occupy in a block, and keeps events of
/// different days (or hours, with hourly rotation) out of the same group.
#[derive(Debug, Clone, Copy)]
pub struct EventPolicy {
    format: FileFormat,
    hourly: bool,
}

impl EventPolicy {
    pub fn new(format: FileFormat, hourly: bool) -> Self {
        Self { format, hourly }
    }
}

impl GroupPolicy<MessageBatch> for EventPolicy {
    fn measure(&self, item: &MessageBatch) -> usize {
        codec::encoded_event_len(self.format, &item.payload)
    }

    fn starts_new_group(&self, last: &MessageBatch, item: &MessageBatch) -> bool {
        let (last, next) = (last.enqueued_time_utc, item.enqueued_time_utc);
        last.date_naive() != next.date_naive() || (self.hourly && last.hour() != next.hour())
    }
}

/// Checkpointed, rotating writer for one destination.
///
/// Processes one group at a time: decide the blob, stage a block, commit the full block
/// list, then persist the checkpoint. The location is owned here and published to other
/// tasks as watch snapshots.
pub struct LogWriter {
    config: LogWriterConfig,
    store: Arc<dyn BlockStore>,
    checkpoints: CheckpointManager,
    location: Option<LogLocation>,
    snapshot: watch::Sender<Option<LogLocation>>,
    mirror: Option<mpsc::Sender<AccumulatedGroup<MessageBatch>>>,
}

impl LogWriter {
    pub fn new(
        config: LogWriterConfig,
        store: Arc<dyn BlockStore>,
        checkpoints: CheckpointManager,
    ) -> Self {
        let (snapshot, _) = watch::channel(None);
        Self {
            config,
            store,
            checkpoints,
            location: None,
            snapshot,
            mirror: None,
        }
    }

    /// Forward every committed group to another destination's writer.
    pub fn with_mirror(mut self, mirror: mpsc::Sender<AccumulatedGroup<MessageBatch>>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn destination(&self) -> &str {
        &self.config.destination
    }

    pub fn format(&self) -> FileFormat {
        self.config.format()
    }

    pub fn event_policy(&self) -> EventPolicy {
        self.config.event_policy()
    }

    pub fn location(&self) -> Option<&LogLocation> {
        self.location.as_ref()
    }

    /// Read-only view of the location, updated after every commit.
    pub fn subscribe(&self) -> watch::Receiver<Option<LogLocation>> {
        self.snapshot.subscribe()
    }

    /// Seed the location from the checkpoint. Call once before writing.
    ///
    /// Returns the loaded checkpoint so the host can position its readers.
    pub async fn resume(&mut self) -> Result<Option<Checkpoint>, WriterError> {
        let Some(checkpoint) = self.checkpoints.load().await? else {
            return Ok(None);
        };

        let blob = checkpoint.block_position.blob_name.clone();
        let path: BlobPath = blob.parse()?;
        let mut location = LogLocation {
            path,
            size: checkpoint.blob_property.length,
            block_count: u32::from(checkpoint.block_position.block_name.value()),
        };

        match self.config.resume {
            ResumeStrategy::UseCheckpointPosition => {}
            ResumeStrategy::SynchronizeWithStorage => match self.synchronize(&blob).await {
                Ok((block_count, size)) => {
                    if block_count != location.block_count || size != location.size {
                        info!(
                            destination = %self.config.destination,
                            blob = %blob,
                            checkpoint_blocks = location.block_count,
                            storage_blocks = block_count,
                            checkpoint_size = location.size,
                            storage_size = size,
                            "Checkpoint is stale, adopting storage position"
                        );
                    }
                    location.block_count = block_count;
                    location.size = size;
                }
                Err(e) => {
                    warn!(
                        destination = %self.config.destination,
                        blob = %blob,
                        error = %e,
                        "Failed to read storage position, falling back to checkpoint"
                    );
                }
            },
            ResumeStrategy::ResetToZero => {
                location.block_count = 0;
                location.size = 0;
            }
        }

        info!(
            destination = %self.config.destination,
            blob = %blob,
            blocks = location.block_count,
            size = location.size,
            strategy = ?self.config.resume,
            "Writer resumed"
        );
        self.snapshot.send_replace(Some(location.clone()));
        self.location = Some(location);
        Ok(Some(checkpoint))
    }

    /// Live block count and length of a blob, committing a staged tail block left behind
    /// by a crash between write and commit.
    async fn synchronize(&self, blob: &str) -> Result<(u32, u64), StorageError> {
        let blocks = self.store.list_blocks(blob, BlockListFilter::All).await?;
        let mut committed = blocks.iter().filter(|b| b.committed).count() as u32;

        if !self.store.is_read_only() {
            if let Some(next) = BlockId::from_count(committed + 1) {
                let staged = blocks.iter().any(|b| !b.committed && b.id == next);
                if staged {
                    self.store.commit_blocks(blob, &next.sequence_through()).await?;
                    info!(
                        destination = %self.config.destination,
                        blob,
                        block = %next,
                        "Committed staged tail block"
                    );
                    committed += 1;
                }
            }
        }

        let size = self.store.length(blob).await?;
        Ok((committed, size))
    }

    /// Consume groups until the input closes.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<AccumulatedGroup<MessageBatch>>,
        ct: CancellationToken,
    ) -> Result<(), WriterError> {
        info!(destination = %self.config.destination, "Log writer started");

        let mut groups = 0u64;
        let mut bytes = 0u64;
        while let Some(group) = input.recv().await {
            let Some(written) = self.commit_group(group, &ct).await? else {
                // later groups must not move the checkpoint past the abandoned one
                info!(
                    destination = %self.config.destination,
                    "Stopping after abandoned write, remaining groups left unwritten"
                );
                break;
            };
            bytes += written;
            groups += 1;
        }

        info!(
            destination = %self.config.destination,
            groups,
            bytes,
            "Log writer shutdown complete"
        );
        Ok(())
    }

    /// Persist one group. Returns the bytes committed, 0 when the write was abandoned.
    pub async fn write_group(
        &mut self,
        group: AccumulatedGroup<MessageBatch>,
        ct: &CancellationToken,
    ) -> Result<u64, WriterError> {
        Ok(self.commit_group(group, ct).await?.unwrap_or(0))
    }

    /// `Ok(None)` when cancellation abandoned the write.
    async fn commit_group(
        &mut self,
        group: AccumulatedGroup<MessageBatch>,
        ct: &CancellationToken,
    ) -> Result<Option<u64>, WriterError> {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            return Ok(Some(0));
        };
        let time = first.enqueued_time_utc;
        let event_position = EventPosition {
            offset: Some(last.offset.clone()),
            enqueued_time_utc: Some(last.enqueued_time_utc),
        };

        // the prefix counts toward the blob size, so it is sized before planning
        let appended = match &self.location {
            Some(location) if location.block_count > 0 => {
                let block = location.next_block().unwrap_or(BlockId::MAX);
                let info = CheckpointInfo::for_group(block, &group.items);
                codec::encode_prefix(self.config.format(), None, &info)?.len()
            }
            _ => 0,
        };

        let mut target = match self.config.rotation.plan(
            self.location.as_ref(),
            time,
            (appended + group.size) as u64,
        ) {
            Some((path, reason)) => match self.fresh_location(path, reason, ct).await {
                Ok(Some(location)) => location,
                Ok(None) => return Ok(None),
                Err(e) => return self.fail(e),
            },
            None => match &self.location {
                Some(location) => location.clone(),
                None => return Ok(Some(0)),
            },
        };

        let blob = target.blob_name();
        let block = target
            .next_block()
            .ok_or_else(|| WriterError::BlockIdsExhausted(blob.clone()))?;

        let header = (target.block_count == 0).then_some(&self.config.header);
        let info = CheckpointInfo::for_group(block, &group.items);
        let mut payload = codec::encode_prefix(self.config.format(), header, &info)?;
        let expected = payload.len() + group.size;
        codec::encode_events(self.config.format(), &group.items, &mut payload)?;

        if payload.len() != expected {
            warn!(
                destination = %self.config.destination,
                blob = %blob,
                expected,
                actual = payload.len(),
                "Block length differs from measured group size"
            );
        }
        if payload.len() > self.config.max_block_bytes {
            warn!(
                destination = %self.config.destination,
                blob = %blob,
                size = payload.len(),
                limit = self.config.max_block_bytes,
                "Block exceeds maximum block size"
            );
        }

        let ids = block.sequence_through();
        let store = self.store.as_ref();
        let (blob_ref, payload_ref, ids_ref) = (blob.as_str(), payload.as_slice(), ids.as_slice());
        let outcome = self
            .with_retry(ct, "write block", move || async move {
                store.write_block(blob_ref, block, payload_ref).await?;
                store.commit_blocks(blob_ref, ids_ref).await
            })
            .await;

        match outcome {
            Ok(Some(())) => {}
            Ok(None) => {
                info!(
                    destination = %self.config.destination,
                    blob = %blob,
                    block = %block,
                    "Write abandoned on cancellation"
                );
                return Ok(None);
            }
            Err(e) => return self.fail(e),
        }

        target.size += payload.len() as u64;
        target.block_count += 1;
        debug!(
            destination = %self.config.destination,
            blob = %blob,
            block = %block,
            items = group.len(),
            bytes = payload.len(),
            "Committed block"
        );

        let checkpoint = Checkpoint {
            event_position,
            block_position: BlockPosition {
                blob_name: blob.clone(),
                block_name: block,
                file_format: target.path.format,
            },
            blob_property: BlobProperty {
                blob_name: blob.clone(),
                length: target.size,
            },
        };

        self.snapshot.send_replace(Some(target.clone()));
        self.location = Some(target);

        if let Err(e) = self.checkpoints.save(&checkpoint).await {
            warn!(
                destination = %self.config.destination,
                blob = %blob,
                error = %e,
                "Failed to save checkpoint"
            );
        }

        self.forward(group).await;
        Ok(Some(payload.len() as u64))
    }

    /// Location for a rotation, skipping paths that already exist in the store.
    async fn fresh_location(
        &self,
        mut path: BlobPath,
        reason: RotationReason,
        ct: &CancellationToken,
    ) -> Result<Option<LogLocation>, StorageError> {
        let store = self.store.as_ref();
        loop {
            let name = path.to_string();
            let name_ref = name.as_str();
            let Some(exists) = self
                .with_retry(ct, "probe blob", move || store.exists(name_ref))
                .await?
            else {
                return Ok(None);
            };
            if !exists {
                break;
            }
            debug!(destination = %self.config.destination, blob = %name, "Blob exists, skipping index");
            path = path.with_index(path.index + 1);
        }

        info!(
            destination = %self.config.destination,
            blob = %path,
            reason = ?reason,
            "Rotating to new blob"
        );
        Ok(Some(LogLocation::new(path)))
    }

    /// Run `op`, retrying transient failures after the configured fixed delay.
    ///
    /// `Ok(None)` means cancellation fired while a retry was pending.
    async fn with_retry<T, F, Fut>(
        &self,
        ct: &CancellationToken,
        operation: &str,
        mut op: F,
    ) -> Result<Option<T>, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(Some(value)),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        destination = %self.config.destination,
                        operation,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Transient storage failure, retrying"
                    );
                    tokio::select! {
                        _ = ct.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(self.config.retry.delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn fail(&self, e: StorageError) -> Result<Option<u64>, WriterError> {
        if self.config.propagate_errors {
            error!(destination = %self.config.destination, error = %e, "Write failed");
            return Err(e.into());
        }
        error!(
            destination = %self.config.destination,
            error = %e,
            "Write failed, group discarded"
        );
        Ok(Some(0))
    }

    async fn forward(&mut self, group: AccumulatedGroup<MessageBatch>) {
        let Some(mirror) = &self.mirror else {
            return;
        };
        if mirror.send(group).await.is_err() {
            warn!(
                destination = %self.config.destination,
                "Mirror channel closed, forwarding stopped"
            );
            self.mirror = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::accumulator::FlushReason;
    use crate::storage::memory::{MemoryBlockStore, MemoryCheckpointStore};
    use crate::writer::codec::{decode_binary, Frame};
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryBlockStore>,
        checkpoints: Arc<MemoryCheckpointStore>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryBlockStore::new()),
                checkpoints: Arc::new(MemoryCheckpointStore::new()),
            }
        }

        fn writer(&self, config: LogWriterConfig) -> LogWriter {
            LogWriter::new(
                config,
                self.store.clone(),
                CheckpointManager::new(self.checkpoints.clone(), "primary"),
            )
        }

        fn checkpoint(&self) -> Checkpoint {
            self.checkpoints.get("primary").unwrap()
        }
    }

    fn config() -> LogWriterConfig {
        LogWriterConfig {
            destination: "primary".to_string(),
            rotation: RotationPolicy {
                epoch_marker: "20260101".to_string(),
                sub_path: "events".to_string(),
                format: FileFormat::Binary,
                max_blob_bytes: 1 << 20,
                max_block_count: 100,
                hourly: false,
            },
            max_block_bytes: 1 << 16,
            retry: RetryConfig {
                delay: Duration::from_millis(10),
                max_attempts: 10,
            },
            resume: ResumeStrategy::SynchronizeWithStorage,
            header: LogHeader::default(),
            propagate_errors: true,
        }
    }

    fn ts(day: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, h, m, s).unwrap()
    }

    fn group(items: &[(&str, DateTime<Utc>, &str)]) -> AccumulatedGroup<MessageBatch> {
        let policy = EventPolicy::new(FileFormat::Binary, false);
        let items: Vec<_> = items
            .iter()
            .map(|(offset, time, payload)| MessageBatch::new("0", *offset, *time, *payload))
            .collect();
        let size = items.iter().map(|i| policy.measure(i)).sum();
        AccumulatedGroup {
            items,
            size,
            reason: FlushReason::Capacity,
        }
    }

    const FIRST_BLOB: &str = "20260101/events/2026/03/01_0000000000.bin";

    #[tokio::test]
    async fn test_first_block_carries_header() {
        let h = Harness::new();
        let mut writer = h.writer(config());
        let ct = CancellationToken::new();

        let written = writer
            .write_group(group(&[("0", ts(1, 18, 24, 45), "a"), ("2", ts(1, 18, 25, 0), "b")]), &ct)
            .await
            .unwrap();
        assert!(written > 0);

        let frames = decode_binary(&h.store.contents(FIRST_BLOB).unwrap()).unwrap();
        assert_eq!(frames[0], Frame::Magic);
        assert!(matches!(frames[1], Frame::Header(_)));
        assert_eq!(frames[2], Frame::Event(b"a".to_vec()));
        assert_eq!(frames.len(), 4);

        let checkpoint = h.checkpoint();
        assert_eq!(checkpoint.block_position.blob_name, FIRST_BLOB);
        assert_eq!(checkpoint.block_position.block_name, BlockId::new(1));
        assert_eq!(checkpoint.event_position.offset.as_deref(), Some("2"));
        assert_eq!(checkpoint.event_position.enqueued_time_utc, Some(ts(1, 18, 25, 0)));
        assert_eq!(checkpoint.blob_property.length, written);
    }

    #[tokio::test]
    async fn test_second_block_appends_with_checkpoint_info() {
        let h = Harness::new();
        let mut writer = h.writer(config());
        let ct = CancellationToken::new();

        let first = writer.write_group(group(&[("0", ts(1, 18, 24, 45), "a")]), &ct).await.unwrap();
        let second = writer.write_group(group(&[("2", ts(1, 19, 21, 13), "b")]), &ct).await.unwrap();

        assert_eq!(h.store.blob_names(), vec![FIRST_BLOB.to_string()]);
        let blocks = h.store.committed_blocks(FIRST_BLOB);
        assert_eq!(blocks.len(), 2);

        let frames = decode_binary(&blocks[1].1).unwrap();
        assert!(matches!(&frames[0], Frame::CheckpointInfo(info) if info.block == BlockId::new(2)));

        let location = writer.location().unwrap();
        assert_eq!(location.block_count, 2);
        assert_eq!(location.size, first + second);
        assert_eq!(h.checkpoint().blob_property.length, first + second);
    }

    #[tokio::test]
    async fn test_day_boundary_starts_new_blob() {
        let h = Harness::new();
        let mut writer = h.writer(config());
        let ct = CancellationToken::new();

        writer.write_group(group(&[("0", ts(1, 18, 24, 45), "a")]), &ct).await.unwrap();
        writer.write_group(group(&[("1", ts(1, 19, 21, 13), "b")]), &ct).await.unwrap();
        writer.write_group(group(&[("2", ts(2, 0, 5, 0), "c")]), &ct).await.unwrap();

        assert_eq!(
            h.store.blob_names(),
            vec![
                FIRST_BLOB.to_string(),
                "20260101/events/2026/03/02_0000000000.bin".to_string()
            ]
        );
        assert_eq!(writer.location().unwrap().block_count, 1);
    }

    #[tokio::test]
    async fn test_capacity_rotation_increments_index() {
        let h = Harness::new();
        let mut cfg = config();
        cfg.rotation.max_blob_bytes = 100;
        let mut writer = h.writer(cfg);
        let ct = CancellationToken::new();

        writer.write_group(group(&[("0", ts(1, 10, 0, 0), "a")]), &ct).await.unwrap();
        writer.write_group(group(&[("1", ts(1, 10, 0, 1), "b")]), &ct).await.unwrap();

        assert_eq!(
            h.store.blob_names(),
            vec![
                FIRST_BLOB.to_string(),
                "20260101/events/2026/03/01_0000000001.bin".to_string()
            ]
        );
        // a new blob always starts with a header
        let second = h.store.contents("20260101/events/2026/03/01_0000000001.bin").unwrap();
        assert_eq!(decode_binary(&second).unwrap()[0], Frame::Magic);
    }

    #[tokio::test]
    async fn test_block_prefix_counts_toward_blob_size() {
        let h = Harness::new();
        let mut cfg = config();
        cfg.rotation.max_blob_bytes = 200;
        let mut writer = h.writer(cfg);
        let ct = CancellationToken::new();

        // the header block fits; the second block's events alone would too, but not
        // together with its checkpoint-info frame
        writer.write_group(group(&[("0", ts(1, 10, 0, 0), "a")]), &ct).await.unwrap();
        writer.write_group(group(&[("1", ts(1, 10, 0, 1), "b")]), &ct).await.unwrap();

        let blobs = h.store.blob_names();
        assert_eq!(blobs.len(), 2);
        for blob in &blobs {
            assert!(h.store.contents(blob).unwrap().len() <= 200);
        }
        let location = writer.location().unwrap();
        assert_eq!(location.path.index, 1);
        assert!(location.size <= 200);
    }

    #[tokio::test]
    async fn test_existing_blob_is_skipped() {
        let h = Harness::new();
        h.store.write_block(FIRST_BLOB, BlockId::new(1), b"old").await.unwrap();
        h.store.commit_blocks(FIRST_BLOB, &[BlockId::new(1)]).await.unwrap();

        let mut writer = h.writer(config());
        writer
            .write_group(group(&[("0", ts(1, 10, 0, 0), "a")]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(writer.location().unwrap().path.index, 1);
        assert_eq!(h.store.contents(FIRST_BLOB).unwrap(), b"old");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let h = Harness::new();
        let mut writer = h.writer(config());

        let ct = CancellationToken::new();
        writer.write_group(group(&[("0", ts(1, 10, 0, 0), "a")]), &ct).await.unwrap();
        h.store.fail_next_operations(2);
        let written = writer.write_group(group(&[("1", ts(1, 10, 0, 1), "b")]), &ct).await.unwrap();

        assert!(written > 0);
        assert_eq!(h.store.committed_blocks(FIRST_BLOB).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fault_writer() {
        let h = Harness::new();
        let mut cfg = config();
        cfg.retry.max_attempts = 3;
        let mut writer = h.writer(cfg);
        h.store.fail_next_operations(3);

        let err = writer
            .write_group(group(&[("0", ts(1, 10, 0, 0), "a")]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WriterError::Storage(StorageError::Unavailable(_))));
        assert!(writer.location().is_none());
        assert!(h.checkpoints.get("primary").is_none());
    }

    #[tokio::test]
    async fn test_failure_without_propagation_returns_zero() {
        let h = Harness::new();
        let mut cfg = config();
        cfg.propagate_errors = false;
        let mut writer = h.writer(cfg);
        h.store.set_read_only(true);

        let written = writer
            .write_group(group(&[("0", ts(1, 10, 0, 0), "a")]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert!(h.store.blob_names().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_abandons_pending_retry() {
        let h = Harness::new();
        let mut cfg = config();
        cfg.retry.delay = Duration::from_secs(3600);
        let mut writer = h.writer(cfg);

        let ct = CancellationToken::new();
        writer.write_group(group(&[("0", ts(1, 10, 0, 0), "a")]), &ct).await.unwrap();
        h.store.fail_next_operations(1);
        ct.cancel();

        let written = writer.write_group(group(&[("1", ts(1, 10, 0, 1), "b")]), &ct).await.unwrap();
        assert_eq!(written, 0);
        assert_eq!(h.store.committed_blocks(FIRST_BLOB).len(), 1);
        assert_eq!(h.checkpoint().block_position.block_name, BlockId::new(1));
    }

    #[tokio::test]
    async fn test_run_stops_after_abandoned_write() {
        let h = Harness::new();
        let mut cfg = config();
        cfg.retry.delay = Duration::from_secs(3600);
        let mut writer = h.writer(cfg);

        let ct = CancellationToken::new();
        writer.write_group(group(&[("0", ts(1, 10, 0, 0), "a")]), &ct).await.unwrap();
        h.store.fail_next_operations(1);
        ct.cancel();

        let (tx, rx) = mpsc::channel(4);
        tx.send(group(&[("1", ts(1, 10, 0, 1), "b")])).await.unwrap();
        tx.send(group(&[("2", ts(1, 10, 0, 2), "c")])).await.unwrap();
        drop(tx);
        writer.run(rx, ct).await.unwrap();

        // "c" would have committed, leaving "b" behind the checkpoint
        assert_eq!(h.store.committed_blocks(FIRST_BLOB).len(), 1);
        let checkpoint = h.checkpoint();
        assert_eq!(checkpoint.block_position.block_name, BlockId::new(1));
        assert_eq!(checkpoint.event_position.offset.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_checkpoint_save_failure_is_not_fatal() {
        let h = Harness::new();
        h.checkpoints.set_fail_saves(true);
        let mut writer = h.writer(config());

        let written = writer
            .write_group(group(&[("0", ts(1, 10, 0, 0), "a")]), &CancellationToken::new())
            .await
            .unwrap();
        assert!(written > 0);
        assert!(h.checkpoints.get("primary").is_none());
        assert_eq!(h.store.committed_blocks(FIRST_BLOB).len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_published_after_commit() {
        let h = Harness::new();
        let mut writer = h.writer(config());
        let snapshots = writer.subscribe();
        assert!(snapshots.borrow().is_none());

        writer
            .write_group(group(&[("0", ts(1, 10, 0, 0), "a")]), &CancellationToken::new())
            .await
            .unwrap();
        let location = snapshots.borrow().clone().unwrap();
        assert_eq!(location.block_count, 1);
        assert_eq!(location.blob_name(), FIRST_BLOB);
    }

    #[tokio::test]
    async fn test_mirror_receives_committed_groups() {
        let h = Harness::new();
        let (tx, mut rx) = mpsc::channel(4);
        let mut writer = h.writer(config()).with_mirror(tx);

        writer
            .write_group(group(&[("0", ts(1, 10, 0, 0), "a")]), &CancellationToken::new())
            .await
            .unwrap();
        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.items[0].payload, b"a");
    }

    #[tokio::test]
    async fn test_closed_mirror_does_not_fault_primary() {
        let h = Harness::new();
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let mut writer = h.writer(config()).with_mirror(tx);
        let ct = CancellationToken::new();

        writer.write_group(group(&[("0", ts(1, 10, 0, 0), "a")]), &ct).await.unwrap();
        writer.write_group(group(&[("1", ts(1, 10, 0, 1), "b")]), &ct).await.unwrap();
        assert_eq!(h.store.committed_blocks(FIRST_BLOB).len(), 2);
    }

    async fn seed_two_blocks(h: &Harness) -> Checkpoint {
        let mut writer = h.writer(config());
        let ct = CancellationToken::new();
        writer.write_group(group(&[("0", ts(1, 10, 0, 0), "a")]), &ct).await.unwrap();
        writer.write_group(group(&[("1", ts(1, 10, 0, 1), "b")]), &ct).await.unwrap();
        h.checkpoint()
    }

    fn stale(mut checkpoint: Checkpoint) -> Checkpoint {
        checkpoint.block_position.block_name = BlockId::new(1);
        checkpoint.blob_property.length = 1;
        checkpoint
    }

    #[tokio::test]
    async fn test_resume_synchronize_adopts_storage() {
        let h = Harness::new();
        let live = seed_two_blocks(&h).await;
        h.checkpoints.put("primary", stale(live.clone()));

        let mut writer = h.writer(config());
        let loaded = writer.resume().await.unwrap().unwrap();
        assert_eq!(loaded.block_position.block_name, BlockId::new(1));

        let location = writer.location().unwrap();
        assert_eq!(location.block_count, 2);
        assert_eq!(location.size, live.blob_property.length);

        // next write continues the blob with block 3
        writer
            .write_group(group(&[("2", ts(1, 10, 0, 2), "c")]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.store.committed_blocks(FIRST_BLOB).len(), 3);
    }

    #[tokio::test]
    async fn test_resume_commits_staged_tail() {
        let h = Harness::new();
        let live = seed_two_blocks(&h).await;
        h.store.write_block(FIRST_BLOB, BlockId::new(3), b"tail").await.unwrap();

        let mut writer = h.writer(config());
        writer.resume().await.unwrap();

        let location = writer.location().unwrap();
        assert_eq!(location.block_count, 3);
        assert_eq!(location.size, live.blob_property.length + 4);
        assert_eq!(h.store.committed_blocks(FIRST_BLOB).len(), 3);
    }

    #[tokio::test]
    async fn test_resume_read_only_store_leaves_staged_tail() {
        let h = Harness::new();
        seed_two_blocks(&h).await;
        h.store.write_block(FIRST_BLOB, BlockId::new(3), b"tail").await.unwrap();
        h.store.set_read_only(true);

        let mut writer = h.writer(config());
        writer.resume().await.unwrap();
        assert_eq!(writer.location().unwrap().block_count, 2);
    }

    #[tokio::test]
    async fn test_resume_use_checkpoint_position() {
        let h = Harness::new();
        let live = seed_two_blocks(&h).await;
        h.checkpoints.put("primary", stale(live));

        let mut cfg = config();
        cfg.resume = ResumeStrategy::UseCheckpointPosition;
        let mut writer = h.writer(cfg);
        writer.resume().await.unwrap();

        let location = writer.location().unwrap();
        assert_eq!(location.block_count, 1);
        assert_eq!(location.size, 1);
    }

    #[tokio::test]
    async fn test_resume_reset_to_zero_overwrites_blob() {
        let h = Harness::new();
        seed_two_blocks(&h).await;

        let mut cfg = config();
        cfg.resume = ResumeStrategy::ResetToZero;
        let mut writer = h.writer(cfg);
        writer.resume().await.unwrap();
        assert_eq!(writer.location().unwrap().block_count, 0);
        assert_eq!(writer.location().unwrap().blob_name(), FIRST_BLOB);

        writer
            .write_group(group(&[("9", ts(1, 11, 0, 0), "z")]), &CancellationToken::new())
            .await
            .unwrap();
        let blocks = h.store.committed_blocks(FIRST_BLOB);
        assert_eq!(blocks.len(), 1);
        assert_eq!(decode_binary(&blocks[0].1).unwrap()[0], Frame::Magic);
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint() {
        let h = Harness::new();
        let mut writer = h.writer(config());
        assert!(writer.resume().await.unwrap().is_none());
        assert!(writer.location().is_none());
    }

    #[tokio::test]
    async fn test_run_drains_input() {
        let h = Harness::new();
        let writer = h.writer(config());
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(writer.run(rx, CancellationToken::new()));

        tx.send(group(&[("0", ts(1, 10, 0, 0), "a")])).await.unwrap();
        tx.send(group(&[("1", ts(1, 10, 0, 1), "b")])).await.unwrap();
        drop(tx);

        handle.await.unwrap().unwrap();
        assert_eq!(h.store.committed_blocks(FIRST_BLOB).len(), 2);
    }

    #[test]
    fn test_event_policy_boundaries() {
        let at = |time| MessageBatch::new("0", "0", time, "x");
        let daily = EventPolicy::new(FileFormat::Binary, false);
        let hourly = EventPolicy::new(FileFormat::Binary, true);

        let evening = at(ts(1, 18, 24, 45));
        let later = at(ts(1, 19, 21, 13));
        let next_day = at(ts(2, 0, 5, 0));

        assert!(!daily.starts_new_group(&evening, &later));
        assert!(daily.starts_new_group(&later, &next_day));
        assert!(hourly.starts_new_group(&evening, &later));
        assert_eq!(daily.measure(&evening), 16);
    }
}

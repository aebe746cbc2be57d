use crate::config::types::{ParseErrorStrategy, PartitionConfig};
use crate::source::batch::MessageBatch;
use crate::source::timestamp::{TimestampError, TimestampExtractor};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("io error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timestamp error: {0}")]
    Timestamp(#[from] TimestampError),

    #[error("line at byte {offset} has no timestamp: {line}")]
    MissingTimestamp { offset: u64, line: String },
}

/// Counters reported when a feeder finishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedStats {
    pub emitted: u64,
    /// Lines at or before the resume point
    pub skipped: u64,
    /// Lines without a usable timestamp
    pub dropped: u64,
}

/// Feeds one partition from a newline-delimited file.
///
/// Each non-empty line becomes one `MessageBatch`: the event time comes from the
/// configured timestamp pattern, the line's starting byte offset is the opaque offset,
/// and the line itself is the payload.
pub struct PartitionFeeder {
    partition_id: String,
    path: PathBuf,
    extractor: TimestampExtractor,
    follow: bool,
    on_parse_error: ParseErrorStrategy,
    skip_before: Option<DateTime<Utc>>,
    poll_interval: Duration,
}

impl PartitionFeeder {
    pub fn new(
        partition_id: impl Into<String>,
        config: &PartitionConfig,
        on_parse_error: ParseErrorStrategy,
    ) -> Result<Self, ReaderError> {
        let extractor = TimestampExtractor::new(&config.timestamp.pattern, &config.timestamp.format)?;
        Ok(Self {
            partition_id: partition_id.into(),
            path: config.path.clone(),
            extractor,
            follow: config.follow,
            on_parse_error,
            skip_before: None,
            poll_interval: Duration::from_millis(100),
        })
    }

    /// Skip lines stamped earlier than `time`; lines at exactly `time` are re-sent.
    pub fn skip_before(mut self, time: Option<DateTime<Utc>>) -> Self {
        self.skip_before = time;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read until end of file (or, in follow mode, until cancelled). Returns early
    /// without error when `output` is closed.
    pub async fn run(
        self,
        output: mpsc::Sender<MessageBatch>,
        ct: CancellationToken,
    ) -> Result<FeedStats, ReaderError> {
        info!(
            partition = %self.partition_id,
            path = %self.path.display(),
            follow = self.follow,
            "Partition feeder started"
        );

        let mut stats = FeedStats::default();
        let mut reader = self.open().await?;
        let mut inode = current_inode(&self.path);
        let mut offset = 0u64;
        let mut line = Vec::new();

        loop {
            if ct.is_cancelled() {
                break;
            }

            let read = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|e| self.io_error(e))?;

            let complete = line.last() == Some(&b'\n');
            if read == 0 || (!complete && self.follow) {
                if !self.follow {
                    break;
                }
                // keep a partial line buffered until the writer finishes it
                offset += read as u64;
                if self.rotated(inode, offset) {
                    info!(partition = %self.partition_id, "File rotated, reopening");
                    reader = self.open().await?;
                    inode = current_inode(&self.path);
                    offset = 0;
                    line.clear();
                    continue;
                }
                tokio::select! {
                    _ = ct.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            }
            offset += read as u64;

            // a partial line from a previous poll started earlier than this read
            let start = offset - line.len() as u64;
            let mut end = line.len();
            while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
                end -= 1;
            }
            let raw = &line[..end];
            if raw.is_empty() {
                line.clear();
                continue;
            }

            // invalid UTF-8 only matters to the timestamp pattern, the payload keeps the raw bytes
            let text = String::from_utf8_lossy(raw);
            if let Some(time) = self.classify(&text, start, &mut stats)? {
                let batch = MessageBatch::new(
                    self.partition_id.clone(),
                    start.to_string(),
                    time,
                    raw.to_vec(),
                );
                let sent = tokio::select! {
                    result = output.send(batch) => result.is_ok(),
                    _ = ct.cancelled() => break,
                };
                if !sent {
                    debug!(partition = %self.partition_id, "Partition channel closed");
                    break;
                }
                stats.emitted += 1;
            }
            line.clear();
        }

        info!(
            partition = %self.partition_id,
            emitted = stats.emitted,
            skipped = stats.skipped,
            dropped = stats.dropped,
            "Partition feeder finished"
        );
        Ok(stats)
    }

    /// Event time of a line that should be sent, `None` for lines to pass over.
    fn classify(
        &self,
        text: &str,
        offset: u64,
        stats: &mut FeedStats,
    ) -> Result<Option<DateTime<Utc>>, ReaderError> {
        let failure = match self.extractor.extract(text) {
            Ok(Some(time)) => {
                if self.skip_before.is_some_and(|resume| time < resume) {
                    stats.skipped += 1;
                    return Ok(None);
                }
                return Ok(Some(time));
            }
            Ok(None) => ReaderError::MissingTimestamp {
                offset,
                line: text.to_string(),
            },
            Err(e) => ReaderError::Timestamp(e),
        };

        match self.on_parse_error {
            ParseErrorStrategy::Drop => {
                warn!(partition = %self.partition_id, offset, error = %failure, "Dropping line");
                stats.dropped += 1;
                Ok(None)
            }
            ParseErrorStrategy::Panic => Err(failure),
        }
    }

    async fn open(&self) -> Result<BufReader<File>, ReaderError> {
        let file = File::open(&self.path).await.map_err(|e| self.io_error(e))?;
        Ok(BufReader::new(file))
    }

    /// The path now names a different file, or the file shrank below our position.
    fn rotated(&self, inode: Option<u64>, offset: u64) -> bool {
        match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len() < offset || (inode.is_some() && inode != inode_of(&meta)),
            Err(_) => false,
        }
    }

    fn io_error(&self, source: std::io::Error) -> ReaderError {
        ReaderError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn current_inode(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().and_then(|meta| inode_of(&meta))
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn inode_of(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

use crate::sequencer::backoff::BackoffConfig;
use crate::writer::blob_path::FileFormat;
use crate::writer::codec::LogHeader;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub partitions: HashMap<String, PartitionConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sequencer: SequencerConfig,
    #[serde(default)]
    pub accumulator: AccumulatorSettings,
    pub writer: WriterConfig,
    pub sinks: SinksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub path: PathBuf,
    pub timestamp: TimestampConfig,
    #[serde(default)]
    pub follow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampConfig {
    pub pattern: String,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Bound of every inter-stage channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub errors: ErrorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            errors: ErrorConfig::default(),
        }
    }
}

fn default_channel_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorConfig {
    #[serde(default)]
    pub on_parse_error: ParseErrorStrategy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseErrorStrategy {
    #[default]
    Drop,
    Panic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// How long one liveness probe waits on a quiet partition
    #[serde(with = "humantime_serde", default = "default_probe_timeout")]
    pub probe_timeout: Duration,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            probe_timeout: default_probe_timeout(),
            backoff: BackoffConfig::default(),
        }
    }
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccumulatorSettings {
    #[serde(with = "humantime_serde", default = "default_max_flush_latency")]
    pub max_flush_latency: Duration,
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
}

impl Default for AccumulatorSettings {
    fn default() -> Self {
        Self {
            max_flush_latency: default_max_flush_latency(),
            poll_interval: default_poll_interval(),
        }
    }
}

fn default_max_flush_latency() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    pub epoch_marker: String,
    #[serde(default)]
    pub format: FileFormat,
    /// Upper bound of one block payload; also the accumulator capacity
    #[serde(default = "default_max_block_bytes")]
    pub max_block_bytes: usize,
    #[serde(default = "default_max_blob_bytes")]
    pub max_blob_bytes: u64,
    #[serde(default = "default_max_block_count")]
    pub max_block_count: u32,
    #[serde(default)]
    pub hourly_rotation: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub resume: ResumeStrategy,
    #[serde(default)]
    pub header: LogHeader,
}

fn default_max_block_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_max_blob_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_max_block_count() -> u32 {
    50_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub delay: Duration,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay: default_retry_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_attempts() -> u32 {
    10
}

/// How a writer reconciles its checkpoint with storage at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStrategy {
    UseCheckpointPosition,
    #[default]
    SynchronizeWithStorage,
    ResetToZero,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinksConfig {
    pub primary: SinkConfig,
    pub mirror: Option<SinkConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Directory holding the blobs
    pub root: PathBuf,
    /// Directory holding the checkpoint document; defaults to `root/.checkpoints`
    pub checkpoint_dir: Option<PathBuf>,
    #[serde(default)]
    pub sub_path: String,
    #[serde(default = "default_propagate_errors")]
    pub propagate_errors: bool,
    #[serde(default)]
    pub read_only: bool,
}

fn default_propagate_errors() -> bool {
    true
}

impl SinkConfig {
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.root.join(".checkpoints"))
    }
}

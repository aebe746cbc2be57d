use crate::batcher::accumulator::{AccumulatedGroup, AccumulatorConfig, BatchAccumulator};
use crate::batcher::runner::{run_accumulator, BatcherError};
use crate::config::types::Config;
use crate::pipeline::channel::create_channel;
use crate::sequencer::merge::{MergeConfig, MergeScheduler, MergeStats, SequencerError};
use crate::source::batch::MessageBatch;
use crate::source::partition::PartitionSource;
use crate::storage::checkpoint::{Checkpoint, CheckpointManager};
use crate::storage::traits::{BlockStore, CheckpointStore};
use crate::writer::codec::MAX_PREFIX_BYTES;
use crate::writer::location::LogLocation;
use crate::writer::log_writer::{LogWriter, LogWriterConfig, WriterError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Errors that can occur during pipeline operation
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("sequencer error: {0}")]
    Sequencer(#[from] SequencerError),

    #[error("batcher error: {0}")]
    Batcher(#[from] BatcherError),

    #[error("writer error: {0}")]
    Writer(#[from] WriterError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Stage settings shared by every run of the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub merge: MergeConfig,
    pub accumulator: AccumulatorConfig,
    pub poll_interval: Duration,
    pub channel_capacity: usize,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            merge: MergeConfig::from(&config.sequencer),
            accumulator: AccumulatorConfig {
                // leave room for the block prefix so full blocks stay within the limit
                capacity: config.writer.max_block_bytes.saturating_sub(MAX_PREFIX_BYTES),
                max_flush_latency: config.accumulator.max_flush_latency,
            },
            poll_interval: config.accumulator.poll_interval,
            channel_capacity: config.pipeline.channel_capacity,
        }
    }
}

/// One persistence target: its writer settings and backing stores.
pub struct Destination {
    pub config: LogWriterConfig,
    pub store: Arc<dyn BlockStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

impl Destination {
    fn into_writer(self) -> LogWriter {
        let manager = CheckpointManager::new(self.checkpoints, self.config.destination.clone());
        LogWriter::new(self.config, self.store, manager)
    }
}

/// Writers resumed from their checkpoints, ready to be connected to partitions.
pub struct Pipeline {
    settings: PipelineSettings,
    primary: LogWriter,
    mirror: Option<LogWriter>,
    resume_point: Option<Checkpoint>,
}

impl Pipeline {
    /// Build the writers and run their resume step.
    pub async fn new(
        settings: PipelineSettings,
        primary: Destination,
        mirror: Option<Destination>,
    ) -> Result<Self, PipelineError> {
        let mut primary = primary.into_writer();
        let resume_point = primary.resume().await?;

        let mirror = match mirror {
            Some(destination) => {
                let mut writer = destination.into_writer();
                writer.resume().await?;
                Some(writer)
            }
            None => None,
        };

        Ok(Self {
            settings,
            primary,
            mirror,
            resume_point,
        })
    }

    /// The primary destination's checkpoint, if one existed at startup.
    pub fn resume_point(&self) -> Option<&Checkpoint> {
        self.resume_point.as_ref()
    }

    pub fn primary_location(&self) -> watch::Receiver<Option<LogLocation>> {
        self.primary.subscribe()
    }

    pub fn mirror_location(&self) -> Option<watch::Receiver<Option<LogLocation>>> {
        self.mirror.as_ref().map(LogWriter::subscribe)
    }

    /// Spawn the merge, accumulator and writer tasks.
    pub fn start(
        self,
        partitions: Vec<PartitionSource>,
        ct: CancellationToken,
    ) -> Result<PipelineHandle, PipelineError> {
        let settings = self.settings;
        let policy = self.primary.event_policy();
        let scheduler = MergeScheduler::new(partitions, settings.merge)?;
        let stats = scheduler.stats();

        let (merged_tx, merged_rx) = create_channel::<MessageBatch>(settings.channel_capacity);
        let (group_tx, group_rx) =
            create_channel::<AccumulatedGroup<MessageBatch>>(settings.channel_capacity);

        let mut primary = self.primary;
        let mirror = match self.mirror {
            Some(writer) => {
                let (mirror_tx, mirror_rx) =
                    create_channel::<AccumulatedGroup<MessageBatch>>(settings.channel_capacity);
                primary = primary.with_mirror(mirror_tx);
                info!(destination = %writer.destination(), "Starting mirror writer");
                Some(tokio::spawn(writer.run(mirror_rx, ct.clone())))
            }
            None => None,
        };

        info!(destination = %primary.destination(), "Starting primary writer");
        let primary = tokio::spawn(primary.run(group_rx, ct.clone()));

        let accumulator = BatchAccumulator::new(settings.accumulator, policy);
        let accumulator = tokio::spawn(run_accumulator(
            merged_rx,
            group_tx,
            accumulator,
            settings.poll_interval,
        ));

        let merge = tokio::spawn(scheduler.run(merged_tx, ct));

        Ok(PipelineHandle {
            merge,
            accumulator,
            primary,
            mirror,
            stats,
        })
    }
}

/// Outcome of a completed pipeline run.
#[derive(Debug)]
pub struct PipelineReport {
    pub emitted: u64,
    pub dropped: u64,
    /// Mirror failures never fail the run; they are reported here.
    pub mirror: Option<Result<(), WriterError>>,
}

pub struct PipelineHandle {
    merge: JoinHandle<Result<(), SequencerError>>,
    accumulator: JoinHandle<Result<(), BatcherError>>,
    primary: JoinHandle<Result<(), WriterError>>,
    mirror: Option<JoinHandle<Result<(), WriterError>>>,
    stats: Arc<MergeStats>,
}

impl PipelineHandle {
    pub fn stats(&self) -> Arc<MergeStats> {
        Arc::clone(&self.stats)
    }

    /// Wait for every stage to finish.
    ///
    /// A primary writer fault is reported in preference to the channel errors it causes
    /// upstream.
    pub async fn wait(self) -> Result<PipelineReport, PipelineError> {
        let merge = self.merge.await?;
        let accumulator = self.accumulator.await?;
        let primary = self.primary.await?;

        let mirror = match self.mirror {
            Some(handle) => {
                let result = handle.await?;
                if let Err(e) = &result {
                    error!(error = %e, "Mirror writer failed");
                }
                Some(result)
            }
            None => None,
        };

        if let Err(e) = primary {
            error!(error = %e, "Primary writer failed");
            return Err(e.into());
        }
        if let Err(e) = merge {
            return Err(e.into());
        }
        if let Err(e) = accumulator {
            warn!(error = %e, "Accumulator stopped early");
            return Err(e.into());
        }

        let report = PipelineReport {
            emitted: self.stats.emitted(),
            dropped: self.stats.dropped(),
            mirror,
        };
        info!(
            emitted = report.emitted,
            dropped = report.dropped,
            "Pipeline shutdown complete"
        );
        Ok(report)
    }
}

use crate::config::parse::load_config;
use crate::config::types::{Config, ResumeStrategy, SinkConfig};
use crate::pipeline::{Destination, Pipeline, PipelineSettings};
use crate::source::partition::PartitionSource;
use crate::source::reader::{FeedStats, PartitionFeeder, ReaderError};
use crate::storage::local::{LocalBlockStore, LocalCheckpointStore};
use crate::writer::log_writer::LogWriterConfig;
use chrono::{DateTime, TimeZone, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(
        "config not found; searched ~/.config/tributary/config.yml and /etc/tributary/config.yml \
         (use --config <path> to specify one)"
    )]
    ConfigNotFound,

    #[error("config error: {0}")]
    Config(#[from] crate::config::parse::ConfigError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("partition reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), RunError> {
    let config_path = config_path.ok_or(RunError::ConfigNotFound)?;

    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(&config_path)?;

    let ct = CancellationToken::new();
    let pipeline = run_pipeline(&config, ct.clone());
    tokio::pin!(pipeline);

    tokio::select! {
        result = &mut pipeline => result,
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
            ct.cancel();
            pipeline.await
        }
    }
}

fn destination(name: &str, config: &Config, sink: &SinkConfig) -> Destination {
    info!(
        destination = name,
        root = %sink.root.display(),
        read_only = sink.read_only,
        "Opening destination"
    );
    let store = if sink.read_only {
        LocalBlockStore::read_only(&sink.root)
    } else {
        LocalBlockStore::new(&sink.root)
    };
    Destination {
        config: LogWriterConfig::new(name, &config.writer, sink),
        store: Arc::new(store),
        checkpoints: Arc::new(LocalCheckpointStore::new(sink.checkpoint_dir())),
    }
}

/// Earliest event time the feeders still have to deliver.
///
/// A reset rewrites the checkpoint's blob from block 1, so every event of that blob's
/// day (or hour) is read again. Blobs before it are left alone.
fn replay_from(pipeline: &Pipeline, strategy: ResumeStrategy) -> Option<DateTime<Utc>> {
    match strategy {
        ResumeStrategy::ResetToZero => {
            let location = pipeline.primary_location().borrow().clone()?;
            let start = location.path.date.and_hms_opt(location.path.hour.unwrap_or(0), 0, 0)?;
            Some(Utc.from_utc_datetime(&start))
        }
        ResumeStrategy::UseCheckpointPosition | ResumeStrategy::SynchronizeWithStorage => pipeline
            .resume_point()
            .and_then(|checkpoint| checkpoint.event_position.enqueued_time_utc),
    }
}

/// Run every partition of `config` through the pipeline until the inputs are exhausted
/// or `ct` is cancelled.
pub async fn run_pipeline(config: &Config, ct: CancellationToken) -> Result<(), RunError> {
    let primary = destination("primary", config, &config.sinks.primary);
    let mirror = config
        .sinks
        .mirror
        .as_ref()
        .map(|sink| destination("mirror", config, sink));

    let pipeline = Pipeline::new(PipelineSettings::from(config), primary, mirror).await?;

    let skip_before = replay_from(&pipeline, config.writer.resume);
    if let Some(time) = skip_before {
        info!(resume_from = %time, "Resuming from checkpoint");
    }

    let mut ids: Vec<&String> = config.partitions.keys().collect();
    ids.sort();

    let mut sources = Vec::with_capacity(ids.len());
    let mut feeders: Vec<(String, JoinHandle<Result<FeedStats, ReaderError>>)> = Vec::new();
    for id in ids {
        let feeder = PartitionFeeder::new(
            id.as_str(),
            &config.partitions[id],
            config.pipeline.errors.on_parse_error,
        )?
        .skip_before(skip_before)
        .poll_interval(config.accumulator.poll_interval);

        let (tx, source) = PartitionSource::channel(id.as_str(), config.pipeline.channel_capacity);
        sources.push(source);

        let feeder_ct = ct.clone();
        let handle = tokio::spawn(async move {
            let result = feeder.run(tx, feeder_ct.clone()).await;
            if result.is_err() {
                feeder_ct.cancel();
            }
            result
        });
        feeders.push((id.clone(), handle));
    }

    info!(partitions = sources.len(), "Pipeline started, press Ctrl+C to shutdown");
    let handle = pipeline.start(sources, ct.clone())?;
    let report = handle.wait().await;

    // followers only stop on cancellation
    ct.cancel();

    let mut feeder_error = None;
    for (id, handle) in feeders {
        match handle.await? {
            Ok(stats) => info!(
                partition = %id,
                emitted = stats.emitted,
                skipped = stats.skipped,
                dropped = stats.dropped,
                "Partition feeder finished"
            ),
            Err(e) => {
                error!(partition = %id, error = %e, "Partition feeder failed");
                feeder_error.get_or_insert(e);
            }
        }
    }

    let report = report?;
    if let Some(Err(e)) = &report.mirror {
        warn!(error = %e, "Mirror copy is incomplete");
    }
    if let Some(e) = feeder_error {
        return Err(e.into());
    }
    Ok(())
}

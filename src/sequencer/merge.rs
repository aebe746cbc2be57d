use crate::config::types::SequencerConfig;
use crate::sequencer::backoff::{BackoffConfig, BackoffTracker};
use crate::source::batch::MessageBatch;
use crate::source::partition::PartitionSource;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("no partitions provided")]
    NoPartitions,

    #[error("duplicate partition id: {0}")]
    DuplicatePartition(String),
}

/// Configuration for the merge scheduler
#[derive(Debug, Clone, Copy)]
pub struct MergeConfig {
    /// How long a single liveness probe waits for a partition to produce data
    pub probe_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(1),
            backoff: BackoffConfig::default(),
        }
    }
}

impl From<&SequencerConfig> for MergeConfig {
    fn from(config: &SequencerConfig) -> Self {
        Self {
            probe_timeout: config.probe_timeout,
            backoff: config.backoff,
        }
    }
}

/// Counters shared with the host for observability.
#[derive(Debug, Default)]
pub struct MergeStats {
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl MergeStats {
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Items discarded because they arrived behind the watermark.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Active,
    Inactive,
}

struct Partition {
    source: PartitionSource,
    liveness: Liveness,
}

/// K-way merge over partition sources by enqueued time.
///
/// Each loop iteration re-probes parked partitions once their backoff expires, waits
/// (concurrently, with a timeout) for every active partition that has nothing buffered,
/// and then emits the earliest head. Partitions are ordered by id at construction, so
/// equal timestamps resolve to the lowest partition id.
pub struct MergeScheduler {
    partitions: Vec<Partition>,
    backoff: BackoffTracker,
    probe_timeout: Duration,
    watermark: Option<DateTime<Utc>>,
    stats: Arc<MergeStats>,
}

impl MergeScheduler {
    pub fn new(sources: Vec<PartitionSource>, config: MergeConfig) -> Result<Self, SequencerError> {
        if sources.is_empty() {
            return Err(SequencerError::NoPartitions);
        }

        let mut sources = sources;
        sources.sort_by(|a, b| a.partition_id().cmp(b.partition_id()));
        for pair in sources.windows(2) {
            if pair[0].partition_id() == pair[1].partition_id() {
                return Err(SequencerError::DuplicatePartition(
                    pair[0].partition_id().to_string(),
                ));
            }
        }

        Ok(Self {
            partitions: sources
                .into_iter()
                .map(|source| Partition {
                    source,
                    liveness: Liveness::Active,
                })
                .collect(),
            backoff: BackoffTracker::new(config.backoff),
            probe_timeout: config.probe_timeout,
            watermark: None,
            stats: Arc::new(MergeStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<MergeStats> {
        Arc::clone(&self.stats)
    }

    /// Highest timestamp emitted so far.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    /// Run until cancelled, until the output is closed, or until every partition has
    /// ended. Dropping `output` on return closes the stream for the next stage.
    pub async fn run(
        mut self,
        output: mpsc::Sender<MessageBatch>,
        ct: CancellationToken,
    ) -> Result<(), SequencerError> {
        info!(partitions = self.partitions.len(), "Merge scheduler started");

        while !ct.is_cancelled() {
            if self.all_finished() {
                info!("All partitions finished");
                break;
            }

            self.probe_inactive(&ct).await;

            if !self.partitions.iter().any(|p| p.liveness == Liveness::Active) {
                self.backoff.reset();
                self.idle(&ct).await;
                continue;
            }

            self.wait_for_active(&ct).await;
            if ct.is_cancelled() {
                break;
            }

            let Some(idx) = self.select_earliest() else {
                continue;
            };

            let Some(batch) = self.partitions[idx].source.pop() else {
                continue;
            };

            if let Some(watermark) = self.watermark {
                if batch.enqueued_time_utc < watermark {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        partition = %batch.partition_id,
                        offset = %batch.offset,
                        enqueued_time = %batch.enqueued_time_utc,
                        watermark = %watermark,
                        "Dropping out-of-order batch behind watermark"
                    );
                    continue;
                }
            }

            self.watermark = Some(batch.enqueued_time_utc);
            if output.send(batch).await.is_err() {
                info!("Merge output closed, stopping scheduler");
                return Ok(());
            }
            self.stats.emitted.fetch_add(1, Ordering::Relaxed);
        }

        info!(
            emitted = self.stats.emitted(),
            dropped = self.stats.dropped(),
            "Merge scheduler shutdown complete"
        );
        Ok(())
    }

    fn all_finished(&self) -> bool {
        self.partitions.iter().all(|p| p.source.is_finished())
    }

    /// Step 1: once backoff expires, probe parked partitions concurrently.
    async fn probe_inactive(&mut self, ct: &CancellationToken) {
        let any_parked = self
            .partitions
            .iter()
            .any(|p| p.liveness == Liveness::Inactive && !p.source.is_finished());
        if !any_parked || !self.backoff.should_retry() {
            return;
        }

        let timeout = self.probe_timeout;
        let probes = self
            .partitions
            .iter_mut()
            .filter(|p| p.liveness == Liveness::Inactive && !p.source.is_finished())
            .map(|p| async move {
                if p.source.wait_for_data(ct, timeout).await {
                    p.liveness = Liveness::Active;
                    debug!(partition = %p.source.partition_id(), "Partition recovered");
                    true
                } else {
                    false
                }
            });
        let results = join_all(probes).await;

        if results.iter().all(|recovered| *recovered) {
            self.backoff.reset();
        } else {
            self.backoff.try_increase();
        }
    }

    /// Step 3: every active partition without a buffered head gets one probe.
    async fn wait_for_active(&mut self, ct: &CancellationToken) {
        let timeout = self.probe_timeout;
        let waits = self
            .partitions
            .iter_mut()
            .filter(|p| p.liveness == Liveness::Active)
            .filter_map(|p| {
                if p.source.peek().is_some() {
                    None
                } else {
                    Some(p.source.wait_for_data(ct, timeout))
                }
            });
        join_all(waits).await;
    }

    /// Step 4: park empty partitions and pick the earliest head.
    fn select_earliest(&mut self) -> Option<usize> {
        let mut best: Option<(usize, DateTime<Utc>)> = None;

        for (idx, partition) in self.partitions.iter_mut().enumerate() {
            if partition.liveness != Liveness::Active {
                continue;
            }
            match partition.source.peek() {
                None => {
                    partition.liveness = Liveness::Inactive;
                    debug!(partition = %partition.source.partition_id(), "Partition inactive");
                }
                Some(head) => {
                    let ts = head.enqueued_time_utc;
                    if best.map_or(true, |(_, best_ts)| ts < best_ts) {
                        best = Some((idx, ts));
                    }
                }
            }
        }

        best.map(|(idx, _)| idx)
    }

    /// Nothing is active: sleep until the next probe is due or one probe period passes.
    async fn idle(&self, ct: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(self.probe_timeout) => {}
            _ = ct.cancelled() => {}
        }
    }
}

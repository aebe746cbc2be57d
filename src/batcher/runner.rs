use crate::batcher::accumulator::{AccumulatedGroup, BatchAccumulator, GroupPolicy};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum BatcherError {
    #[error("group output channel closed")]
    ChannelSend,
}

/// Run the accumulator task.
///
/// The task is the only owner of the accumulator: items from `input` and ticks from the
/// poll interval are two producers multiplexed with `select!`, so the item-driven and
/// time-driven flushes never overlap. Returns once `input` is closed and the remainder
/// has been flushed; dropping `output` then propagates completion downstream.
pub async fn run_accumulator<T, P>(
    mut input: mpsc::Receiver<T>,
    output: mpsc::Sender<AccumulatedGroup<T>>,
    mut accumulator: BatchAccumulator<T, P>,
    poll_interval: Duration,
) -> Result<(), BatcherError>
where
    T: Send,
    P: GroupPolicy<T>,
{
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut groups = 0u64;

    info!("Batch accumulator started");

    loop {
        tokio::select! {
            result = input.recv() => {
                match result {
                    Some(item) => {
                        for group in accumulator.push(item, Instant::now()) {
                            debug!(items = group.len(), size = group.size, reason = ?group.reason, "Flushing group");
                            output.send(group).await.map_err(|_| BatcherError::ChannelSend)?;
                            groups += 1;
                        }
                    }
                    None => {
                        info!("Input channel closed, flushing remaining items");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if let Some(group) = accumulator.poll(Instant::now()) {
                    debug!(items = group.len(), size = group.size, "Flushing group on latency");
                    output.send(group).await.map_err(|_| BatcherError::ChannelSend)?;
                    groups += 1;
                }
            }
        }
    }

    if let Some(group) = accumulator.finish() {
        output.send(group).await.map_err(|_| BatcherError::ChannelSend)?;
        groups += 1;
    }

    info!(groups = groups, "Batch accumulator shutdown complete");
    Ok(())
}

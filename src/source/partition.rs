use crate::source::batch::MessageBatch;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Wraps the incoming batch stream of one partition.
///
/// The source keeps at most one item in a peek slot in front of the channel, so the
/// head of the queue is always the oldest item not yet consumed. It has no notion of
/// ordering across partitions; that is the merge scheduler's job.
pub struct PartitionSource {
    partition_id: String,
    receiver: mpsc::Receiver<MessageBatch>,
    head: Option<MessageBatch>,
    closed: bool,
}

impl PartitionSource {
    pub fn new(partition_id: impl Into<String>, receiver: mpsc::Receiver<MessageBatch>) -> Self {
        Self {
            partition_id: partition_id.into(),
            receiver,
            head: None,
            closed: false,
        }
    }

    /// Create a source together with the sender that feeds it.
    pub fn channel(partition_id: impl Into<String>, capacity: usize) -> (mpsc::Sender<MessageBatch>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(partition_id, rx))
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Look at the head without blocking.
    pub fn peek(&mut self) -> Option<&MessageBatch> {
        if self.head.is_none() && !self.closed {
            match self.receiver.try_recv() {
                Ok(batch) => self.head = Some(batch),
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => self.closed = true,
            }
        }
        self.head.as_ref()
    }

    /// Remove and return the head. Callers are expected to have peeked first.
    pub fn pop(&mut self) -> Option<MessageBatch> {
        if self.head.is_none() {
            self.peek();
        }
        self.head.take()
    }

    /// Suspend until data is available, the partition ends, `max_wait` elapses or
    /// cancellation fires. Returns whether an item is now at the head.
    pub async fn wait_for_data(&mut self, ct: &CancellationToken, max_wait: Duration) -> bool {
        if self.peek().is_some() {
            return true;
        }
        if self.closed {
            return false;
        }

        tokio::select! {
            received = self.receiver.recv() => match received {
                Some(batch) => {
                    self.head = Some(batch);
                    true
                }
                None => {
                    self.closed = true;
                    false
                }
            },
            _ = tokio::time::sleep(max_wait) => false,
            _ = ct.cancelled() => false,
        }
    }

    /// The partition's sender is gone and every item has been consumed.
    pub fn is_finished(&self) -> bool {
        self.closed && self.head.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn batch(partition: &str, offset: u64) -> MessageBatch {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        MessageBatch::new(partition, offset.to_string(), ts, format!("event-{}", offset))
    }

    #[tokio::test]
    async fn test_peek_pop_preserve_arrival_order() {
        let (tx, mut source) = PartitionSource::channel("0", 10);
        tx.send(batch("0", 1)).await.unwrap();
        tx.send(batch("0", 2)).await.unwrap();

        assert_eq!(source.peek().unwrap().offset, "1");
        // peeking again does not advance
        assert_eq!(source.peek().unwrap().offset, "1");
        assert_eq!(source.pop().unwrap().offset, "1");
        assert_eq!(source.pop().unwrap().offset, "2");
        assert!(source.peek().is_none());
        assert!(!source.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_data_times_out() {
        let (_tx, mut source) = PartitionSource::channel("0", 10);
        let ct = CancellationToken::new();
        assert!(!source.wait_for_data(&ct, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_wait_for_data_wakes_on_arrival() {
        let (tx, mut source) = PartitionSource::channel("0", 10);
        let ct = CancellationToken::new();

        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send(batch("0", 7)).await.unwrap();
        });

        assert!(source.wait_for_data(&ct, Duration::from_secs(5)).await);
        assert_eq!(source.pop().unwrap().offset, "7");
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_data_returns_on_cancel() {
        let (_tx, mut source) = PartitionSource::channel("0", 10);
        let ct = CancellationToken::new();
        ct.cancel();
        assert!(!source.wait_for_data(&ct, Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn test_finished_after_sender_dropped_and_drained() {
        let (tx, mut source) = PartitionSource::channel("0", 10);
        tx.send(batch("0", 1)).await.unwrap();
        drop(tx);

        let ct = CancellationToken::new();
        assert!(source.wait_for_data(&ct, Duration::from_secs(1)).await);
        assert!(!source.is_finished());
        source.pop();
        assert!(!source.wait_for_data(&ct, Duration::from_secs(1)).await);
        assert!(source.is_finished());
    }
}

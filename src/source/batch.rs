use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit received from a partition of the event bus.
///
/// `offset` is opaque to the pipeline: it is carried through to the checkpoint so the
/// host can resume the partition, but never compared or parsed here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBatch {
    pub partition_id: String,
    pub offset: String,
    pub enqueued_time_utc: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl MessageBatch {
    pub fn new(
        partition_id: impl Into<String>,
        offset: impl Into<String>,
        enqueued_time_utc: DateTime<Utc>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            offset: offset.into(),
            enqueued_time_utc,
            payload: payload.into(),
        }
    }
}

use std::time::Duration;
use tokio::time::Instant;

/// Decides how items are measured and where group boundaries fall.
pub trait GroupPolicy<T>: Send {
    /// Size an item contributes towards the group capacity.
    fn measure(&self, item: &T) -> usize;

    /// `item` must open a new group even if it would fit after `last`, the newest
    /// buffered item.
    fn starts_new_group(&self, _last: &T, _item: &T) -> bool {
        false
    }

    /// The group must be flushed right after this item is appended.
    fn is_flush_trigger(&self, _item: &T) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Capacity,
    Boundary,
    Oversized,
    Trigger,
    Latency,
    Completion,
}

/// One flush unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulatedGroup<T> {
    pub items: Vec<T>,
    /// Sum of `measure` over `items`
    pub size: usize,
    pub reason: FlushReason,
}

impl<T> AccumulatedGroup<T> {
    pub fn first(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.last()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AccumulatorConfig {
    /// Aggregate size bound per group
    pub capacity: usize,
    pub max_flush_latency: Duration,
}

/// Size/time bounded grouping state machine.
///
/// The accumulator never looks at a clock itself; callers pass `now` so that the item
/// path and the timer path can be driven by one owner.
pub struct BatchAccumulator<T, P> {
    config: AccumulatorConfig,
    policy: P,
    buffer: Vec<T>,
    size: usize,
    clock_started: Option<Instant>,
}

impl<T, P> BatchAccumulator<T, P>
where
    P: GroupPolicy<T>,
{
    pub fn new(config: AccumulatorConfig, policy: P) -> Self {
        Self {
            config,
            policy,
            buffer: Vec::new(),
            size: 0,
            clock_started: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn buffered_size(&self) -> usize {
        self.size
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Add an item. Returns the groups completed by this arrival (at most two: the
    /// previous buffer and an oversized singleton).
    pub fn push(&mut self, item: T, now: Instant) -> Vec<AccumulatedGroup<T>> {
        let mut flushed = Vec::new();
        let measured = self.policy.measure(&item);

        let overflow = self.size.saturating_add(measured) > self.config.capacity;
        let boundary = self
            .buffer
            .last()
            .is_some_and(|last| self.policy.starts_new_group(last, &item));

        if overflow || boundary {
            let reason = if boundary {
                FlushReason::Boundary
            } else {
                FlushReason::Capacity
            };
            if let Some(group) = self.take(reason) {
                flushed.push(group);
            }

            self.append(item, measured, now);
            if measured > self.config.capacity {
                if let Some(group) = self.take(FlushReason::Oversized) {
                    flushed.push(group);
                }
            }
        } else {
            let trigger = self.policy.is_flush_trigger(&item);
            self.append(item, measured, now);
            if trigger {
                if let Some(group) = self.take(FlushReason::Trigger) {
                    flushed.push(group);
                }
            }
        }

        flushed
    }

    /// Timer path: flush when the buffer has waited at least `max_flush_latency`.
    pub fn poll(&mut self, now: Instant) -> Option<AccumulatedGroup<T>> {
        let started = self.clock_started?;
        if now.saturating_duration_since(started) >= self.config.max_flush_latency {
            self.take(FlushReason::Latency)
        } else {
            None
        }
    }

    /// Upstream completed: hand out whatever is left.
    pub fn finish(&mut self) -> Option<AccumulatedGroup<T>> {
        self.take(FlushReason::Completion)
    }

    fn append(&mut self, item: T, measured: usize, now: Instant) {
        if self.buffer.is_empty() {
            // first item after an idle period starts the clock
            self.clock_started = Some(now);
        }
        self.buffer.push(item);
        self.size = self.size.saturating_add(measured);
    }

    fn take(&mut self, reason: FlushReason) -> Option<AccumulatedGroup<T>> {
        if self.buffer.is_empty() {
            return None;
        }
        let items = std::mem::take(&mut self.buffer);
        let size = std::mem::replace(&mut self.size, 0);
        self.clock_started = None;
        Some(AccumulatedGroup {
            items,
            size,
            reason,
        })
    }
}

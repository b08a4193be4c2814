//! Per-partition commit watermark tracking.
//!
//! Mailboxes complete out of order across routing keys, so acknowledgements
//! for a partition can arrive out of order too. Kafka's committed offset is
//! a single watermark per partition: committing offset `n` implies every
//! offset below `n` is consumed. The tracker therefore only advances the
//! committable watermark over the *contiguous* prefix of acknowledged
//! offsets — a later offset is never committed ahead of an earlier
//! in-flight one, so a crash redelivers exactly the unfinished work.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct PartitionWindow {
    /// Lowest delivered offset that has not been acknowledged. This is
    /// also the Kafka commit value: the next offset to consume.
    next_expected: i64,
    /// Acknowledged offsets at or above `next_expected`, pending
    /// contiguity.
    acked: BTreeSet<i64>,
}

/// Tracks delivered and acknowledged offsets per `(topic, partition)`.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: Mutex<HashMap<(String, i32), PartitionWindow>>,
}

impl OffsetTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, i32), PartitionWindow>> {
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a delivered offset. The first offset seen on a partition
    /// anchors its window.
    pub fn track(&self, topic: &str, partition: i32, offset: i64) {
        let mut partitions = self.lock();
        partitions
            .entry((topic.to_string(), partition))
            .or_insert_with(|| PartitionWindow {
                next_expected: offset,
                acked: BTreeSet::new(),
            });
    }

    /// Acknowledge an offset. Returns the new committable watermark (the
    /// next offset to consume) when the contiguous prefix advanced, or
    /// `None` when an earlier offset is still in flight.
    pub fn ack(&self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let mut partitions = self.lock();
        let window = partitions.get_mut(&(topic.to_string(), partition))?;

        if offset < window.next_expected {
            // Redelivery of an already-committed offset.
            return None;
        }
        window.acked.insert(offset);

        let mut advanced = false;
        while window.acked.remove(&window.next_expected) {
            window.next_expected += 1;
            advanced = true;
        }
        advanced.then_some(window.next_expected)
    }

    /// Number of acknowledged offsets waiting on an earlier in-flight one.
    #[must_use]
    pub fn pending_acks(&self, topic: &str, partition: i32) -> usize {
        self.lock()
            .get(&(topic.to_string(), partition))
            .map_or(0, |w| w.acked.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_acks_advance_watermark_each_time() {
        let tracker = OffsetTracker::new();
        for offset in 0..3 {
            tracker.track("commands", 0, offset);
        }

        assert_eq!(tracker.ack("commands", 0, 0), Some(1));
        assert_eq!(tracker.ack("commands", 0, 1), Some(2));
        assert_eq!(tracker.ack("commands", 0, 2), Some(3));
    }

    #[test]
    fn out_of_order_acks_wait_for_the_gap() {
        let tracker = OffsetTracker::new();
        for offset in 0..4 {
            tracker.track("commands", 0, offset);
        }

        // 1, 2, 3 complete while 0 is still handling: nothing committable.
        assert_eq!(tracker.ack("commands", 0, 1), None);
        assert_eq!(tracker.ack("commands", 0, 3), None);
        assert_eq!(tracker.ack("commands", 0, 2), None);
        assert_eq!(tracker.pending_acks("commands", 0), 3);

        // 0 completes: the whole prefix commits at once.
        assert_eq!(tracker.ack("commands", 0, 0), Some(4));
        assert_eq!(tracker.pending_acks("commands", 0), 0);
    }

    #[test]
    fn window_anchors_at_first_tracked_offset() {
        let tracker = OffsetTracker::new();
        tracker.track("commands", 0, 100);
        tracker.track("commands", 0, 101);

        assert_eq!(tracker.ack("commands", 0, 100), Some(101));
    }

    #[test]
    fn partitions_are_independent() {
        let tracker = OffsetTracker::new();
        tracker.track("commands", 0, 0);
        tracker.track("commands", 1, 0);

        assert_eq!(tracker.ack("commands", 1, 0), Some(1));
        // Partition 0 still has offset 0 in flight.
        assert_eq!(tracker.pending_acks("commands", 0), 0);
        assert_eq!(tracker.ack("commands", 0, 0), Some(1));
    }

    #[test]
    fn redelivered_committed_offset_is_ignored() {
        let tracker = OffsetTracker::new();
        tracker.track("commands", 0, 0);
        assert_eq!(tracker.ack("commands", 0, 0), Some(1));

        // A redelivery below the watermark must not rewind it.
        tracker.track("commands", 0, 0);
        assert_eq!(tracker.ack("commands", 0, 0), None);
    }

    #[test]
    fn ack_on_untracked_partition_is_none() {
        let tracker = OffsetTracker::new();
        assert_eq!(tracker.ack("commands", 5, 0), None);
    }
}

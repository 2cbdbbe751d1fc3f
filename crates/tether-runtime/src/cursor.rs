//! Completion watermark for at-least-once event dispatch.
//!
//! Events from one agent's stream dispatch concurrently across channel
//! workers, so they can complete out of order. The cursor may only
//! advance past an event once every event with a smaller id has also
//! completed; otherwise a crash between the two would skip the earlier
//! one on resume.

use std::collections::BTreeSet;

/// Tracks in-flight and completed event ids and derives the committable
/// cursor position.
#[derive(Debug, Clone)]
pub struct CursorTracker {
    committed: i64,
    inflight: BTreeSet<i64>,
    completed: BTreeSet<i64>,
}

impl CursorTracker {
    /// Start from the last committed id (0 when no cursor is known).
    pub fn new(committed: i64) -> Self {
        Self {
            committed,
            inflight: BTreeSet::new(),
            completed: BTreeSet::new(),
        }
    }

    /// The highest id known to be fully processed, with no gaps below it.
    pub fn committed(&self) -> i64 {
        self.committed
    }

    /// Whether this id was already seen (committed, in flight, or
    /// awaiting commit). Replay overlap at reconnect boundaries lands
    /// here.
    pub fn is_duplicate(&self, id: i64) -> bool {
        id <= self.committed || self.inflight.contains(&id) || self.completed.contains(&id)
    }

    /// Mark an event as dispatched but not yet processed.
    pub fn begin(&mut self, id: i64) {
        if id > self.committed {
            self.inflight.insert(id);
        }
    }

    /// Mark an event as fully processed. Returns the new committed id
    /// when the watermark advanced.
    pub fn complete(&mut self, id: i64) -> Option<i64> {
        self.inflight.remove(&id);
        if id > self.committed {
            self.completed.insert(id);
        }

        let before = self.committed;
        while let Some(&lowest) = self.completed.first() {
            if let Some(&lowest_inflight) = self.inflight.first()
                && lowest_inflight < lowest
            {
                break;
            }
            self.committed = lowest;
            self.completed.remove(&lowest);
        }

        (self.committed > before).then_some(self.committed)
    }

    /// Ids dispatched but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn in_order_completion_advances_immediately() {
        let mut tracker = CursorTracker::new(0);

        tracker.begin(1);
        assert_eq!(tracker.complete(1), Some(1));
        tracker.begin(2);
        assert_eq!(tracker.complete(2), Some(2));
        assert_eq!(tracker.committed(), 2);
    }

    #[test]
    fn out_of_order_completion_holds_the_watermark() {
        let mut tracker = CursorTracker::new(10);

        tracker.begin(11);
        tracker.begin(12);
        tracker.begin(13);

        // 12 and 13 finish first; 11 is still in flight.
        assert_eq!(tracker.complete(12), None);
        assert_eq!(tracker.complete(13), None);
        assert_eq!(tracker.committed(), 10);

        // Once 11 completes, the watermark jumps over the whole run.
        assert_eq!(tracker.complete(11), Some(13));
        assert_eq!(tracker.committed(), 13);
    }

    #[test]
    fn id_numbering_gaps_do_not_block() {
        let mut tracker = CursorTracker::new(0);

        tracker.begin(4);
        tracker.begin(9);
        assert_eq!(tracker.complete(4), Some(4));
        assert_eq!(tracker.complete(9), Some(9));
    }

    #[test]
    fn duplicates_are_detected_in_every_phase() {
        let mut tracker = CursorTracker::new(5);

        assert!(tracker.is_duplicate(3));
        assert!(tracker.is_duplicate(5));
        assert!(!tracker.is_duplicate(6));

        tracker.begin(6);
        assert!(tracker.is_duplicate(6));

        tracker.begin(7);
        tracker.complete(7);
        // 7 completed but 6 still in flight: 7 awaits commit.
        assert!(tracker.is_duplicate(7));
    }

    #[test]
    fn ids_at_or_below_the_cursor_are_ignored() {
        let mut tracker = CursorTracker::new(5);
        tracker.begin(3);
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.complete(3), None);
        assert_eq!(tracker.committed(), 5);
    }

    proptest! {
        // However completions interleave, the committed cursor never
        // decreases and ends at the maximum once everything completes.
        #[test]
        fn watermark_is_monotonic_and_complete(
            ids in prop::collection::btree_set(1i64..1000, 1..50),
        ) {
            let ids: Vec<i64> = ids.iter().copied().collect();
            let mut tracker = CursorTracker::new(0);
            for &id in &ids {
                tracker.begin(id);
            }

            // Complete in reverse order: worst case for the watermark.
            let mut previous = 0i64;
            for &id in ids.iter().rev() {
                tracker.complete(id);
                prop_assert!(tracker.committed() >= previous);
                previous = tracker.committed();
            }

            prop_assert_eq!(tracker.committed(), *ids.last().unwrap());
            prop_assert_eq!(tracker.in_flight(), 0);
        }
    }
}

use std::collections::BTreeMap;

use super::event::BuiltEventBatch;
use super::segment::RawSegment;

/// What became of a segment, in the order it has to be merged
#[derive(Debug)]
pub enum SegmentOutcome {
    Built(BuiltEventBatch),
    /// Dirty or failed segment that is passed over; keeps the sequence contiguous
    Skipped { segment: RawSegment, reason: String },
}

impl SegmentOutcome {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Built(batch) => batch.seq(),
            Self::Skipped { segment, .. } => segment.seq,
        }
    }
}

/// Holds outcomes that arrived ahead of their turn.
///
/// Workers finish in any order; the store must see segments in sequence order. [`ReorderBuffer::pop_ready`]
/// only yields the outcome of the next expected sequence index.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    next: u64,
    pending: BTreeMap<u64, SegmentOutcome>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer whose first expected outcome is `next`; earlier ones count as released
    pub fn starting_at(next: u64) -> Self {
        Self {
            next,
            pending: BTreeMap::new(),
        }
    }

    /// Store an outcome. Outcomes for already released or duplicate sequence indices are
    /// dropped; returns false in that case.
    pub fn insert(&mut self, outcome: SegmentOutcome) -> bool {
        let seq = outcome.seq();
        if seq < self.next || self.pending.contains_key(&seq) {
            return false;
        }
        self.pending.insert(seq, outcome);
        true
    }

    /// Release the next outcome if it has arrived
    pub fn pop_ready(&mut self) -> Option<SegmentOutcome> {
        let outcome = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(outcome)
    }

    /// Sequence index that is expected next
    pub fn next_seq(&self) -> u64 {
        self.next
    }

    /// Number of outcomes waiting for an earlier one
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::BatchStats;
    use std::path::PathBuf;

    fn outcome(seq: u64) -> SegmentOutcome {
        let segment = RawSegment::pending(0, PathBuf::from("run.dat_0000"), 0).promote(seq);
        SegmentOutcome::Built(BuiltEventBatch {
            segment,
            events: Vec::new(),
            stats: BatchStats::default(),
            lookup_misses: Vec::new(),
        })
    }

    #[test]
    fn test_releases_in_order() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.insert(outcome(2)));
        assert!(buffer.insert(outcome(1)));
        assert!(buffer.pop_ready().is_none());
        assert_eq!(buffer.len(), 2);

        assert!(buffer.insert(outcome(0)));
        let released: Vec<u64> = std::iter::from_fn(|| buffer.pop_ready())
            .map(|o| o.seq())
            .collect();
        assert_eq!(released, vec![0, 1, 2]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.next_seq(), 3);
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.insert(outcome(0)));
        assert!(!buffer.insert(outcome(0)));
        assert!(buffer.pop_ready().is_some());
        assert!(!buffer.insert(outcome(0)));
    }

    #[test]
    fn test_starting_at_drops_earlier_outcomes() {
        let mut buffer = ReorderBuffer::starting_at(5);
        assert!(!buffer.insert(outcome(4)));
        assert!(buffer.insert(outcome(5)));
        assert_eq!(buffer.pop_ready().map(|o| o.seq()), Some(5));
    }
}

use std::collections::BTreeSet;

use super::event::{BatchStats, BuiltEvent, BuiltEventBatch};

/// Result of offering a batch to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { n_events: usize },
    /// Only the first `n_events` fit under `max_entries`; the store is now full
    Truncated { n_events: usize, dropped: usize },
    /// The segment was merged before; nothing changed
    AlreadyMerged,
    /// The store holds `max_entries` events and takes nothing more
    Full,
}

/// The running union of every merged batch of the run.
///
/// Owned and mutated by the orchestrator only. Events are numbered in merge order, so with
/// in-order merging the event number is reproducible run to run. Merging is idempotent by
/// segment sequence index.
#[derive(Debug, Clone)]
pub struct CumulativeStore {
    id_run: u32,
    w_config: i32,
    max_entries: Option<u64>,
    /// Events per segment the raw data was cut into, None for whole files
    split_events: Option<u64>,
    events: Vec<BuiltEvent>,
    merged: BTreeSet<u64>,
    stats: BatchStats,
    n_hits: u64,
}

impl CumulativeStore {
    pub fn new(id_run: u32, w_config: i32, max_entries: Option<u64>) -> Self {
        Self {
            id_run,
            w_config,
            max_entries,
            split_events: None,
            events: Vec::new(),
            merged: BTreeSet::new(),
            stats: BatchStats::default(),
            n_hits: 0,
        }
    }

    /// Record how the raw data is segmented; a store is only resumed under the same split
    pub fn with_split_events(mut self, split_events: Option<u64>) -> Self {
        self.split_events = split_events;
        self
    }

    /// Rebuild a store from the content of a snapshot.
    ///
    /// Events keep their numbers, so merging continues where the snapshot ended.
    pub fn restore(
        id_run: u32,
        w_config: i32,
        max_entries: Option<u64>,
        events: Vec<BuiltEvent>,
        merged: BTreeSet<u64>,
        stats: BatchStats,
    ) -> Self {
        let n_hits = events.iter().map(|e| e.nhit() as u64).sum();
        Self {
            id_run,
            w_config,
            max_entries,
            split_events: None,
            events,
            merged,
            stats,
            n_hits,
        }
    }

    pub fn merge(&mut self, batch: BuiltEventBatch) -> MergeOutcome {
        let seq = batch.seq();
        if self.merged.contains(&seq) {
            return MergeOutcome::AlreadyMerged;
        }
        if self.is_full() {
            return MergeOutcome::Full;
        }

        let room = match self.max_entries {
            Some(max) => (max - self.events.len() as u64) as usize,
            None => usize::MAX,
        };
        let offered = batch.events.len();
        let taken = offered.min(room);

        self.merged.insert(seq);
        self.stats.accumulate(&batch.stats);
        for mut event in batch.events.into_iter().take(taken) {
            event.event = self.events.len() as u64;
            self.n_hits += event.nhit() as u64;
            self.events.push(event);
        }

        if taken < offered {
            MergeOutcome::Truncated {
                n_events: taken,
                dropped: offered - taken,
            }
        } else {
            MergeOutcome::Merged { n_events: taken }
        }
    }

    pub fn is_merged(&self, seq: u64) -> bool {
        self.merged.contains(&seq)
    }

    /// `max_entries` events are held
    pub fn is_full(&self) -> bool {
        self.max_entries
            .is_some_and(|max| self.events.len() as u64 >= max)
    }

    pub fn id_run(&self) -> u32 {
        self.id_run
    }

    pub fn w_config(&self) -> i32 {
        self.w_config
    }

    pub fn split_events(&self) -> Option<u64> {
        self.split_events
    }

    /// Sequence index the next merge is expected to have
    pub fn next_seq(&self) -> u64 {
        self.merged.iter().next_back().map_or(0, |last| last + 1)
    }

    /// Number of merged segments; this is the count snapshots are named after
    pub fn n_segments(&self) -> u64 {
        self.merged.len() as u64
    }

    pub fn n_events(&self) -> u64 {
        self.events.len() as u64
    }

    pub fn n_hits(&self) -> u64 {
        self.n_hits
    }

    pub fn events(&self) -> &[BuiltEvent] {
        &self.events
    }

    /// Sequence indices of the merged segments, ascending
    pub fn segments(&self) -> impl Iterator<Item = u64> + '_ {
        self.merged.iter().copied()
    }

    /// Accumulated event building statistics of all merged segments
    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }
}

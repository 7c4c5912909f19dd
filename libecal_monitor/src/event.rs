use super::hardware_id::ChannelID;
use super::segment::RawSegment;

/// A calibrated, mapped hit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub slab: u8,
    pub chip: u8,
    pub channel: u8,
    pub x: f32,
    pub y: f32,
    /// Deposited energy in MIP
    pub energy: f32,
    pub is_low_gain: bool,
}

impl Hit {
    pub fn channel_id(&self) -> ChannelID {
        ChannelID::new(self.slab, self.chip, self.channel)
    }
}

/// A built event: all retained hits of one trigger
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltEvent {
    /// Event number in the run; assigned when the event is merged into the cumulative store
    pub event: u64,
    pub id_run: u32,
    pub id_dat: u32,
    pub cycle: u32,
    pub bcid: u16,
    /// Number of slabs with at least one hit
    pub nhit_slab: u32,
    /// Tungsten configuration of the run, carried along for the analysis
    pub w_config: i32,
    pub hits: Vec<Hit>,
}

impl BuiltEvent {
    pub fn nhit(&self) -> usize {
        self.hits.len()
    }

    pub fn sum_energy(&self) -> f32 {
        self.hits.iter().map(|h| h.energy).sum()
    }
}

/// Bookkeeping of what happened to the raw data of a segment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Triggers seen in the raw data
    pub n_raw_events: u64,
    /// Triggers dropped for having too few slabs hit
    pub n_below_min_slabs: u64,
    /// Triggers dropped because a channel was missing from the calibration
    pub n_lookup_miss: u64,
    pub n_masked_hits: u64,
    pub n_suppressed_hits: u64,
    pub n_merged_hits: u64,
}

impl BatchStats {
    pub fn accumulate(&mut self, other: &BatchStats) {
        self.n_raw_events += other.n_raw_events;
        self.n_below_min_slabs += other.n_below_min_slabs;
        self.n_lookup_miss += other.n_lookup_miss;
        self.n_masked_hits += other.n_masked_hits;
        self.n_suppressed_hits += other.n_suppressed_hits;
        self.n_merged_hits += other.n_merged_hits;
    }
}

/// Ordered events built from one segment.
///
/// Workers do not log; anything worth telling the operator travels back in `lookup_misses`.
#[derive(Debug, Clone)]
pub struct BuiltEventBatch {
    pub segment: RawSegment,
    pub events: Vec<BuiltEvent>,
    pub stats: BatchStats,
    /// The first few channels that were missing from the calibration
    pub lookup_misses: Vec<ChannelID>,
}

impl BuiltEventBatch {
    pub fn seq(&self) -> u64 {
        self.segment.seq
    }

    pub fn n_hits(&self) -> usize {
        self.events.iter().map(BuiltEvent::nhit).sum()
    }
}

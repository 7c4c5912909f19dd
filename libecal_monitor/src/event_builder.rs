use bitvec::prelude::*;
use fxhash::FxHashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};

use super::calibration::{CalibrationSet, Gain};
use super::config::{EventBuildingConfig, MergeRule};
use super::error::{RawFrameError, SegmentError};
use super::event::{BatchStats, BuiltEvent, BuiltEventBatch, Hit};
use super::hardware_id::ChannelID;
use super::raw_frame::{RawFrame, RawHit};
use super::segment::RawSegment;

/// Only the first few unknown channels of a segment are reported
const MAX_REPORTED_MISSES: usize = 8;

/// The event building switches, extracted once from the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    pub id_run: u32,
    pub w_config: i32,
    pub min_slabs_hit: u32,
    pub no_lg: bool,
    pub lg_switch_adc: u16,
    pub zero_suppress: bool,
    pub zero_suppress_n_rms: f32,
    /// None when hits on the same channel are kept separately
    pub merge_rule: Option<MergeRule>,
}

impl BuildOptions {
    pub fn from_config(config: &EventBuildingConfig, id_run: u32) -> Self {
        Self {
            id_run,
            w_config: config.w_config,
            min_slabs_hit: config.min_slabs_hit,
            no_lg: config.no_lg,
            lg_switch_adc: config.lg_switch_adc,
            zero_suppress: config.zero_suppress,
            zero_suppress_n_rms: config.zero_suppress_n_rms,
            merge_rule: if config.merge_within_chip {
                Some(config.merge_rule)
            } else {
                None
            },
        }
    }
}

/// EventBuilder takes RawFrames and composes them into calibrated BuiltEvents.
///
/// Consecutive frames sharing a trigger (cycle, bcid) belong to the same event. When a frame
/// of a new trigger arrives, the stacked frames are calibrated, mapped and filtered into an
/// event. The builder never touches shared state: everything it learns goes into its stats.
#[derive(Debug)]
pub struct EventBuilder<'a> {
    calibration: &'a CalibrationSet,
    options: &'a BuildOptions,
    id_dat: u32,
    current_key: Option<(u32, u16)>,
    frame_stack: Vec<RawFrame>,
    stats: BatchStats,
    lookup_misses: Vec<ChannelID>,
}

impl<'a> EventBuilder<'a> {
    pub fn new(calibration: &'a CalibrationSet, options: &'a BuildOptions, id_dat: u32) -> Self {
        Self {
            calibration,
            options,
            id_dat,
            current_key: None,
            frame_stack: Vec::new(),
            stats: BatchStats::default(),
            lookup_misses: Vec::new(),
        }
    }

    /// Add a frame to the event.
    ///
    /// Returns `Ok(Some(event))` when the frame started a new trigger and the previous one
    /// passed all filters. A frame from a trigger older than the current one is an error.
    /// `offset` is only used for error reporting.
    pub fn append_frame(
        &mut self,
        frame: RawFrame,
        offset: u64,
    ) -> Result<Option<BuiltEvent>, SegmentError> {
        let key = frame.header.event_key();
        match self.current_key {
            Some(current) if key < current => Err(SegmentError::EventOutOfOrder {
                offset,
                frame: key,
                current,
            }),
            Some(current) if key > current => {
                let frames = std::mem::take(&mut self.frame_stack);
                let event = self.build_event(current, &frames);
                self.current_key = Some(key);
                self.frame_stack.push(frame);
                Ok(event)
            }
            Some(_) => {
                self.frame_stack.push(frame);
                Ok(None)
            }
            None => {
                self.current_key = Some(key);
                self.frame_stack.push(frame);
                Ok(None)
            }
        }
    }

    /// Takes any remaining frames and builds them into an event.
    ///
    /// Used at the end of a segment. Returns None if there were no frames left over or the
    /// event did not pass the filters.
    pub fn flush_final_event(&mut self) -> Option<BuiltEvent> {
        let key = self.current_key.take()?;
        let frames = std::mem::take(&mut self.frame_stack);
        self.build_event(key, &frames)
    }

    /// Consume the builder, returning its bookkeeping
    pub fn finish(self) -> (BatchStats, Vec<ChannelID>) {
        (self.stats, self.lookup_misses)
    }

    fn build_event(&mut self, key: (u32, u16), frames: &[RawFrame]) -> Option<BuiltEvent> {
        self.stats.n_raw_events += 1;

        let mut hits = Vec::new();
        for frame in frames.iter() {
            for raw in frame.hits.iter().filter(|h| h.is_hit()) {
                let id = ChannelID::new(frame.header.slab, raw.chip, raw.channel);
                if self.calibration.is_masked(&id) {
                    self.stats.n_masked_hits += 1;
                    continue;
                }
                match self.calibrate(&id, raw) {
                    Ok(Some(hit)) => hits.push(hit),
                    Ok(None) => self.stats.n_suppressed_hits += 1,
                    Err(missing) => {
                        self.stats.n_lookup_miss += 1;
                        if self.lookup_misses.len() < MAX_REPORTED_MISSES
                            && !self.lookup_misses.contains(&missing)
                        {
                            self.lookup_misses.push(missing);
                        }
                        return None;
                    }
                }
            }
        }

        if let Some(rule) = self.options.merge_rule {
            self.stats.n_merged_hits += merge_hits(&mut hits, rule) as u64;
        }

        // Every retained hit was mapped, so its slab is below n_slabs
        let mut slabs_hit = bitvec![0; self.calibration.n_slabs()];
        for hit in hits.iter() {
            slabs_hit.set(hit.slab as usize, true);
        }
        let nhit_slab = slabs_hit.count_ones() as u32;
        if nhit_slab < self.options.min_slabs_hit {
            self.stats.n_below_min_slabs += 1;
            return None;
        }

        Some(BuiltEvent {
            event: 0,
            id_run: self.options.id_run,
            id_dat: self.id_dat,
            cycle: key.0,
            bcid: key.1,
            nhit_slab,
            w_config: self.options.w_config,
            hits,
        })
    }

    /// Pedestal subtraction, zero suppression, MIP conversion and mapping of a single hit.
    ///
    /// `Ok(None)` is a suppressed hit; `Err` carries the channel missing from a table.
    fn calibrate(&self, id: &ChannelID, raw: &RawHit) -> Result<Option<Hit>, ChannelID> {
        let use_lg = !self.options.no_lg && raw.adc_high >= self.options.lg_switch_adc;
        let (gain, adc) = if use_lg {
            (Gain::Low, raw.adc_low)
        } else {
            (Gain::High, raw.adc_high)
        };

        let pedestal = self.calibration.pedestal(gain, id).ok_or(*id)?;
        let signal = adc as f32 - pedestal.mean;
        if self.options.zero_suppress && signal < self.options.zero_suppress_n_rms * pedestal.rms {
            return Ok(None);
        }
        let mip = self.calibration.mip(gain, id).ok_or(*id)?;
        let (x, y) = self.calibration.position(id).ok_or(*id)?;

        Ok(Some(Hit {
            slab: id.slab,
            chip: id.chip,
            channel: id.channel,
            x,
            y,
            energy: signal / mip,
            is_low_gain: use_lg,
        }))
    }
}

/// Coalesce hits on the same channel, keeping the order of first appearance.
///
/// `Max` keeps the hit with the larger energy. `Sum` adds the energies into the first hit;
/// the result counts as low gain if any of its parts was. Returns the number of hits removed.
pub fn merge_hits(hits: &mut Vec<Hit>, rule: MergeRule) -> usize {
    let before = hits.len();
    let mut merged: Vec<Hit> = Vec::with_capacity(before);
    let mut index: FxHashMap<usize, usize> = FxHashMap::default();
    for hit in hits.drain(..) {
        let uuid = hit.channel_id().uuid();
        if let Some(&idx) = index.get(&uuid) {
            let kept = &mut merged[idx];
            match rule {
                MergeRule::Max => {
                    if hit.energy > kept.energy {
                        *kept = hit;
                    }
                }
                MergeRule::Sum => {
                    kept.energy += hit.energy;
                    kept.is_low_gain |= hit.is_low_gain;
                }
            }
        } else {
            index.insert(uuid, merged.len());
            merged.push(hit);
        }
    }
    *hits = merged;
    before - hits.len()
}

/// Build all events of a segment.
///
/// This is the unit of work of a worker. Malformed data fails the whole segment; dropped and
/// filtered events are only counted.
pub fn build_segment(
    segment: RawSegment,
    calibration: &CalibrationSet,
    options: &BuildOptions,
) -> Result<BuiltEventBatch, SegmentError> {
    let mut file = File::open(&segment.path)?;
    file.seek(SeekFrom::Start(segment.byte_range.start))?;
    let mut reader = BufReader::new(file).take(segment.len_bytes());

    let mut evb = EventBuilder::new(calibration, options, segment.id_dat);
    let mut events = Vec::new();
    let mut offset = segment.byte_range.start;
    while offset < segment.byte_range.end {
        let frame = RawFrame::read_from(&mut reader).map_err(|e| match e {
            RawFrameError::IOError(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                SegmentError::Truncated(offset)
            }
            RawFrameError::IOError(io) => SegmentError::IOError(io),
            other => SegmentError::Malformed {
                offset,
                source: other,
            },
        })?;
        let frame_size = frame.header.frame_size();
        if let Some(event) = evb.append_frame(frame, offset)? {
            events.push(event);
        }
        offset += frame_size;
    }
    if let Some(event) = evb.flush_final_event() {
        events.push(event);
    }

    let (stats, lookup_misses) = evb.finish();
    Ok(BuiltEventBatch {
        segment,
        events,
        stats,
        lookup_misses,
    })
}

use std::fmt;
use std::ops::Range;
use std::path::PathBuf;

/// Lifecycle of a raw segment: pending -> ready | dirty, ready -> consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Pending,
    Ready,
    Dirty,
    Consumed,
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Dirty => "dirty",
            Self::Consumed => "consumed",
        };
        write!(f, "{name}")
    }
}

/// A unit of raw input: a whole file or a chunk of whole events from one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSegment {
    /// Discovery order over the whole run. Only meaningful once the segment left `Pending`.
    pub seq: u64,
    /// Index of the raw file (the NNNN of `.dat_NNNN`)
    pub id_dat: u32,
    pub path: PathBuf,
    pub byte_range: Range<u64>,
    /// Number of events the watcher counted in the byte range
    pub n_events: u64,
    pub state: SegmentState,
    /// Why the segment was marked dirty
    pub dirty_reason: Option<String>,
}

impl RawSegment {
    pub fn pending(id_dat: u32, path: PathBuf, start: u64) -> Self {
        Self {
            seq: 0,
            id_dat,
            path,
            byte_range: start..start,
            n_events: 0,
            state: SegmentState::Pending,
            dirty_reason: None,
        }
    }

    pub fn len_bytes(&self) -> u64 {
        self.byte_range.end - self.byte_range.start
    }

    pub fn is_empty(&self) -> bool {
        self.len_bytes() == 0
    }

    /// Leave the pending state with a run-wide sequence index
    pub fn promote(mut self, seq: u64) -> Self {
        self.seq = seq;
        self.state = SegmentState::Ready;
        self
    }

    pub fn mark_dirty(&mut self, reason: String) {
        self.state = SegmentState::Dirty;
        self.dirty_reason = Some(reason);
    }

    pub fn mark_consumed(&mut self) {
        self.state = SegmentState::Consumed;
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

impl fmt::Display for RawSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segment {} ({} bytes {}..{}, {} events, {})",
            self.seq,
            self.file_name(),
            self.byte_range.start,
            self.byte_range.end,
            self.n_events,
            self.state
        )
    }
}

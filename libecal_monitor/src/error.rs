use std::path::PathBuf;
use thiserror::Error;

use super::constants::*;

#[derive(Debug, Error)]
pub enum RawFrameError {
    #[error("Failed to parse buffer into RawFrame: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Incorrect magic {0:#06x} found for RawFrame; expected {exp:#06x}", exp=FRAME_MAGIC)]
    BadMagic(u16),
    #[error("RawFrame claims {0} hits; at most {max} are possible", max=MAX_HITS_PER_FRAME)]
    TooManyHits(u16),
    #[error("RawFrame checksum mismatch -- stored: {stored:#06x} computed: {computed:#06x}")]
    BadChecksum { stored: u16, computed: u16 },
    #[error("Invalid chip {0} found in RawFrame")]
    BadChip(u8),
    #[error("Invalid channel {0} found in RawFrame")]
    BadChannel(u8),
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("Segment could not be read due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Segment holds a malformed frame at byte {offset}: {source}")]
    Malformed {
        offset: u64,
        #[source]
        source: RawFrameError,
    },
    #[error("Segment holds a frame that is out of order at byte {offset} -- frame event ({0}, {1}) after ({2}, {3})", .frame.0, .frame.1, .current.0, .current.1)]
    EventOutOfOrder {
        offset: u64,
        frame: (u32, u16),
        current: (u32, u16),
    },
    #[error("Segment ends with a truncated frame at byte {0}")]
    Truncated(u64),
    #[error("Worker panicked while building the segment: {0}")]
    WorkerPanic(String),
    #[error("Worker did not finish the segment within {0} seconds")]
    Timeout(u64),
}

impl SegmentError {
    /// Malformed data stays malformed; only transient failures are worth a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IOError(_) | Self::WorkerPanic(_) | Self::Timeout(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("RawWatcher failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("RawWatcher could not access the raw run folder {0:?}")]
    BadRawDirectory(PathBuf),
}

#[derive(Debug, Error)]
pub enum AsuError {
    #[error("Found invalid ASU version: {0}")]
    InvalidVersion(String),
}

#[derive(Debug, Error)]
pub enum CalibrationLoadError {
    #[error("Calibration file {0:?} does not exist")]
    MissingFile(PathBuf),
    #[error("Calibration file {0:?} could not be read: {1}")]
    IOError(PathBuf, std::io::Error),
    #[error("Calibration file {path:?} is malformed at line {line}: {reason}")]
    BadFileFormat {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("Calibration requires the {0} table, but no file was configured")]
    MissingTable(&'static str),
    #[error("Calibration failed due to an ASU error: {0}")]
    AsuError(#[from] AsuError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has an invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("Config failed due to an ASU error: {0}")]
    AsuError(#[from] AsuError),
    #[error("Raw run folder {0:?} does not exist")]
    BadRawDirectory(PathBuf),
    #[error("{file} must exist in the raw run folder {0:?}", file=RUN_SETTINGS_FILE)]
    MissingRunSettings(PathBuf),
    #[error("Output directory {0:?} is not empty and holds no {file}; refusing to reuse it", file=LOG_FILE)]
    ForeignOutputDirectory(PathBuf),
    #[error("Config failed to format a timestamp: {0}")]
    TimeFormat(#[from] time::error::Format),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("Snapshot failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Snapshot failed to encode attribute {0}")]
    Encoding(String),
    #[error("Snapshot file {0:?} is inconsistent: {1}")]
    Inconsistent(PathBuf, String),
}

#[derive(Debug, Error)]
pub enum QualityError {
    #[error("Hit on slab {0} but only {1} slabs are configured")]
    SlabOutOfRange(u8, usize),
    #[error("Hit on chip {0} but a slab only has {max} chips", max=NUMBER_OF_CHIPS)]
    ChipOutOfRange(u8),
    #[error("Hit on slab {slab} chip {chip} has non-finite energy")]
    NonFiniteEnergy { slab: u8, chip: u8 },
    #[error("Quality record could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("WorkerPool lost all of its workers")]
    Disconnected,
    #[error("WorkerPool could not spawn a worker: {0}")]
    SpawnError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Monitoring failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Monitoring failed due to calibration error: {0}")]
    CalibrationError(#[from] CalibrationLoadError),
    #[error("Monitoring failed due to RawWatcher error: {0}")]
    WatchError(#[from] WatchError),
    #[error("Monitoring failed due to WorkerPool error: {0}")]
    PoolError(#[from] PoolError),
    #[error("Monitoring aborted on dirty segment {seq} of {path:?} (skip_dirty_dat is false): {reason}")]
    DirtyData {
        seq: u64,
        path: PathBuf,
        reason: String,
    },
    #[error("Monitoring failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

use bit_set::BitSet;
use fxhash::FxHashMap;
use std::path::Path;
use std::str::FromStr;

use super::channel_map::ChannelMap;
use super::config::EventBuildingConfig;
use super::constants::{NUMBER_OF_CHANNELS, NUMBER_OF_CHIPS};
use super::error::CalibrationLoadError;
use super::hardware_id::{AsuVersion, ChannelID};

/// Which amplification branch of a channel a value belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gain {
    High,
    Low,
}

/// Baseline of a channel in ADC counts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pedestal {
    pub mean: f32,
    pub rms: f32,
}

/// Pedestals per channel, read from `slab chip channel mean rms` rows
#[derive(Debug, Clone, Default)]
pub struct PedestalTable {
    map: FxHashMap<usize, Pedestal>,
}

impl PedestalTable {
    /// Rows must address one of the first `n_slabs` slabs
    pub fn new(path: &Path, n_slabs: usize) -> Result<Self, CalibrationLoadError> {
        let mut table = Self::default();
        for (line, entries) in read_table(path, 5)? {
            let id = parse_channel_id(path, line, &entries, n_slabs)?;
            let mean: f32 = parse_field(path, line, &entries[3])?;
            let rms: f32 = parse_field(path, line, &entries[4])?;
            if rms < 0.0 || !rms.is_finite() || !mean.is_finite() {
                return Err(bad_line(path, line, "pedestal mean/rms must be finite, rms >= 0"));
            }
            table.map.insert(id.uuid(), Pedestal { mean, rms });
        }
        Ok(table)
    }

    pub fn get(&self, id: &ChannelID) -> Option<Pedestal> {
        self.map.get(&id.uuid()).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// MIP most-probable value per channel in ADC counts, read from `slab chip channel mip` rows
#[derive(Debug, Clone, Default)]
pub struct MipTable {
    map: FxHashMap<usize, f32>,
}

impl MipTable {
    pub fn new(path: &Path, n_slabs: usize) -> Result<Self, CalibrationLoadError> {
        let mut table = Self::default();
        for (line, entries) in read_table(path, 4)? {
            let id = parse_channel_id(path, line, &entries, n_slabs)?;
            let mip: f32 = parse_field(path, line, &entries[3])?;
            if mip <= 0.0 || !mip.is_finite() {
                return Err(bad_line(path, line, "MIP value must be positive"));
            }
            table.map.insert(id.uuid(), mip);
        }
        Ok(table)
    }

    pub fn get(&self, id: &ChannelID) -> Option<f32> {
        self.map.get(&id.uuid()).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Everything the event building needs to know about the detector.
///
/// Loaded once at the start of a run and shared read-only (behind an `Arc`) with every
/// worker. There is no way to mutate a CalibrationSet after [`CalibrationSet::load`].
#[derive(Debug, Clone)]
pub struct CalibrationSet {
    pedestals_hg: PedestalTable,
    pedestals_lg: Option<PedestalTable>,
    mip_hg: MipTable,
    mip_lg: Option<MipTable>,
    asu_versions: Vec<AsuVersion>,
    fev_map: ChannelMap,
    cob_map: Option<ChannelMap>,
    masked: BitSet,
}

impl CalibrationSet {
    /// Load every table named by the event building configuration.
    ///
    /// Low gain tables are only read when `no_lg` is false; the COB table only when a slab
    /// carries a COB. A missing or malformed file fails the whole load.
    pub fn load(config: &EventBuildingConfig) -> Result<Self, CalibrationLoadError> {
        let asu_versions = config.parsed_asu_versions()?;
        let n_slabs = asu_versions.len();

        let pedestals_hg = PedestalTable::new(&config.pedestals_file, n_slabs)?;
        let mip_hg = MipTable::new(&config.mip_calibration_file, n_slabs)?;
        let (pedestals_lg, mip_lg) = if config.no_lg {
            (None, None)
        } else {
            let ped_path = config
                .pedestals_lg_file
                .as_ref()
                .ok_or(CalibrationLoadError::MissingTable("low gain pedestal"))?;
            let mip_path = config
                .mip_calibration_lg_file
                .as_ref()
                .ok_or(CalibrationLoadError::MissingTable("low gain MIP"))?;
            (
                Some(PedestalTable::new(ped_path, n_slabs)?),
                Some(MipTable::new(mip_path, n_slabs)?),
            )
        };

        let fev_map = ChannelMap::new(&config.mapping_file)?;
        let cob_map = if asu_versions.iter().any(AsuVersion::is_cob) {
            let cob_path = config
                .mapping_file_cob
                .as_ref()
                .ok_or(CalibrationLoadError::MissingTable("COB mapping"))?;
            Some(ChannelMap::new(cob_path)?)
        } else {
            None
        };

        let mut masked = BitSet::new();
        if let Some(path) = config.masked_channels_file.as_ref() {
            for (line, entries) in read_table(path, 3)? {
                masked.insert(parse_channel_id(path, line, &entries, n_slabs)?.uuid());
            }
        }

        Ok(Self {
            pedestals_hg,
            pedestals_lg,
            mip_hg,
            mip_lg,
            asu_versions,
            fev_map,
            cob_map,
            masked,
        })
    }

    pub fn n_slabs(&self) -> usize {
        self.asu_versions.len()
    }

    pub fn asu_version(&self, slab: u8) -> Option<AsuVersion> {
        self.asu_versions.get(slab as usize).copied()
    }

    pub fn has_low_gain(&self) -> bool {
        self.pedestals_lg.is_some() && self.mip_lg.is_some()
    }

    pub fn pedestal(&self, gain: Gain, id: &ChannelID) -> Option<Pedestal> {
        match gain {
            Gain::High => self.pedestals_hg.get(id),
            Gain::Low => self.pedestals_lg.as_ref()?.get(id),
        }
    }

    pub fn mip(&self, gain: Gain, id: &ChannelID) -> Option<f32> {
        match gain {
            Gain::High => self.mip_hg.get(id),
            Gain::Low => self.mip_lg.as_ref()?.get(id),
        }
    }

    /// Pad position of a channel, using the table that matches the slab's ASU version
    pub fn position(&self, id: &ChannelID) -> Option<(f32, f32)> {
        let map = match self.asu_version(id.slab)? {
            AsuVersion::Cob => self.cob_map.as_ref()?,
            AsuVersion::Fev(_) => &self.fev_map,
        };
        map.get_position(id.chip, id.channel)
    }

    pub fn is_masked(&self, id: &ChannelID) -> bool {
        self.masked.contains(id.uuid())
    }

    pub fn n_masked(&self) -> usize {
        self.masked.len()
    }
}

/// Read a whitespace separated table. `#` starts a comment; blank lines are skipped.
///
/// Returns the 1-based line number together with the fields of each data row. Every data row
/// must have exactly `columns` fields.
pub(crate) fn read_table(
    path: &Path,
    columns: usize,
) -> Result<Vec<(usize, Vec<String>)>, CalibrationLoadError> {
    if !path.exists() {
        return Err(CalibrationLoadError::MissingFile(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|e| CalibrationLoadError::IOError(path.to_path_buf(), e))?;

    let mut rows = Vec::new();
    for (idx, raw_line) in contents.lines().enumerate() {
        let data = match raw_line.split_once('#') {
            Some((data, _comment)) => data,
            None => raw_line,
        };
        let entries: Vec<String> = data.split_whitespace().map(String::from).collect();
        if entries.is_empty() {
            continue;
        }
        if entries.len() != columns {
            return Err(bad_line(
                path,
                idx + 1,
                &format!("expected {columns} columns, found {}", entries.len()),
            ));
        }
        rows.push((idx + 1, entries));
    }
    Ok(rows)
}

pub(crate) fn parse_field<T: FromStr>(
    path: &Path,
    line: usize,
    field: &str,
) -> Result<T, CalibrationLoadError> {
    field
        .parse::<T>()
        .map_err(|_| bad_line(path, line, &format!("could not parse '{field}'")))
}

/// The first three fields of a row. Out of range ids would alias another channel's uuid.
fn parse_channel_id(
    path: &Path,
    line: usize,
    entries: &[String],
    n_slabs: usize,
) -> Result<ChannelID, CalibrationLoadError> {
    let slab: u8 = parse_field(path, line, &entries[0])?;
    let chip: u8 = parse_field(path, line, &entries[1])?;
    let channel: u8 = parse_field(path, line, &entries[2])?;
    if slab as usize >= n_slabs {
        return Err(bad_line(
            path,
            line,
            &format!("slab {slab} out of range, {n_slabs} slabs are configured"),
        ));
    }
    if chip >= NUMBER_OF_CHIPS || channel >= NUMBER_OF_CHANNELS {
        return Err(bad_line(
            path,
            line,
            &format!("chip {chip} / channel {channel} out of range"),
        ));
    }
    Ok(ChannelID::new(slab, chip, channel))
}

fn bad_line(path: &Path, line: usize, reason: &str) -> CalibrationLoadError {
    CalibrationLoadError::BadFileFormat {
        path: path.to_path_buf(),
        line,
        reason: reason.to_string(),
    }
}

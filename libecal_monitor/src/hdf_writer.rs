use hdf5::types::VarLenUnicode;
use hdf5::{File, Group, H5Type};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::constants::FORMAT_VERSION;
use super::error::SnapshotError;
use super::event::{BatchStats, BuiltEvent, Hit};
use super::store::CumulativeStore;

const EVENTS_NAME: &str = "events";
const HITS_NAME: &str = "hits";
const SEGMENTS_NAME: &str = "segments";

/// A simple struct which wraps around the hdf5-rust library.
///
/// Dumps a whole CumulativeStore into one HDF5 file. Events are stored column-wise; the hits
/// of event `i` are rows `hit_offset[i] .. hit_offset[i] + nhit[i]` of the hit columns.
#[derive(Debug)]
pub struct HDFWriter {
    file_handle: File,
    path: PathBuf,
}
// Structure
// events - id_run, n_events, n_segments, w_config, binary_split_M, version, statistics
// |---- event, id_dat, cycle, bcid, nhit_slab, nhit, hit_offset (dset)
// hits
// |---- slab, chip, channel, x, y, energy, is_low_gain (dset)
// segments (dset)

impl HDFWriter {
    /// Create the writer, creating (or truncating) the file at path
    pub fn new(path: &Path) -> Result<Self, SnapshotError> {
        let file_handle = File::create(path)?;
        Ok(Self {
            file_handle,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write every event of the store together with the run metadata
    pub fn write_store(&self, store: &CumulativeStore) -> Result<(), SnapshotError> {
        let events = store.events();
        let monitor_version = format!("{}:{}", env!("CARGO_PKG_NAME"), FORMAT_VERSION);

        let events_group = self.file_handle.create_group(EVENTS_NAME)?;
        events_group
            .new_attr::<u32>()
            .create("id_run")?
            .write_scalar(&store.id_run())?;
        events_group
            .new_attr::<u64>()
            .create("n_events")?
            .write_scalar(&store.n_events())?;
        events_group
            .new_attr::<u64>()
            .create("n_segments")?
            .write_scalar(&store.n_segments())?;
        events_group
            .new_attr::<i32>()
            .create("w_config")?
            .write_scalar(&store.w_config())?;
        events_group
            .new_attr::<i64>()
            .create("binary_split_M")?
            .write_scalar(&store.split_events().map_or(-1, |n| n as i64))?;
        for (name, value) in stats_attrs(store.stats()) {
            events_group.new_attr::<u64>().create(name)?.write_scalar(&value)?;
        }
        let version = VarLenUnicode::from_str(&monitor_version)
            .map_err(|_| SnapshotError::Encoding(String::from("version")))?;
        events_group
            .new_attr::<VarLenUnicode>()
            .create("version")?
            .write_scalar(&version)?;

        let mut hit_offset = Vec::with_capacity(events.len());
        let mut offset: u64 = 0;
        for event in events.iter() {
            hit_offset.push(offset);
            offset += event.nhit() as u64;
        }
        write_column(&events_group, "event", &column(events, |e| e.event))?;
        write_column(&events_group, "id_dat", &column(events, |e| e.id_dat))?;
        write_column(&events_group, "cycle", &column(events, |e| e.cycle))?;
        write_column(&events_group, "bcid", &column(events, |e| e.bcid))?;
        write_column(&events_group, "nhit_slab", &column(events, |e| e.nhit_slab))?;
        write_column(&events_group, "nhit", &column(events, |e| e.nhit() as u32))?;
        write_column(&events_group, "hit_offset", &hit_offset)?;

        let hits_group = self.file_handle.create_group(HITS_NAME)?;
        let hits: Vec<_> = events.iter().flat_map(|e| e.hits.iter()).collect();
        write_column(&hits_group, "slab", &column(&hits, |h| h.slab))?;
        write_column(&hits_group, "chip", &column(&hits, |h| h.chip))?;
        write_column(&hits_group, "channel", &column(&hits, |h| h.channel))?;
        write_column(&hits_group, "x", &column(&hits, |h| h.x))?;
        write_column(&hits_group, "y", &column(&hits, |h| h.y))?;
        write_column(&hits_group, "energy", &column(&hits, |h| h.energy))?;
        write_column(
            &hits_group,
            "is_low_gain",
            &column(&hits, |h| h.is_low_gain as u8),
        )?;

        let segments: Vec<u64> = store.segments().collect();
        if segments.is_empty() {
            self.file_handle
                .new_dataset::<u64>()
                .shape(0)
                .create(SEGMENTS_NAME)?;
        } else {
            self.file_handle
                .new_dataset_builder()
                .with_data(segments.as_slice())
                .create(SEGMENTS_NAME)?;
        }
        Ok(())
    }

    /// Flush and release the file
    pub fn close(self) -> Result<(), SnapshotError> {
        self.file_handle.flush()?;
        self.file_handle.close()?;
        Ok(())
    }
}

fn stats_attrs(stats: &BatchStats) -> [(&'static str, u64); 6] {
    [
        ("n_raw_events", stats.n_raw_events),
        ("n_below_min_slabs", stats.n_below_min_slabs),
        ("n_lookup_miss", stats.n_lookup_miss),
        ("n_masked_hits", stats.n_masked_hits),
        ("n_suppressed_hits", stats.n_suppressed_hits),
        ("n_merged_hits", stats.n_merged_hits),
    ]
}

fn column<E, T>(items: &[E], f: impl Fn(&E) -> T) -> Vec<T> {
    items.iter().map(f).collect()
}

fn write_column<T: H5Type>(group: &Group, name: &str, data: &[T]) -> Result<(), SnapshotError> {
    if data.is_empty() {
        group.new_dataset::<T>().shape(0).create(name)?;
    } else {
        group.new_dataset_builder().with_data(data).create(name)?;
    }
    Ok(())
}

/// Write a complete snapshot file in one go
pub fn write_snapshot(path: &Path, store: &CumulativeStore) -> Result<(), SnapshotError> {
    let writer = HDFWriter::new(path)?;
    writer.write_store(store)?;
    writer.close()
}

/// The header of a snapshot plus the per-event slab counts
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotSummary {
    pub id_run: u32,
    pub n_events: u64,
    pub n_segments: u64,
    pub w_config: i32,
    pub split_events: Option<u64>,
    pub version: String,
    pub stats: BatchStats,
    pub nhit_slab: Vec<u32>,
    pub n_hits: u64,
    pub segments: Vec<u64>,
}

/// Read back what a snapshot claims to hold and check it against its datasets
pub fn read_snapshot_summary(path: &Path) -> Result<SnapshotSummary, SnapshotError> {
    let file = File::open(path)?;
    let events_group = file.group(EVENTS_NAME)?;
    let hits_group = file.group(HITS_NAME)?;

    let n_events = events_group.attr("n_events")?.read_scalar::<u64>()?;
    let nhit_slab = events_group.dataset("nhit_slab")?.read_raw::<u32>()?;
    if nhit_slab.len() as u64 != n_events {
        return Err(SnapshotError::Inconsistent(
            path.to_path_buf(),
            format!(
                "n_events is {n_events} but {} events are stored",
                nhit_slab.len()
            ),
        ));
    }
    let segments = file.dataset(SEGMENTS_NAME)?.read_raw::<u64>()?;
    let n_segments = events_group.attr("n_segments")?.read_scalar::<u64>()?;
    if segments.len() as u64 != n_segments {
        return Err(SnapshotError::Inconsistent(
            path.to_path_buf(),
            format!(
                "n_segments is {n_segments} but {} segments are listed",
                segments.len()
            ),
        ));
    }

    let split = events_group.attr("binary_split_M")?.read_scalar::<i64>()?;
    let read_stat = |name: &str| -> Result<u64, SnapshotError> {
        Ok(events_group.attr(name)?.read_scalar::<u64>()?)
    };

    Ok(SnapshotSummary {
        id_run: events_group.attr("id_run")?.read_scalar::<u32>()?,
        n_events,
        n_segments,
        w_config: events_group.attr("w_config")?.read_scalar::<i32>()?,
        split_events: if split > 0 { Some(split as u64) } else { None },
        stats: BatchStats {
            n_raw_events: read_stat("n_raw_events")?,
            n_below_min_slabs: read_stat("n_below_min_slabs")?,
            n_lookup_miss: read_stat("n_lookup_miss")?,
            n_masked_hits: read_stat("n_masked_hits")?,
            n_suppressed_hits: read_stat("n_suppressed_hits")?,
            n_merged_hits: read_stat("n_merged_hits")?,
        },
        version: events_group
            .attr("version")?
            .read_scalar::<VarLenUnicode>()?
            .as_str()
            .to_string(),
        nhit_slab,
        n_hits: hits_group.dataset("energy")?.size() as u64,
        segments,
    })
}

/// Read a whole snapshot back into a store, the inverse of [`write_snapshot`]
pub fn read_snapshot(path: &Path, max_entries: Option<u64>) -> Result<CumulativeStore, SnapshotError> {
    let summary = read_snapshot_summary(path)?;
    let file = File::open(path)?;
    let events_group = file.group(EVENTS_NAME)?;
    let hits_group = file.group(HITS_NAME)?;
    let inconsistent = |what: String| SnapshotError::Inconsistent(path.to_path_buf(), what);

    let event = events_group.dataset("event")?.read_raw::<u64>()?;
    let id_dat = events_group.dataset("id_dat")?.read_raw::<u32>()?;
    let cycle = events_group.dataset("cycle")?.read_raw::<u32>()?;
    let bcid = events_group.dataset("bcid")?.read_raw::<u16>()?;
    let nhit = events_group.dataset("nhit")?.read_raw::<u32>()?;
    let hit_offset = events_group.dataset("hit_offset")?.read_raw::<u64>()?;
    let n_events = summary.n_events as usize;
    if [event.len(), id_dat.len(), cycle.len(), bcid.len(), nhit.len(), hit_offset.len()]
        .iter()
        .any(|len| *len != n_events)
    {
        return Err(inconsistent(String::from("event columns differ in length")));
    }

    let slab = hits_group.dataset("slab")?.read_raw::<u8>()?;
    let chip = hits_group.dataset("chip")?.read_raw::<u8>()?;
    let channel = hits_group.dataset("channel")?.read_raw::<u8>()?;
    let x = hits_group.dataset("x")?.read_raw::<f32>()?;
    let y = hits_group.dataset("y")?.read_raw::<f32>()?;
    let energy = hits_group.dataset("energy")?.read_raw::<f32>()?;
    let is_low_gain = hits_group.dataset("is_low_gain")?.read_raw::<u8>()?;
    let n_hits = summary.n_hits as usize;
    if [slab.len(), chip.len(), channel.len(), x.len(), y.len(), is_low_gain.len()]
        .iter()
        .any(|len| *len != n_hits)
    {
        return Err(inconsistent(String::from("hit columns differ in length")));
    }

    let mut events = Vec::with_capacity(n_events);
    for idx in 0..n_events {
        let start = hit_offset[idx] as usize;
        let end = start + nhit[idx] as usize;
        if end > n_hits {
            return Err(inconsistent(format!(
                "event {} points past the last hit",
                event[idx]
            )));
        }
        let hits = (start..end)
            .map(|h| Hit {
                slab: slab[h],
                chip: chip[h],
                channel: channel[h],
                x: x[h],
                y: y[h],
                energy: energy[h],
                is_low_gain: is_low_gain[h] != 0,
            })
            .collect();
        events.push(BuiltEvent {
            event: event[idx],
            id_run: summary.id_run,
            id_dat: id_dat[idx],
            cycle: cycle[idx],
            bcid: bcid[idx],
            nhit_slab: summary.nhit_slab[idx],
            w_config: summary.w_config,
            hits,
        });
    }

    Ok(CumulativeStore::restore(
        summary.id_run,
        summary.w_config,
        max_entries,
        events,
        summary.segments.iter().copied().collect::<BTreeSet<u64>>(),
        summary.stats,
    )
    .with_split_events(summary.split_events))
}

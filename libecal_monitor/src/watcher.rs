use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::constants::{RAW_FILE_MARKERS, RAW_INDEX_DIGITS, RUN_FINISHED_MARKER};
use super::error::WatchError;
use super::segment::RawSegment;
use super::splitter::RawFileScan;

/// RawWatcher discovers raw files in the run folder and turns their content into segments.
///
/// The watcher is purely observational: it never writes to the raw folder. Every call to
/// [`RawWatcher::poll`] returns the segments that became available since the previous call,
/// possibly none. Files are handed out in file-index order; a file is only considered closed
/// once a later file exists (or the run-finished marker appeared) and its size did not change
/// between two polls.
#[derive(Debug)]
pub struct RawWatcher {
    raw_dir: PathBuf,
    split_events: Option<u64>,
    scans: BTreeMap<u32, RawFileScan>,
    next_seq: u64,
    /// Segments below this index were merged by an earlier session and are not handed out
    resume_seq: u64,
    /// Files that were listed once but could not be found since
    missing: BTreeSet<u32>,
    marker_seen: bool,
    stopped: bool,
}

impl RawWatcher {
    pub fn new(raw_dir: &Path, split_events: Option<u64>) -> Result<Self, WatchError> {
        if !raw_dir.is_dir() {
            return Err(WatchError::BadRawDirectory(raw_dir.to_path_buf()));
        }
        Ok(Self {
            raw_dir: raw_dir.to_path_buf(),
            split_events,
            scans: BTreeMap::new(),
            next_seq: 0,
            resume_seq: 0,
            missing: BTreeSet::new(),
            marker_seen: false,
            stopped: false,
        })
    }

    /// Look for new data. Never blocks; an empty Vec means nothing is ready yet.
    pub fn poll(&mut self) -> Result<Vec<RawSegment>, WatchError> {
        let mut ready = Vec::new();
        if self.stopped {
            return Ok(ready);
        }

        // Read the marker before listing, so no file can appear after we decided the run is over
        let marker_now = self.raw_dir.join(RUN_FINISHED_MARKER).exists();
        if marker_now && !self.marker_seen {
            log::info!("The run has finished. Monitoring will try to catch up now.");
        }
        self.marker_seen = marker_now;

        for (id_dat, path) in self.list_raw_files()? {
            self.scans
                .entry(id_dat)
                .or_insert_with(|| RawFileScan::new(id_dat, &path, self.split_events));
        }
        let largest_id = self.scans.keys().next_back().copied();

        for (id_dat, scan) in self.scans.iter_mut() {
            if scan.is_done() {
                continue;
            }
            let size = match scan.path().metadata() {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if self.missing.insert(*id_dat) {
                        log::warn!(
                            "Raw file {} disappeared; waiting for it to come back.",
                            scan.path().to_string_lossy()
                        );
                    }
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            self.missing.remove(id_dat);
            let stable = scan.observe_size(size);
            let has_successor = largest_id.is_some_and(|largest| *id_dat < largest);
            let closed = stable && (has_successor || self.marker_seen);
            match scan.advance(size, closed, &mut self.next_seq) {
                Ok(segments) => ready.extend(segments),
                // Removed between the size check and the open; nothing was consumed
                Err(e) if e.kind() == ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
            if !scan.is_done() {
                // Later files wait, so sequence order follows file order
                break;
            }
        }

        let resume_seq = self.resume_seq;
        ready.retain(|segment| segment.seq >= resume_seq);
        Ok(ready)
    }

    /// Do not hand out segments with a sequence index below `seq`. Files are still scanned so
    /// the indices of later segments stay the same as in the earlier session.
    pub fn skip_below(&mut self, seq: u64) {
        self.resume_seq = seq;
    }

    /// The run is over and every byte of every file was handed out
    pub fn is_finished(&self) -> bool {
        self.stopped || (self.marker_seen && self.scans.values().all(RawFileScan::is_done))
    }

    /// The end-of-run marker was seen
    pub fn run_finished_marker_seen(&self) -> bool {
        self.marker_seen
    }

    /// Stop handing out segments (graceful stop or event cap reached)
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn n_files(&self) -> usize {
        self.scans.len()
    }

    /// Number of segments handed out so far
    pub fn n_segments(&self) -> u64 {
        self.next_seq
    }

    /// All files in the run folder named like `*.dat_NNNN` or `*.bin_NNNN`, by index
    fn list_raw_files(&self) -> Result<BTreeMap<u32, PathBuf>, WatchError> {
        let mut files = BTreeMap::new();
        for item in self.raw_dir.read_dir()? {
            let item_path = item?.path();
            if !item_path.is_file() {
                continue;
            }
            if let Some(id_dat) = raw_file_index(&item_path) {
                if let Some(previous) = files.insert(id_dat, item_path.clone()) {
                    log::warn!(
                        "Two raw files share index {id_dat}: {} and {}. Only the latter is monitored.",
                        previous.to_string_lossy(),
                        item_path.to_string_lossy()
                    );
                }
            }
        }
        Ok(files)
    }
}

/// Extract the file index from a raw file name, None if the name does not match
pub fn raw_file_index(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    if name.len() < RAW_INDEX_DIGITS {
        return None;
    }
    let (head, digits) = name.split_at(name.len() - RAW_INDEX_DIGITS);
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if !RAW_FILE_MARKERS.iter().any(|marker| head.ends_with(marker)) {
        return None;
    }
    digits.parse().ok()
}

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::config::SnapshotConfig;
use super::constants::{CURRENT_BUILD_FILE, SNAPSHOT_DIR, TMP_DIR};
use super::error::SnapshotError;
use super::hdf_writer::write_snapshot;
use super::store::CumulativeStore;

/// Decides at which merged-segment counts a snapshot is due
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCadence {
    after: BTreeSet<u64>,
    every: Option<u64>,
}

impl SnapshotCadence {
    pub fn new(config: &SnapshotConfig) -> Self {
        Self {
            after: config.after.iter().copied().collect(),
            every: if config.every > 0 {
                Some(config.every as u64)
            } else {
                None
            },
        }
    }

    /// A count is due if it is listed in `after`, or it lies past the largest `after` entry and
    /// is a multiple of `every`
    pub fn is_due(&self, count: u64) -> bool {
        if count == 0 {
            return false;
        }
        if self.after.contains(&count) {
            return true;
        }
        let last_after = self.after.iter().next_back().copied().unwrap_or(0);
        match self.every {
            Some(every) => count > last_after && count % every == 0,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    /// Everything merged so far is in the newest snapshot
    Idle,
    /// Merged data not yet covered by a snapshot
    Accumulating,
    Flushing,
}

/// A snapshot that was written successfully
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub count: u64,
    pub n_events: u64,
    pub path: PathBuf,
}

/// Persists the CumulativeStore at the configured cadence.
///
/// A snapshot is written into `tmp/` and renamed into `snapshots/` once complete, then
/// `current_build.h5` is refreshed the same way. With `delete_previous` the superseded
/// snapshot is removed only after its successor is in place. A failed flush never touches
/// the store or the previous snapshot; the next due count tries again.
#[derive(Debug)]
pub struct SnapshotManager {
    cadence: SnapshotCadence,
    delete_previous: bool,
    tmp_dir: PathBuf,
    snapshot_dir: PathBuf,
    current_build: PathBuf,
    state: SnapshotState,
    last: Option<SnapshotRecord>,
    n_written: u64,
    n_failed: u64,
}

impl SnapshotManager {
    /// `output_dir` must already hold the `tmp` and `snapshots` directories
    pub fn new(config: &SnapshotConfig, output_dir: &Path) -> Self {
        Self {
            cadence: SnapshotCadence::new(config),
            delete_previous: config.delete_previous,
            tmp_dir: output_dir.join(TMP_DIR),
            snapshot_dir: output_dir.join(SNAPSHOT_DIR),
            current_build: output_dir.join(CURRENT_BUILD_FILE),
            state: SnapshotState::Idle,
            last: None,
            n_written: 0,
            n_failed: 0,
        }
    }

    pub fn state(&self) -> SnapshotState {
        self.state
    }

    pub fn last(&self) -> Option<&SnapshotRecord> {
        self.last.as_ref()
    }

    pub fn n_written(&self) -> u64 {
        self.n_written
    }

    pub fn n_failed(&self) -> u64 {
        self.n_failed
    }

    pub fn snapshot_path(&self, count: u64) -> PathBuf {
        self.snapshot_dir.join(snapshot_file_name(count))
    }

    /// Continue after a snapshot written by an earlier session
    pub fn resume(&mut self, record: SnapshotRecord) {
        self.last = Some(record);
        self.state = SnapshotState::Idle;
    }

    /// Call after every merge. Flushes if the store's segment count is due.
    pub fn on_merge(&mut self, store: &CumulativeStore) -> Option<SnapshotRecord> {
        self.state = SnapshotState::Accumulating;
        if self.cadence.is_due(store.n_segments()) {
            self.try_flush(store)
        } else {
            None
        }
    }

    /// Flush at the end of the run, unless the newest snapshot already covers the store
    pub fn final_flush(&mut self, store: &CumulativeStore) -> Option<SnapshotRecord> {
        if let Some(last) = self.last.as_ref() {
            if last.count >= store.n_segments() {
                log::info!(
                    "Snapshot of {} segments is already up to date; no final flush needed.",
                    last.count
                );
                self.state = SnapshotState::Idle;
                return None;
            }
        }
        log::info!("Performing the final snapshot flush...");
        self.try_flush(store)
    }

    /// Flush and log the outcome; failures are reported, never propagated
    fn try_flush(&mut self, store: &CumulativeStore) -> Option<SnapshotRecord> {
        match self.flush(store) {
            Ok(record) => Some(record),
            Err(e) => {
                self.n_failed += 1;
                self.state = SnapshotState::Accumulating;
                log::error!(
                    "Snapshot of {} segments failed: {e}. The data is kept and the next snapshot will retry.",
                    store.n_segments()
                );
                None
            }
        }
    }

    /// Write the store to a new snapshot file
    pub fn flush(&mut self, store: &CumulativeStore) -> Result<SnapshotRecord, SnapshotError> {
        let count = store.n_segments();
        if let Some(last) = self.last.as_ref() {
            if count <= last.count {
                return Err(SnapshotError::Inconsistent(
                    last.path.clone(),
                    format!("newest snapshot already covers {} segments, asked for {count}", last.count),
                ));
            }
        }
        self.state = SnapshotState::Flushing;

        let file_name = snapshot_file_name(count);
        let tmp_path = self.tmp_dir.join(&file_name);
        let final_path = self.snapshot_dir.join(&file_name);
        let written = write_snapshot(&tmp_path, store)
            .and_then(|_| std::fs::rename(&tmp_path, &final_path).map_err(SnapshotError::from));
        if let Err(e) = written {
            // Partial file must not linger in tmp
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }

        let tmp_build = self.tmp_dir.join(CURRENT_BUILD_FILE);
        let refreshed = std::fs::copy(&final_path, &tmp_build)
            .and_then(|_| std::fs::rename(&tmp_build, &self.current_build));
        if let Err(e) = refreshed {
            // The snapshot itself is in place, only the convenience copy is stale
            let _ = std::fs::remove_file(&tmp_build);
            log::warn!(
                "Could not refresh {}: {e}",
                self.current_build.to_string_lossy()
            );
        }

        let size = final_path.metadata().map(|m| m.len()).unwrap_or(0);
        log::info!(
            "Snapshot {} written: {} events from {} segments ({}).",
            file_name,
            store.n_events(),
            count,
            human_bytes::human_bytes(size as f64)
        );

        let record = SnapshotRecord {
            count,
            n_events: store.n_events(),
            path: final_path,
        };
        if let Some(previous) = self.last.replace(record.clone()) {
            if self.delete_previous {
                if let Err(e) = std::fs::remove_file(&previous.path) {
                    log::warn!(
                        "Could not delete previous snapshot {}: {e}",
                        previous.path.to_string_lossy()
                    );
                }
            }
        }
        self.n_written += 1;
        self.state = SnapshotState::Idle;
        Ok(record)
    }
}

pub fn snapshot_file_name(count: u64) -> String {
    format!("snapshot_{count:06}.h5")
}

/// Segment count of a file named by [`snapshot_file_name`]
pub fn snapshot_count(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("snapshot_")?
        .strip_suffix(".h5")?
        .parse()
        .ok()
}

/// The snapshot covering the most segments in `snapshot_dir`, if any
pub fn latest_snapshot(snapshot_dir: &Path) -> Option<(u64, PathBuf)> {
    snapshot_dir
        .read_dir()
        .ok()?
        .filter_map(|item| item.ok())
        .filter_map(|item| {
            let count = snapshot_count(&item.file_name().to_string_lossy())?;
            Some((count, item.path()))
        })
        .max_by_key(|(count, _)| *count)
}

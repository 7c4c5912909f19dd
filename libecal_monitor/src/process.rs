use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::calibration::CalibrationSet;
use super::config::Config;
use super::constants::RUN_FINISHED_MARKER;
use super::error::MonitorError;
use super::event::{BatchStats, BuiltEventBatch};
use super::event_builder::BuildOptions;
use super::hdf_writer::read_snapshot;
use super::quality::QualityReporter;
use super::reorder::{ReorderBuffer, SegmentOutcome};
use super::run_context::RunContext;
use super::segment::{RawSegment, SegmentState};
use super::snapshot::{latest_snapshot, SnapshotManager, SnapshotRecord};
use super::store::{CumulativeStore, MergeOutcome};
use super::watcher::RawWatcher;
use super::worker_pool::{Completion, WorkerPool};
use super::worker_status::{MonitorPhase, MonitorStatus};

/// Longest time the loop blocks on worker results before looking at the raw folder again
const RESULT_WAIT: Duration = Duration::from_millis(200);

/// Why the monitoring loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The end-of-run marker appeared and every raw byte was processed
    RunFinished,
    /// The stop file was created in the output directory
    StopRequested,
    /// The store reached `max_entries`
    MaxEntriesReached,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunFinished => write!(f, "run finished"),
            Self::StopRequested => write!(f, "stop requested"),
            Self::MaxEntriesReached => write!(f, "max_entries reached"),
        }
    }
}

/// What a completed monitoring session did
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub id_run: u32,
    pub n_segments_merged: u64,
    pub n_segments_skipped: u64,
    pub n_events: u64,
    pub n_hits: u64,
    pub n_snapshots: u64,
    pub last_snapshot: Option<PathBuf>,
    pub stats: BatchStats,
    pub stop_reason: StopReason,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Run {} ({}): {} segments merged, {} skipped, {} events with {} hits, {} snapshots",
            self.id_run,
            self.stop_reason,
            self.n_segments_merged,
            self.n_segments_skipped,
            self.n_events,
            self.n_hits,
            self.n_snapshots
        )
    }
}

/// The main loop of ecal_monitor.
///
/// Watches the raw folder of the run described by `ctx`, builds every segment in the worker
/// pool, merges the results in order and snapshots them at the configured cadence. Returns
/// once the run finished (or a stop was requested), after a final snapshot. Any fatal
/// condition is logged as an error before it is returned; work that was already done is
/// flushed on the way out.
pub fn monitor_run(
    ctx: &RunContext,
    config: &Config,
    tx: Option<Sender<MonitorStatus>>,
) -> Result<RunSummary, MonitorError> {
    log::info!(
        "Monitoring run {} (id_run {}): raw data from {}, output to {}",
        ctx.run_name,
        ctx.id_run,
        ctx.raw_dir.to_string_lossy(),
        ctx.output_dir.to_string_lossy()
    );

    let mut monitor = match Monitor::new(ctx, config, tx) {
        Ok(m) => m,
        Err(e) => {
            log::error!("Monitoring could not start: {e}");
            return Err(e);
        }
    };

    match monitor.run() {
        Ok(()) => {
            let summary = monitor.finish();
            log::info!("{summary}");
            Ok(summary)
        }
        Err(e) => {
            log::error!("{e}");
            monitor.salvage();
            Err(e)
        }
    }
}

struct Monitor<'a> {
    ctx: &'a RunContext,
    config: &'a Config,
    tx: Option<Sender<MonitorStatus>>,
    watcher: RawWatcher,
    pool: WorkerPool,
    reorder: ReorderBuffer,
    store: CumulativeStore,
    snapshots: SnapshotManager,
    quality: QualityReporter,
    backlog: VecDeque<RawSegment>,
    accepting: bool,
    stop_reason: Option<StopReason>,
    /// Segments from this index on are never merged (graceful stop)
    merge_limit: Option<u64>,
    n_skipped: u64,
    poll_interval: Duration,
    next_poll: Instant,
    last_new_data: Instant,
    n_idle_infos: u32,
}

impl<'a> Monitor<'a> {
    fn new(
        ctx: &'a RunContext,
        config: &'a Config,
        tx: Option<Sender<MonitorStatus>>,
    ) -> Result<Self, MonitorError> {
        log::info!("Loading calibration...");
        let calibration = CalibrationSet::load(&config.eventbuilding)?;
        log::info!(
            "Calibration loaded for {} slabs ({} masked channels, low gain {}).",
            calibration.n_slabs(),
            calibration.n_masked(),
            if calibration.has_low_gain() { "on" } else { "off" }
        );
        let n_slabs = calibration.n_slabs();
        let options = BuildOptions::from_config(&config.eventbuilding, ctx.id_run);

        let mut watcher = RawWatcher::new(&ctx.raw_dir, config.split_events())?;
        let pool = WorkerPool::new(
            config.monitoring.max_workers,
            Arc::new(calibration),
            Arc::new(options),
            config.segment_timeout(),
        )?;
        log::info!(
            "Started {} workers. Segments hold {}.",
            pool.max_workers(),
            match config.split_events() {
                Some(n) => format!("{n} events"),
                None => String::from("whole files"),
            }
        );

        let mut store = CumulativeStore::new(
            ctx.id_run,
            config.eventbuilding.w_config,
            config.eventbuilding.max_entries(),
        )
        .with_split_events(config.split_events());
        let mut reorder = ReorderBuffer::new();
        let mut snapshots = SnapshotManager::new(&config.snapshot, &ctx.output_dir);
        if config.monitoring.resume {
            if let Some((resumed, record)) = resume_store(ctx, config, &store) {
                let next_seq = resumed.next_seq();
                watcher.skip_below(next_seq);
                reorder = ReorderBuffer::starting_at(next_seq);
                snapshots.resume(record);
                store = resumed;
            }
        }

        let now = Instant::now();
        Ok(Self {
            ctx,
            config,
            tx,
            watcher,
            pool,
            reorder,
            store,
            snapshots,
            quality: QualityReporter::new(config.monitoring.quality_info, n_slabs),
            backlog: VecDeque::new(),
            accepting: true,
            stop_reason: None,
            merge_limit: None,
            n_skipped: 0,
            poll_interval: config.poll_interval(),
            next_poll: now,
            last_new_data: now,
            n_idle_infos: 1,
        })
    }

    fn run(&mut self) -> Result<(), MonitorError> {
        self.send_status(MonitorPhase::Monitoring);
        if self.store.is_full() {
            log::info!(
                "max_entries ({}) is already reached. No segments are accepted.",
                self.store.n_events()
            );
            self.stop_accepting(StopReason::MaxEntriesReached);
        }
        loop {
            if self.accepting && self.ctx.stop_file().exists() {
                log::info!(
                    "Graceful stop requested by {}. Finishing the segments in progress.",
                    self.ctx.stop_file().to_string_lossy()
                );
                self.stop_accepting(StopReason::StopRequested);
            }

            if self.accepting && Instant::now() >= self.next_poll {
                self.poll()?;
            }

            while self.pool.has_capacity(self.reorder.len()) {
                match self.backlog.pop_front() {
                    Some(segment) if segment.state == SegmentState::Dirty => {
                        let reason = segment.dirty_reason.clone().unwrap_or_default();
                        self.skip_dirty(segment, reason);
                    }
                    Some(segment) => self.pool.submit(segment)?,
                    None => break,
                }
            }

            if self.pool.is_idle() {
                if !self.accepting && self.backlog.is_empty() {
                    self.drain_ready();
                    break;
                }
                let until_poll = self.next_poll.saturating_duration_since(Instant::now());
                std::thread::sleep(until_poll.min(RESULT_WAIT));
            } else {
                if let Some(completion) = self.pool.recv_timeout(RESULT_WAIT)? {
                    self.handle_completion(completion)?;
                }
                for completion in self.pool.try_drain()? {
                    self.handle_completion(completion)?;
                }
                for completion in self.pool.check_timeouts()? {
                    self.handle_completion(completion)?;
                }
            }

            self.drain_ready();
        }
        Ok(())
    }

    /// Ask the watcher for new segments, backing off while nothing shows up
    fn poll(&mut self) -> Result<(), MonitorError> {
        let segments = self.watcher.poll()?;
        let now = Instant::now();
        if segments.is_empty() {
            self.poll_interval = (self.poll_interval * 2).min(self.config.max_poll_interval());
            if !self.watcher.run_finished_marker_seen() {
                self.alert_if_idle();
            }
        } else {
            self.poll_interval = self.config.poll_interval();
            self.last_new_data = now;
            self.n_idle_infos = 1;
        }
        self.next_poll = now + self.poll_interval;

        for segment in segments {
            if segment.state == SegmentState::Dirty && !self.config.monitoring.skip_dirty_dat {
                return Err(MonitorError::DirtyData {
                    seq: segment.seq,
                    path: segment.path.clone(),
                    reason: segment.dirty_reason.clone().unwrap_or_default(),
                });
            }
            self.backlog.push_back(segment);
        }

        if self.watcher.is_finished() {
            log::info!(
                "All raw files of the run were handed out ({} files, {} segments).",
                self.watcher.n_files(),
                self.watcher.n_segments()
            );
            self.stop_accepting(StopReason::RunFinished);
        }
        Ok(())
    }

    fn alert_if_idle(&mut self) {
        let idle_alert = self.config.idle_alert();
        if idle_alert.is_zero() {
            return;
        }
        let waited = self.last_new_data.elapsed();
        if waited < idle_alert * self.n_idle_infos {
            return;
        }
        self.n_idle_infos += 1;
        if self.ctx.suppress_idle_info_file().exists() {
            return;
        }
        log::info!(
            "Already waiting for new raw data since {} seconds. By now we would have expected to find the file that marks the end of the run: {}.",
            waited.as_secs(),
            self.ctx.raw_dir.join(RUN_FINISHED_MARKER).to_string_lossy()
        );
        log::info!(
            "To end monitoring gracefully and perform the end-of-run snapshot, create a dummy version of that file. To suppress this info, create the file {}.",
            self.ctx.suppress_idle_info_file().to_string_lossy()
        );
    }

    fn stop_accepting(&mut self, reason: StopReason) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        self.stop_reason = Some(reason);
        self.watcher.stop();
        if reason != StopReason::RunFinished {
            // Segments that were never submitted leave a gap; nothing past it is merged
            if let Some(first) = self.backlog.front() {
                self.merge_limit = Some(first.seq);
            }
            self.backlog.clear();
        }
        self.send_status(MonitorPhase::Draining);
    }

    fn skip_dirty(&mut self, segment: RawSegment, reason: String) {
        log::warn!("Skipping dirty {segment}: {reason}");
        self.n_skipped += 1;
        self.reorder.insert(SegmentOutcome::Skipped { segment, reason });
    }

    fn handle_completion(&mut self, completion: Completion) -> Result<(), MonitorError> {
        match completion {
            Completion::Built(batch) => {
                self.reorder.insert(SegmentOutcome::Built(batch));
            }
            Completion::Failed {
                mut segment,
                error,
            } => {
                let reason = error.to_string();
                if !self.config.monitoring.skip_dirty_dat {
                    return Err(MonitorError::DirtyData {
                        seq: segment.seq,
                        path: segment.path,
                        reason,
                    });
                }
                segment.mark_dirty(reason.clone());
                self.skip_dirty(segment, reason);
            }
        }
        Ok(())
    }

    /// Merge every outcome whose turn has come
    fn drain_ready(&mut self) {
        loop {
            if self
                .merge_limit
                .is_some_and(|limit| self.reorder.next_seq() >= limit)
            {
                break;
            }
            match self.reorder.pop_ready() {
                Some(SegmentOutcome::Built(batch)) => self.merge(batch),
                Some(SegmentOutcome::Skipped { .. }) => (),
                None => break,
            }
        }
    }

    fn merge(&mut self, mut batch: BuiltEventBatch) {
        if batch.stats.n_lookup_miss > 0 {
            let channels: Vec<String> = batch.lookup_misses.iter().map(|c| c.to_string()).collect();
            log::warn!(
                "{}: {} events dropped because channels are missing from the calibration (e.g. {})",
                batch.segment,
                batch.stats.n_lookup_miss,
                channels.join(", ")
            );
        }
        batch.segment.mark_consumed();
        let seq = batch.seq();
        let file_name = batch.segment.file_name();

        match self.store.merge(batch) {
            MergeOutcome::Merged { n_events } => log::info!(
                "Merged segment {seq} ({file_name}): {n_events} events, {} in total.",
                self.store.n_events()
            ),
            MergeOutcome::Truncated { n_events, dropped } => log::warn!(
                "Merged segment {seq} ({file_name}): {n_events} events; {dropped} events over max_entries were dropped."
            ),
            MergeOutcome::AlreadyMerged => {
                log::debug!("Segment {seq} was already merged");
                return;
            }
            MergeOutcome::Full => {
                log::debug!("Segment {seq} arrived after max_entries was reached");
                return;
            }
        }

        if self.snapshots.on_merge(&self.store).is_some() {
            self.quality.report(&self.store);
        }
        if self.store.is_full() && self.accepting {
            log::info!(
                "max_entries ({}) reached. No further segments are accepted.",
                self.store.n_events()
            );
            self.stop_accepting(StopReason::MaxEntriesReached);
        }
        self.send_status(if self.accepting {
            MonitorPhase::Monitoring
        } else {
            MonitorPhase::Draining
        });
    }

    fn send_status(&self, phase: MonitorPhase) {
        if let Some(tx) = self.tx.as_ref() {
            // A vanished observer is no reason to stop monitoring
            let _ = tx.send(MonitorStatus {
                phase,
                id_run: self.ctx.id_run,
                n_segments: self.store.n_segments(),
                n_skipped: self.n_skipped,
                n_events: self.store.n_events(),
                n_snapshots: self.snapshots.n_written(),
                n_in_flight: self.pool.n_in_flight(),
            });
        }
    }

    /// Final snapshot and summary of a completed run
    fn finish(mut self) -> RunSummary {
        if self.snapshots.final_flush(&self.store).is_some() {
            self.quality.report(&self.store);
        }
        self.send_status(MonitorPhase::Finished);
        let summary = RunSummary {
            id_run: self.ctx.id_run,
            n_segments_merged: self.store.n_segments(),
            n_segments_skipped: self.n_skipped,
            n_events: self.store.n_events(),
            n_hits: self.store.n_hits(),
            n_snapshots: self.snapshots.n_written(),
            last_snapshot: self.snapshots.last().map(|r| r.path.clone()),
            stats: self.store.stats().clone(),
            stop_reason: self.stop_reason.unwrap_or(StopReason::RunFinished),
        };
        self.pool.shutdown();
        summary
    }

    /// Keep what was already computed after a fatal error: merge the results that arrived,
    /// flush once, stop the workers
    fn salvage(mut self) {
        self.accepting = false;
        self.backlog.clear();
        if let Ok(completions) = self.pool.try_drain() {
            for completion in completions {
                if let Completion::Built(batch) = completion {
                    self.reorder.insert(SegmentOutcome::Built(batch));
                }
            }
        }
        self.drain_ready();
        if self.store.n_segments() > 0 {
            log::info!("Saving the {} segments merged before the failure.", self.store.n_segments());
            self.snapshots.final_flush(&self.store);
        }
        self.send_status(MonitorPhase::Finished);
        self.pool.shutdown();
    }
}

/// Pick up the newest snapshot of an earlier session in the output directory.
///
/// The snapshot is only used if it was built from the same run with the same segmentation,
/// since sequence indices are then the same. Anything else starts the run from scratch.
fn resume_store(
    ctx: &RunContext,
    config: &Config,
    fresh: &CumulativeStore,
) -> Option<(CumulativeStore, SnapshotRecord)> {
    let (count, path) = latest_snapshot(&ctx.snapshot_dir())?;
    let store = match read_snapshot(&path, config.eventbuilding.max_entries()) {
        Ok(store) => store,
        Err(e) => {
            log::warn!(
                "Could not resume from {}: {e}. Building the run from scratch.",
                path.to_string_lossy()
            );
            return None;
        }
    };
    if store.n_segments() != count
        || store.id_run() != fresh.id_run()
        || store.w_config() != fresh.w_config()
        || store.split_events() != fresh.split_events()
    {
        log::warn!(
            "Snapshot {} was built with different settings. Building the run from scratch.",
            path.to_string_lossy()
        );
        return None;
    }
    log::info!(
        "Resuming from {}: {} segments with {} events are already merged.",
        path.to_string_lossy(),
        store.n_segments(),
        store.n_events()
    );
    let record = SnapshotRecord {
        count,
        n_events: store.n_events(),
        path,
    };
    Some((store, record))
}

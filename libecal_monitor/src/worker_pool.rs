use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::calibration::CalibrationSet;
use super::error::{PoolError, SegmentError};
use super::event::BuiltEventBatch;
use super::event_builder::{build_segment, BuildOptions};
use super::segment::RawSegment;

/// A segment is attempted at most this many times
pub const MAX_ATTEMPTS: u32 = 2;

#[derive(Debug)]
struct Job {
    segment: RawSegment,
    attempt: u32,
}

#[derive(Debug)]
struct JobResult {
    seq: u64,
    attempt: u32,
    result: Result<BuiltEventBatch, SegmentError>,
}

#[derive(Debug)]
struct InFlight {
    segment: RawSegment,
    attempt: u32,
    started: Instant,
}

/// The final word on a segment, after any retries
#[derive(Debug)]
pub enum Completion {
    Built(BuiltEventBatch),
    Failed {
        segment: RawSegment,
        error: SegmentError,
    },
}

impl Completion {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Built(batch) => batch.seq(),
            Self::Failed { segment, .. } => segment.seq,
        }
    }
}

/// A fixed set of worker threads building segments in parallel.
///
/// Workers pull jobs from a shared queue and send results back over a channel. Every
/// submission carries an attempt number; a result that does not match the current attempt of
/// its segment (for example the late answer of a worker that was declared timed out) is
/// dropped. Transient failures are retried up to [`MAX_ATTEMPTS`] times, malformed data is
/// reported immediately.
///
/// A worker stuck on a timed out segment cannot be interrupted, so a replacement is started
/// in its place. The pool itself logs; the workers never do.
#[derive(Debug)]
pub struct WorkerPool {
    job_tx: Option<Sender<Job>>,
    job_rx: Arc<Mutex<Receiver<Job>>>,
    result_tx: Sender<JobResult>,
    result_rx: Receiver<JobResult>,
    calibration: Arc<CalibrationSet>,
    options: Arc<BuildOptions>,
    workers: Vec<JoinHandle<()>>,
    in_flight: BTreeMap<u64, InFlight>,
    max_workers: usize,
    segment_timeout: Duration,
}

impl WorkerPool {
    pub fn new(
        max_workers: usize,
        calibration: Arc<CalibrationSet>,
        options: Arc<BuildOptions>,
        segment_timeout: Duration,
    ) -> Result<Self, PoolError> {
        let (job_tx, job_rx) = channel::<Job>();
        let (result_tx, result_rx) = channel::<JobResult>();

        let mut pool = Self {
            job_tx: Some(job_tx),
            job_rx: Arc::new(Mutex::new(job_rx)),
            result_tx,
            result_rx,
            calibration,
            options,
            workers: Vec::with_capacity(max_workers),
            in_flight: BTreeMap::new(),
            max_workers,
            segment_timeout,
        };
        for _ in 0..max_workers {
            pool.spawn_worker()?;
        }
        Ok(pool)
    }

    fn spawn_worker(&mut self) -> Result<(), PoolError> {
        let jobs = self.job_rx.clone();
        let results = self.result_tx.clone();
        let calibration = self.calibration.clone();
        let options = self.options.clone();
        let handle = std::thread::Builder::new()
            .name(format!("ecal-worker-{}", self.workers.len()))
            .spawn(move || worker_loop(jobs, results, calibration, options))?;
        self.workers.push(handle);
        Ok(())
    }

    /// Number of worker threads started, replacements included
    pub fn n_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn n_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Room for another segment, given how many finished results are waiting to be merged.
    ///
    /// Bounding in-flight plus buffered results keeps memory flat when one slow segment holds
    /// back the merge order.
    pub fn has_capacity(&self, buffered: usize) -> bool {
        self.in_flight.len() + buffered < self.max_workers
    }

    pub fn submit(&mut self, segment: RawSegment) -> Result<(), PoolError> {
        self.dispatch(segment, 1)
    }

    fn dispatch(&mut self, segment: RawSegment, attempt: u32) -> Result<(), PoolError> {
        let job_tx = self.job_tx.as_ref().ok_or(PoolError::Disconnected)?;
        job_tx
            .send(Job {
                segment: segment.clone(),
                attempt,
            })
            .map_err(|_| PoolError::Disconnected)?;
        self.in_flight.insert(
            segment.seq,
            InFlight {
                segment,
                attempt,
                started: Instant::now(),
            },
        );
        Ok(())
    }

    /// Wait up to `timeout` for a result.
    ///
    /// Returns None if nothing final arrived in time. A retried segment also yields None.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Completion>, PoolError> {
        if self.in_flight.is_empty() {
            return Ok(None);
        }
        match self.result_rx.recv_timeout(timeout) {
            Ok(result) => self.settle(result),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(PoolError::Disconnected),
        }
    }

    /// Collect every result that is already waiting, without blocking
    pub fn try_drain(&mut self) -> Result<Vec<Completion>, PoolError> {
        let mut completions = Vec::new();
        while let Ok(result) = self.result_rx.try_recv() {
            if let Some(completion) = self.settle(result)? {
                completions.push(completion);
            }
        }
        Ok(completions)
    }

    /// Declare segments that ran longer than the segment timeout as failed attempts.
    ///
    /// The worker stuck on such a segment cannot be interrupted; whatever it returns later is
    /// stale and ignored. A new worker takes over its share of the queue.
    pub fn check_timeouts(&mut self) -> Result<Vec<Completion>, PoolError> {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, job)| now.duration_since(job.started) > self.segment_timeout)
            .map(|(seq, _)| *seq)
            .collect();

        let mut completions = Vec::new();
        for seq in expired {
            if let Some(job) = self.in_flight.remove(&seq) {
                if self.max_workers > 0 {
                    log::warn!(
                        "Segment {seq} ({}) timed out; starting a replacement worker.",
                        job.segment.file_name()
                    );
                    self.spawn_worker()?;
                }
                let error = SegmentError::Timeout(self.segment_timeout.as_secs());
                if let Some(completion) = self.retry_or_fail(job.segment, job.attempt, error)? {
                    completions.push(completion);
                }
            }
        }
        Ok(completions)
    }

    fn settle(&mut self, result: JobResult) -> Result<Option<Completion>, PoolError> {
        let current = match self.in_flight.get(&result.seq) {
            Some(job) if job.attempt == result.attempt => true,
            _ => false,
        };
        if !current {
            log::debug!(
                "Ignoring stale result for segment {} (attempt {})",
                result.seq,
                result.attempt
            );
            return Ok(None);
        }
        let job = match self.in_flight.remove(&result.seq) {
            Some(job) => job,
            None => return Ok(None),
        };
        match result.result {
            Ok(batch) => Ok(Some(Completion::Built(batch))),
            Err(error) => self.retry_or_fail(job.segment, job.attempt, error),
        }
    }

    fn retry_or_fail(
        &mut self,
        segment: RawSegment,
        attempt: u32,
        error: SegmentError,
    ) -> Result<Option<Completion>, PoolError> {
        if error.is_retryable() && attempt < MAX_ATTEMPTS {
            log::warn!(
                "Segment {} ({}) failed on attempt {attempt}: {error}. Retrying.",
                segment.seq,
                segment.file_name()
            );
            self.dispatch(segment, attempt + 1)?;
            Ok(None)
        } else {
            Ok(Some(Completion::Failed { segment, error }))
        }
    }

    /// Close the queue and wait for idle workers to exit.
    ///
    /// Workers still busy with an abandoned (timed out) segment are detached.
    pub fn shutdown(mut self) {
        self.job_tx = None;
        self.in_flight.clear();
        let now = Instant::now();
        for handle in self.workers.drain(..) {
            while !handle.is_finished() && now.elapsed() < Duration::from_secs(5) {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    log::warn!("A worker thread exited abnormally");
                }
            } else {
                log::warn!("A worker thread is still busy; detaching it");
            }
        }
    }
}

fn worker_loop(
    jobs: Arc<Mutex<Receiver<Job>>>,
    results: Sender<JobResult>,
    calibration: Arc<CalibrationSet>,
    options: Arc<BuildOptions>,
) {
    loop {
        let job = {
            let queue = match jobs.lock() {
                Ok(queue) => queue,
                Err(_) => return,
            };
            match queue.recv() {
                Ok(job) => job,
                Err(_) => return,
            }
        };

        let seq = job.segment.seq;
        let attempt = job.attempt;
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            build_segment(job.segment, &calibration, &options)
        }));
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err(SegmentError::WorkerPanic(panic_message(payload.as_ref()))),
        };

        if results
            .send(JobResult {
                seq,
                attempt,
                result,
            })
            .is_err()
        {
            return;
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        String::from(*msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        String::from("unknown panic")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::raw_frame::{RawFrame, RawHit};
    use crate::splitter::split_file;
    use std::path::Path;

    fn calibration(dir: &Path) -> Arc<CalibrationSet> {
        let write = |name: &str, contents: &str| {
            let path = dir.join(name);
            std::fs::write(&path, contents).unwrap();
            path
        };
        let mut eb = Config::default().eventbuilding;
        eb.pedestals_file = write("ped.txt", "0 0 0 100.0 1.0\n");
        eb.mip_calibration_file = write("mip.txt", "0 0 0 10.0\n");
        eb.mapping_file = write("map.txt", "0 0 1.0 2.0\n");
        eb.asu_versions = vec![String::from("13")];
        eb.no_lg = true;
        Arc::new(CalibrationSet::load(&eb).unwrap())
    }

    fn options() -> Arc<BuildOptions> {
        Arc::new(BuildOptions {
            id_run: 1,
            w_config: 0,
            min_slabs_hit: 1,
            no_lg: true,
            lg_switch_adc: 3500,
            zero_suppress: false,
            zero_suppress_n_rms: 3.0,
            merge_rule: None,
        })
    }

    fn segments(dir: &Path, n_events: u32, split: u64) -> Vec<RawSegment> {
        let path = dir.join("run.dat_0000");
        let mut buffer = Vec::new();
        for ev in 0..n_events {
            RawFrame::new(ev, 0, 0, vec![RawHit::new(0, 0, 150, 0)])
                .write_to(&mut buffer)
                .unwrap();
        }
        std::fs::write(&path, buffer).unwrap();
        split_file(&path, 0, Some(split)).unwrap()
    }

    #[test]
    fn test_pool_builds_all_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool =
            WorkerPool::new(3, calibration(dir.path()), options(), Duration::from_secs(60))
                .unwrap();
        for segment in segments(dir.path(), 20, 5) {
            pool.submit(segment).unwrap();
        }
        assert_eq!(pool.n_in_flight(), 4);
        assert!(!pool.has_capacity(0));

        let mut seqs = Vec::new();
        while !pool.is_idle() {
            if let Some(completion) = pool.recv_timeout(Duration::from_secs(10)).unwrap() {
                match completion {
                    Completion::Built(batch) => {
                        assert_eq!(batch.events.len(), 5);
                        seqs.push(batch.seq());
                    }
                    Completion::Failed { error, .. } => panic!("unexpected failure: {error}"),
                }
            }
        }
        seqs.sort();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        pool.shutdown();
    }

    #[test]
    fn test_missing_file_is_retried_then_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool =
            WorkerPool::new(2, calibration(dir.path()), options(), Duration::from_secs(60))
                .unwrap();
        let mut segment = segments(dir.path(), 2, 2).remove(0);
        segment.path = dir.path().join("gone.dat_0001");
        pool.submit(segment).unwrap();

        let mut failure = None;
        while failure.is_none() {
            failure = pool.recv_timeout(Duration::from_secs(10)).unwrap();
        }
        match failure {
            Some(Completion::Failed { error, segment }) => {
                assert!(matches!(error, SegmentError::IOError(_)));
                assert_eq!(segment.seq, 0);
            }
            other => panic!("expected a failure, got {other:?}"),
        }
        assert!(pool.is_idle());
        pool.shutdown();
    }

    #[test]
    fn test_timeout_expires_in_flight_segments() {
        let dir = tempfile::tempdir().unwrap();
        // No workers: nothing ever completes
        let mut pool =
            WorkerPool::new(0, calibration(dir.path()), options(), Duration::from_millis(1))
                .unwrap();
        pool.submit(segments(dir.path(), 2, 2).remove(0)).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        // First expiry is retried
        assert!(pool.check_timeouts().unwrap().is_empty());
        assert_eq!(pool.n_in_flight(), 1);
        std::thread::sleep(Duration::from_millis(10));
        let failed = pool.check_timeouts().unwrap();
        assert_eq!(failed.len(), 1);
        assert!(matches!(
            failed[0],
            Completion::Failed {
                error: SegmentError::Timeout(_),
                ..
            }
        ));
        pool.shutdown();
    }

    #[test]
    fn test_timed_out_workers_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        // Every attempt is overdue as soon as it is checked
        let mut pool =
            WorkerPool::new(1, calibration(dir.path()), options(), Duration::ZERO).unwrap();
        assert_eq!(pool.n_workers(), 1);
        let segment = segments(dir.path(), 2, 2).remove(0);
        pool.submit(segment.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(pool.check_timeouts().unwrap().is_empty());
        assert_eq!(pool.n_workers(), 2);
        std::thread::sleep(Duration::from_millis(5));
        let failed = pool.check_timeouts().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(pool.n_workers(), 3);
        assert!(pool.is_idle());

        // The pool still builds once the queue is served by the replacements
        pool.segment_timeout = Duration::from_secs(60);
        pool.submit(segment).unwrap();
        let mut built = None;
        while built.is_none() {
            built = pool.recv_timeout(Duration::from_secs(10)).unwrap();
        }
        assert!(matches!(built, Some(Completion::Built(_))));
        pool.shutdown();
    }
}

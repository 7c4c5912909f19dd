use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use super::constants::NUMBER_OF_CHIPS;
use super::error::QualityError;
use super::store::CumulativeStore;

/// Prefix of the quality lines in the monitoring log
pub const QUALITY_TAG: &str = "QUALITY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    Ok,
    /// At least one slab saw no hit at all
    DeadSlabs,
}

/// Aggregate health of the run at one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRecord {
    pub n_segments: u64,
    pub n_events: u64,
    pub n_hits: u64,
    pub mean_hits_per_event: f64,
    /// Hits per slab
    pub slab_occupancy: Vec<u64>,
    /// Mean hit energy per slab in MIP, 0 for an empty slab
    pub slab_mean_energy: Vec<f64>,
    pub dead_slabs: Vec<u8>,
    /// (slab, chip) pairs without a hit on otherwise live slabs
    pub dead_chips: Vec<(u8, u8)>,
    pub status: QualityStatus,
}

/// Compute the quality record of the store for a detector of `n_slabs` slabs
pub fn compute_quality(
    store: &CumulativeStore,
    n_slabs: usize,
) -> Result<QualityRecord, QualityError> {
    let mut occupancy = Array2::<u64>::zeros((n_slabs, NUMBER_OF_CHIPS as usize));
    let mut energy_sum = Array1::<f64>::zeros(n_slabs);

    for hit in store.events().iter().flat_map(|e| e.hits.iter()) {
        let slab = hit.slab as usize;
        if slab >= n_slabs {
            return Err(QualityError::SlabOutOfRange(hit.slab, n_slabs));
        }
        if hit.chip >= NUMBER_OF_CHIPS {
            return Err(QualityError::ChipOutOfRange(hit.chip));
        }
        if !hit.energy.is_finite() {
            return Err(QualityError::NonFiniteEnergy {
                slab: hit.slab,
                chip: hit.chip,
            });
        }
        occupancy[[slab, hit.chip as usize]] += 1;
        energy_sum[slab] += hit.energy as f64;
    }

    let slab_occupancy = occupancy.sum_axis(Axis(1));
    let slab_mean_energy = energy_sum
        .iter()
        .zip(slab_occupancy.iter())
        .map(|(sum, n)| if *n > 0 { sum / *n as f64 } else { 0.0 })
        .collect();

    let n_events = store.n_events();
    let mut dead_slabs = Vec::new();
    let mut dead_chips = Vec::new();
    if n_events > 0 {
        for (slab, row) in occupancy.axis_iter(Axis(0)).enumerate() {
            if slab_occupancy[slab] == 0 {
                dead_slabs.push(slab as u8);
                continue;
            }
            for (chip, n) in row.iter().enumerate() {
                if *n == 0 {
                    dead_chips.push((slab as u8, chip as u8));
                }
            }
        }
    }

    let n_hits = store.n_hits();
    Ok(QualityRecord {
        n_segments: store.n_segments(),
        n_events,
        n_hits,
        mean_hits_per_event: if n_events > 0 {
            n_hits as f64 / n_events as f64
        } else {
            0.0
        },
        slab_occupancy: slab_occupancy.to_vec(),
        slab_mean_energy,
        status: if dead_slabs.is_empty() {
            QualityStatus::Ok
        } else {
            QualityStatus::DeadSlabs
        },
        dead_slabs,
        dead_chips,
    })
}

/// Appends one quality line to the monitoring log per snapshot.
///
/// Never fails: a computation error becomes an error line and the run goes on.
#[derive(Debug)]
pub struct QualityReporter {
    enabled: bool,
    n_slabs: usize,
    n_reports: u64,
}

impl QualityReporter {
    pub fn new(enabled: bool, n_slabs: usize) -> Self {
        Self {
            enabled,
            n_slabs,
            n_reports: 0,
        }
    }

    pub fn n_reports(&self) -> u64 {
        self.n_reports
    }

    pub fn report(&mut self, store: &CumulativeStore) -> Option<QualityRecord> {
        if !self.enabled {
            return None;
        }
        let outcome = compute_quality(store, self.n_slabs)
            .and_then(|record| Ok((serde_json::to_string(&record)?, record)));
        match outcome {
            Ok((line, record)) => {
                match record.status {
                    QualityStatus::Ok => log::info!("{QUALITY_TAG} {line}"),
                    QualityStatus::DeadSlabs => log::warn!("{QUALITY_TAG} {line}"),
                }
                self.n_reports += 1;
                Some(record)
            }
            Err(e) => {
                log::error!(
                    "Quality report at {} segments failed: {e}",
                    store.n_segments()
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{BatchStats, BuiltEvent, BuiltEventBatch, Hit};
    use crate::segment::RawSegment;
    use std::path::PathBuf;

    fn hit(slab: u8, chip: u8, energy: f32) -> Hit {
        Hit {
            slab,
            chip,
            channel: 0,
            x: 0.0,
            y: 0.0,
            energy,
            is_low_gain: false,
        }
    }

    fn store(hits: Vec<Vec<Hit>>) -> CumulativeStore {
        let mut store = CumulativeStore::new(1, 0, None);
        let segment = RawSegment::pending(0, PathBuf::from("run.dat_0000"), 0).promote(0);
        let events = hits
            .into_iter()
            .map(|hits| BuiltEvent {
                event: 0,
                id_run: 1,
                id_dat: 0,
                cycle: 0,
                bcid: 0,
                nhit_slab: 0,
                w_config: 0,
                hits,
            })
            .collect();
        store.merge(BuiltEventBatch {
            segment,
            events,
            stats: BatchStats::default(),
            lookup_misses: Vec::new(),
        });
        store
    }

    #[test]
    fn test_quality_record() {
        let store = store(vec![
            vec![hit(0, 0, 1.0), hit(1, 3, 2.0)],
            vec![hit(0, 1, 3.0), hit(2, 3, 1.0)],
        ]);
        let record = compute_quality(&store, 4).unwrap();
        assert_eq!(record.n_events, 2);
        assert_eq!(record.n_hits, 4);
        assert_eq!(record.mean_hits_per_event, 2.0);
        assert_eq!(record.slab_occupancy, vec![2, 1, 1, 0]);
        assert_eq!(record.slab_mean_energy, vec![2.0, 2.0, 1.0, 0.0]);
        assert_eq!(record.dead_slabs, vec![3]);
        assert_eq!(record.status, QualityStatus::DeadSlabs);
        // 14 silent chips on slab 0, 15 each on slabs 1 and 2
        assert_eq!(record.dead_chips.len(), 14 + 15 + 15);
        assert!(record.dead_chips.contains(&(0, 2)));

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"status\":\"dead_slabs\""));
        assert!(!json.contains("ERROR"));
    }

    #[test]
    fn test_quality_errors() {
        let store_bad_slab = store(vec![vec![hit(5, 0, 1.0)]]);
        assert!(matches!(
            compute_quality(&store_bad_slab, 4),
            Err(QualityError::SlabOutOfRange(5, 4))
        ));
        let store_nan = store(vec![vec![hit(0, 0, f32::NAN)]]);
        assert!(matches!(
            compute_quality(&store_nan, 4),
            Err(QualityError::NonFiniteEnergy { slab: 0, chip: 0 })
        ));
        let mut reporter = QualityReporter::new(true, 4);
        assert!(reporter.report(&store_nan).is_none());
        assert_eq!(reporter.n_reports(), 0);
    }

    #[test]
    fn test_disabled_reporter() {
        let mut reporter = QualityReporter::new(false, 4);
        assert!(reporter.report(&store(vec![vec![hit(0, 0, 1.0)]])).is_none());
    }

    #[test]
    fn test_empty_store_is_ok() {
        let record = compute_quality(&CumulativeStore::new(1, 0, None), 4).unwrap();
        assert_eq!(record.status, QualityStatus::Ok);
        assert_eq!(record.mean_hits_per_event, 0.0);
    }
}

/// Phase of the monitoring loop, used by a UI to pick what to show
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorPhase {
    #[default]
    Starting,
    /// Waiting for or processing raw data
    Monitoring,
    /// The run is over (or a stop was requested); in-flight segments are finishing
    Draining,
    Finished,
}

/// Progress message sent from the monitoring loop to whoever is watching it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorStatus {
    pub phase: MonitorPhase,
    pub id_run: u32,
    pub n_segments: u64,
    pub n_skipped: u64,
    pub n_events: u64,
    pub n_snapshots: u64,
    pub n_in_flight: usize,
}

impl MonitorStatus {
    pub fn new(phase: MonitorPhase, id_run: u32) -> Self {
        Self {
            phase,
            id_run,
            ..Default::default()
        }
    }
}

impl std::fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "run {} | segments: {} (skipped {}) | events: {} | snapshots: {} | in flight: {}",
            self.id_run,
            self.n_segments,
            self.n_skipped,
            self.n_events,
            self.n_snapshots,
            self.n_in_flight
        )
    }
}

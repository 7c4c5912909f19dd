//! # ecal_monitor
//!
//! ecal_monitor is the continuous event building and monitoring of the SiW-ECAL test-beam
//! data, written in Rust. While a beam run is ongoing the acquisition keeps writing raw
//! `.dat_NNNN` files into a run folder. ecal_monitor picks them up as they appear, builds
//! calibrated and mapped events from them in parallel, and periodically dumps everything
//! built so far into HDF5 snapshots, so that the run can be inspected long before it ends.
//!
//! ## Installation
//!
//! The only method of install is from source.
//!
//! ### HDF5
//!
//! Before building and running ecal_monitor, HDF5 must be installed. Typically this will
//! be installed using a package manager (homebrew, apt, etc), and the Rust libraries will
//! auto detect the location of the HDF install. If that is not possible, write the
//! following snippet into the file `.cargo/config.toml` of the repository:
//!
//! ```toml
//! [env]
//! HDF5_DIR="/path/to/my/hdf5/install/"
//!
//! [build]
//! rustflags="-C link-args=-Wl,-rpath,/path/to/my/hdf5/install/lib"
//! ```
//!
//! ### Building & Install
//!
//! To build and install the monitoring use `cargo install --path ./ecal_monitor_cli` from the
//! top level repository. This installs the `ecal_monitor` binary to your cargo install
//! location (typically `~/.cargo/bin/`).
//!
//! ## Usage
//!
//! ```text
//! ecal_monitor new -c monitoring.yml       # write a template configuration
//! ecal_monitor /path/to/raw/run_90001 -c monitoring.yml
//! ```
//!
//! The raw run folder must contain `Run_Settings.txt`. The run is considered finished once
//! `hitsHistogram.txt` appears in it. Creating a file `stop_monitoring` in the output
//! directory ends the monitoring gracefully (in-flight segments are finished and a final
//! snapshot is written); a file `suppress_idle_info` silences the reminders about a missing
//! end-of-run marker.
//!
//! Restarting the monitoring on the same run picks up the newest snapshot in the output
//! directory and only builds what came after it (set `resume: false` under `monitoring`
//! to start over).
//!
//! ## Configuration
//!
//! The YAML configuration has three sections. Unknown or missing keys are an error.
//!
//! ```yml
//! monitoring:
//!   max_workers: 10
//!   output_parent: data
//!   output_name: null          # defaults to the raw run folder name
//!   skip_dirty_dat: true
//!   binary_split_M: -1         # events per segment, -1 for whole files
//!   quality_info: true
//! snapshot:
//!   after: [1, 10]
//!   every: 50
//!   delete_previous: false
//! eventbuilding:
//!   pedestals_file: calibration/pedestals.txt
//!   pedestals_lg_file: calibration/pedestals_lg.txt
//!   mip_calibration_file: calibration/mip.txt
//!   mip_calibration_lg_file: calibration/mip_lg.txt
//!   mapping_file: mapping/fev_mapping.txt
//!   mapping_file_cob: mapping/cob_mapping.txt
//!   masked_channels_file: null
//!   w_config: -1
//!   min_slabs_hit: 4
//!   asu_versions: ["13", "13", "COB"]
//!   max_entries: -1
//!   no_lg: false
//!   zero_suppress: true
//!   merge_within_chip: true
//!   merge_rule: max            # or sum
//!   id_run: null               # guessed from the run name
//! ```
//!
//! Relative calibration paths are relative to the configuration file.
//!
//! ## Output
//!
//! Everything goes to `<output_parent>/<run name>/`: the log file `log_monitoring.log`, the
//! effective configuration `monitoring.yml`, the snapshots in `snapshots/` and a copy of the
//! newest one as `current_build.h5`. A line containing `ERROR` in the log means the run had
//! a problem; a clean run has none.
//!
//! ### HDF5 Data Format
//!
//! ```text
//! snapshot_000010.h5
//! events - id_run, n_events, n_segments, w_config, version
//! |---- event, id_dat, cycle, bcid, nhit_slab, nhit, hit_offset(dset)
//! hits
//! |---- slab, chip, channel, x, y, energy, is_low_gain(dset)
//! segments(dset)
//! ```
pub mod calibration;
pub mod channel_map;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod event_builder;
pub mod hardware_id;
pub mod hdf_writer;
pub mod process;
pub mod quality;
pub mod raw_frame;
pub mod reorder;
pub mod run_context;
pub mod segment;
pub mod snapshot;
pub mod splitter;
pub mod store;
pub mod watcher;
pub mod worker_pool;
pub mod worker_status;

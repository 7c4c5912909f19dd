mod common;

use std::fs::File;

use libecal_monitor::constants::CURRENT_BUILD_FILE;
use libecal_monitor::hdf_writer::read_snapshot_summary;
use libecal_monitor::process::{monitor_run, StopReason};
use simplelog::{LevelFilter, WriteLogger};

use common::*;

#[test]
fn test_dirty_file_is_skipped_with_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("test.log");
    WriteLogger::init(
        LevelFilter::Info,
        simplelog::Config::default(),
        File::create(&log_path).unwrap(),
    )
    .unwrap();

    write_calibration(dir.path());
    let raw = raw_run(dir.path(), "run_90010", 6, 200, true);
    corrupt_raw_file(&raw.join("run_90010.dat_0002"));
    let config = config(dir.path(), &dir.path().join("out"));
    assert!(config.monitoring.skip_dirty_dat);
    let (ctx, config) = prepare(&raw, &config);

    let summary = monitor_run(&ctx, &config, None).unwrap();
    assert_eq!(summary.stop_reason, StopReason::RunFinished);
    assert_eq!(summary.n_segments_merged, 5);
    assert_eq!(summary.n_segments_skipped, 1);
    assert_eq!(summary.n_events, 5 * expected_retained(200));

    let current = read_snapshot_summary(&ctx.output_dir.join(CURRENT_BUILD_FILE)).unwrap();
    assert_eq!(current.n_events, summary.n_events);
    assert_eq!(current.segments, vec![0, 1, 3, 4, 5]);

    log::logger().flush();
    let log_text = std::fs::read_to_string(&log_path).unwrap();
    assert!(log_text.contains("[WARN]"));
    assert!(log_text.contains("run_90010.dat_0002"));
    assert!(!log_text.contains("ERROR"));
}

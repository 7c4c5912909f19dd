mod common;

use std::fs::File;

use libecal_monitor::constants::CURRENT_BUILD_FILE;
use libecal_monitor::hdf_writer::read_snapshot_summary;
use libecal_monitor::process::{monitor_run, StopReason};
use simplelog::{LevelFilter, WriteLogger};

use common::*;

#[test]
fn test_bad_checksum_segment_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("test.log");
    WriteLogger::init(
        LevelFilter::Info,
        simplelog::Config::default(),
        File::create(&log_path).unwrap(),
    )
    .unwrap();

    write_calibration(dir.path());
    let raw = raw_run(dir.path(), "run_90012", 5, 200, true);
    corrupt_checksum(&raw.join("run_90012.dat_0001"));
    let config = config(dir.path(), &dir.path().join("out"));
    assert!(config.monitoring.skip_dirty_dat);
    let (ctx, config) = prepare(&raw, &config);

    let summary = monitor_run(&ctx, &config, None).unwrap();
    assert_eq!(summary.stop_reason, StopReason::RunFinished);
    assert_eq!(summary.n_segments_merged, 4);
    assert_eq!(summary.n_segments_skipped, 1);
    assert_eq!(summary.n_events, 4 * expected_retained(200));

    let current = read_snapshot_summary(&ctx.output_dir.join(CURRENT_BUILD_FILE)).unwrap();
    assert_eq!(current.segments, vec![0, 2, 3, 4]);
    assert_eq!(current.n_events, summary.n_events);

    log::logger().flush();
    let log_text = std::fs::read_to_string(&log_path).unwrap();
    assert!(log_text.contains("run_90012.dat_0001"));
    assert!(log_text.contains("checksum"));
    assert!(!log_text.contains("ERROR"));
}

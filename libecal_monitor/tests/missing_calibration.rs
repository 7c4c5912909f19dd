mod common;

use std::fs::OpenOptions;

use libecal_monitor::error::{CalibrationLoadError, MonitorError};
use libecal_monitor::process::monitor_run;
use simplelog::{LevelFilter, WriteLogger};

use common::*;

#[test]
fn test_missing_pedestals_are_logged_to_the_run_log() {
    let dir = tempfile::tempdir().unwrap();
    write_calibration(dir.path());
    let raw = raw_run(dir.path(), "run_90020", 2, 50, true);
    let config = config(dir.path(), &dir.path().join("out"));
    std::fs::remove_file(&config.eventbuilding.pedestals_file).unwrap();

    // Same order as the binary: claim the output, open its log, then run
    let (ctx, config) = prepare(&raw, &config);
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(ctx.log_path())
        .unwrap();
    WriteLogger::init(LevelFilter::Info, simplelog::Config::default(), log_file).unwrap();

    match monitor_run(&ctx, &config, None) {
        Err(MonitorError::CalibrationError(CalibrationLoadError::MissingFile(path))) => {
            assert!(path.ends_with("pedestals.txt"));
        }
        other => panic!("expected a missing calibration file, got {other:?}"),
    }

    log::logger().flush();
    let log_text = std::fs::read_to_string(ctx.log_path()).unwrap();
    assert!(log_text.contains("ERROR"));
    assert!(log_text.contains("pedestals.txt"));
}

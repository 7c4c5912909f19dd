#![allow(dead_code)]
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use libecal_monitor::config::Config;
use libecal_monitor::constants::{RUN_FINISHED_MARKER, RUN_SETTINGS_FILE};
use libecal_monitor::raw_frame::{RawFrame, RawHit};
use libecal_monitor::run_context::RunContext;

pub const N_SLABS: u8 = 4;
pub const MIN_SLABS_HIT: u32 = 2;

/// Every fifth entry only hits a single slab and is filtered out
pub fn expected_retained(n_entries: u32) -> u64 {
    (0..n_entries).filter(|e| e % 5 != 0).count() as u64
}

/// Pedestal 100 +- 2 and MIP 50 for every channel of every slab
pub fn write_calibration(dir: &Path) {
    let mut ped = String::new();
    let mut mip = String::new();
    let mut map = String::new();
    for chip in 0..16 {
        for channel in 0..64 {
            writeln!(map, "{chip} {channel} {}.0 {}.0", chip * 8, channel).unwrap();
            for slab in 0..N_SLABS {
                writeln!(ped, "{slab} {chip} {channel} 100.0 2.0").unwrap();
                writeln!(mip, "{slab} {chip} {channel} 50.0").unwrap();
            }
        }
    }
    std::fs::write(dir.join("pedestals.txt"), ped).unwrap();
    std::fs::write(dir.join("mip.txt"), mip).unwrap();
    std::fs::write(dir.join("mapping.txt"), map).unwrap();
}

pub fn config(calib_dir: &Path, output_parent: &Path) -> Config {
    let mut config = Config::default();
    config.monitoring.max_workers = 10;
    config.monitoring.output_parent = output_parent.to_path_buf();
    config.monitoring.poll_interval_ms = 10;
    config.monitoring.max_poll_interval_ms = 50;
    config.monitoring.segment_timeout_s = 60;
    config.snapshot.after = vec![1, 10];
    config.snapshot.every = 50;
    config.snapshot.delete_previous = false;

    let eb = &mut config.eventbuilding;
    eb.pedestals_file = calib_dir.join("pedestals.txt");
    eb.pedestals_lg_file = None;
    eb.mip_calibration_file = calib_dir.join("mip.txt");
    eb.mip_calibration_lg_file = None;
    eb.mapping_file = calib_dir.join("mapping.txt");
    eb.mapping_file_cob = None;
    eb.masked_channels_file = None;
    eb.w_config = 1;
    eb.min_slabs_hit = MIN_SLABS_HIT;
    eb.asu_versions = vec![String::from("13"); N_SLABS as usize];
    eb.no_lg = true;
    config.validate().unwrap();
    config
}

/// One raw file of `n_entries` triggers
pub fn raw_file_bytes(id_dat: u32, n_entries: u32) -> Vec<u8> {
    let mut buffer = Vec::new();
    for entry in 0..n_entries {
        let n_slabs = if entry % 5 == 0 { 1 } else { N_SLABS };
        let chip = (entry % 16) as u8;
        for slab in 0..n_slabs {
            let hits = vec![RawHit::new(chip, 0, 300, 0), RawHit::new(chip, 1, 200, 0)];
            RawFrame::new(id_dat * 100_000 + entry, 0, slab, hits)
                .write_to(&mut buffer)
                .unwrap();
        }
    }
    buffer
}

/// A raw run folder with `n_files` files of `n_entries` triggers
pub fn raw_run(parent: &Path, name: &str, n_files: u32, n_entries: u32, finished: bool) -> PathBuf {
    let dir = parent.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(RUN_SETTINGS_FILE), "== SETTINGS FILE ==\n").unwrap();
    for id_dat in 0..n_files {
        std::fs::write(
            dir.join(format!("{name}.dat_{id_dat:04}")),
            raw_file_bytes(id_dat, n_entries),
        )
        .unwrap();
    }
    if finished {
        std::fs::write(dir.join(RUN_FINISHED_MARKER), "").unwrap();
    }
    dir
}

/// Break the frame structure in the middle of a raw file
pub fn corrupt_raw_file(path: &Path) {
    let mut bytes = std::fs::read(path).unwrap();
    // Every frame written by raw_file_bytes carries two hits
    let frame_len = 12 + 2 * 8 + 2;
    let offset = 50 * frame_len;
    bytes[offset] = 0x00;
    bytes[offset + 1] = 0x00;
    std::fs::write(path, bytes).unwrap();
}

/// Everything the binary does before handing over to `monitor_run`
pub fn prepare(raw_dir: &Path, config: &Config) -> (RunContext, Config) {
    let ctx = RunContext::new(raw_dir, config).unwrap();
    let reused = ctx.claim_output_dir().unwrap();
    let effective = ctx.prepare_output(config, reused).unwrap();
    (ctx, effective)
}

/// Flip the checksum of one frame in the middle of a raw file. Frame headers stay intact, so
/// only building the segment can tell.
pub fn corrupt_checksum(path: &Path) {
    let mut bytes = std::fs::read(path).unwrap();
    let frame_len = 12 + 2 * 8 + 2;
    let offset = 50 * frame_len + frame_len - 2;
    bytes[offset] ^= 0xFF;
    bytes[offset + 1] ^= 0xFF;
    std::fs::write(path, bytes).unwrap();
}

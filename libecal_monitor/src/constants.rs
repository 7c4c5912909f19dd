// Raw frame encoding
pub const FRAME_MAGIC: u16 = 0xECA1;
pub const FRAME_HEADER_SIZE: u64 = 12;
pub const HIT_SIZE: u64 = 8;
pub const FRAME_TRAILER_SIZE: u64 = 2;
pub const HIT_BIT_MASK: u8 = 0x01;

// SKIROC geometry: chips per slab and channels per chip
pub const NUMBER_OF_CHIPS: u8 = 16;
pub const NUMBER_OF_CHANNELS: u8 = 64;
pub const MAX_HITS_PER_FRAME: u16 = (NUMBER_OF_CHIPS as u16) * (NUMBER_OF_CHANNELS as u16);

// Files found in the raw run folder
pub const RAW_FILE_MARKERS: [&str; 2] = [".dat_", ".bin_"];
pub const RAW_INDEX_DIGITS: usize = 4;
pub const RUN_SETTINGS_FILE: &str = "Run_Settings.txt";
pub const RUN_FINISHED_MARKER: &str = "hitsHistogram.txt";

// Files and folders owned by the monitoring in the output directory
pub const LOG_FILE: &str = "log_monitoring.log";
pub const CONFIG_COPY_FILE: &str = "monitoring.yml";
pub const MASKED_CHANNELS_COPY_FILE: &str = "masked_channels.txt";
pub const CURRENT_BUILD_FILE: &str = "current_build.h5";
pub const TMP_DIR: &str = "tmp";
pub const SNAPSHOT_DIR: &str = "snapshots";
pub const STOP_MONITORING_FILE: &str = "stop_monitoring";
pub const SUPPRESS_IDLE_INFO_FILE: &str = "suppress_idle_info";

/// Version of the snapshot output format
pub const FORMAT_VERSION: &str = "1.0";

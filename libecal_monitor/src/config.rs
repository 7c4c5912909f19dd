use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::error::{AsuError, ConfigError};
use super::hardware_id::AsuVersion;

/// Structure representing the monitoring configuration.
///
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml. The file has
/// three sections, `monitoring`, `snapshot` and `eventbuilding`. Unknown keys are rejected when
/// the file is read, so a typo fails at startup rather than deep inside a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub monitoring: MonitoringConfig,
    pub snapshot: SnapshotConfig,
    pub eventbuilding: EventBuildingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitoringConfig {
    pub max_workers: usize,
    pub output_parent: PathBuf,
    /// Name of the output folder; the raw run folder name is used when absent
    pub output_name: Option<String>,
    pub skip_dirty_dat: bool,
    /// Number of events per segment; -1 hands out whole files
    #[serde(rename = "binary_split_M")]
    pub binary_split_m: i64,
    pub quality_info: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    #[serde(default = "default_segment_timeout_s")]
    pub segment_timeout_s: u64,
    #[serde(default = "default_idle_alert_s")]
    pub idle_alert_s: u64,
    /// Continue from the newest snapshot of an earlier session in the same output directory
    #[serde(default = "default_resume")]
    pub resume: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotConfig {
    /// Consumed-segment counts at which a snapshot is taken
    pub after: Vec<u64>,
    /// Period (in consumed segments) of snapshots past the largest `after`; <= 0 disables
    pub every: i64,
    pub delete_previous: bool,
}

/// How hits on the same channel inside one event are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeRule {
    #[default]
    Max,
    Sum,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventBuildingConfig {
    pub pedestals_file: PathBuf,
    pub pedestals_lg_file: Option<PathBuf>,
    pub mip_calibration_file: PathBuf,
    pub mip_calibration_lg_file: Option<PathBuf>,
    pub mapping_file: PathBuf,
    pub mapping_file_cob: Option<PathBuf>,
    pub masked_channels_file: Option<PathBuf>,
    pub w_config: i32,
    pub min_slabs_hit: u32,
    /// One entry per slab, either "COB" or a numeric FEV version
    pub asu_versions: Vec<String>,
    /// Hard cap on events per run; -1 is unbounded
    pub max_entries: i64,
    pub no_lg: bool,
    pub zero_suppress: bool,
    #[serde(default = "default_zero_suppress_n_rms")]
    pub zero_suppress_n_rms: f32,
    pub merge_within_chip: bool,
    #[serde(default)]
    pub merge_rule: MergeRule,
    #[serde(default = "default_lg_switch_adc")]
    pub lg_switch_adc: u16,
    pub id_run: Option<u32>,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_poll_interval_ms() -> u64 {
    30_000
}

fn default_segment_timeout_s() -> u64 {
    600
}

fn default_idle_alert_s() -> u64 {
    60
}

fn default_resume() -> bool {
    true
}

fn default_zero_suppress_n_rms() -> f32 {
    3.0
}

fn default_lg_switch_adc() -> u16 {
    3500
}

impl Default for Config {
    /// Generate a template Config. Calibration paths are placeholders.
    fn default() -> Self {
        Self {
            monitoring: MonitoringConfig {
                max_workers: 10,
                output_parent: PathBuf::from("data"),
                output_name: None,
                skip_dirty_dat: true,
                binary_split_m: -1,
                quality_info: true,
                poll_interval_ms: default_poll_interval_ms(),
                max_poll_interval_ms: default_max_poll_interval_ms(),
                segment_timeout_s: default_segment_timeout_s(),
                idle_alert_s: default_idle_alert_s(),
                resume: default_resume(),
            },
            snapshot: SnapshotConfig {
                after: vec![1, 10],
                every: 50,
                delete_previous: false,
            },
            eventbuilding: EventBuildingConfig {
                pedestals_file: PathBuf::from("calibration/pedestals.txt"),
                pedestals_lg_file: Some(PathBuf::from("calibration/pedestals_lg.txt")),
                mip_calibration_file: PathBuf::from("calibration/mip.txt"),
                mip_calibration_lg_file: Some(PathBuf::from("calibration/mip_lg.txt")),
                mapping_file: PathBuf::from("mapping/fev_mapping.txt"),
                mapping_file_cob: Some(PathBuf::from("mapping/cob_mapping.txt")),
                masked_channels_file: None,
                w_config: -1,
                min_slabs_hit: 4,
                asu_versions: vec![String::from("13"); 15],
                max_entries: -1,
                no_lg: false,
                zero_suppress: true,
                zero_suppress_n_rms: default_zero_suppress_n_rms(),
                merge_within_chip: true,
                merge_rule: MergeRule::default(),
                lg_switch_adc: default_lg_switch_adc(),
                id_run: None,
            },
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    ///
    /// Relative calibration paths are taken relative to the directory of the configuration
    /// file. Returns a validated Config if successful.
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;
        let mut config = serde_yaml::from_str::<Self>(&yaml_str)?;
        if let Some(base) = config_path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    /// Make every relative calibration path absolute against `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        let eb = &mut self.eventbuilding;
        resolve(&mut eb.pedestals_file);
        resolve(&mut eb.mip_calibration_file);
        resolve(&mut eb.mapping_file);
        for p in [
            eb.pedestals_lg_file.as_mut(),
            eb.mip_calibration_lg_file.as_mut(),
            eb.mapping_file_cob.as_mut(),
            eb.masked_channels_file.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            resolve(p);
        }
    }

    /// Check value ranges.
    ///
    /// Calibration files are not looked at here: they are opened by the run itself, once its
    /// log file exists, so a missing table ends up in the monitoring log.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitoring.max_workers < 1 {
            return Err(ConfigError::InvalidValue {
                key: "max_workers",
                reason: String::from("must be at least 1"),
            });
        }
        if self.monitoring.poll_interval_ms == 0
            || self.monitoring.max_poll_interval_ms < self.monitoring.poll_interval_ms
        {
            return Err(ConfigError::InvalidValue {
                key: "poll_interval_ms",
                reason: String::from("must be positive and not exceed max_poll_interval_ms"),
            });
        }
        if self.monitoring.segment_timeout_s == 0 {
            return Err(ConfigError::InvalidValue {
                key: "segment_timeout_s",
                reason: String::from("must be positive"),
            });
        }
        if self.snapshot.after.contains(&0) {
            return Err(ConfigError::InvalidValue {
                key: "after",
                reason: String::from("segment counts start at 1"),
            });
        }

        let eb = &self.eventbuilding;
        let versions = eb.parsed_asu_versions()?;
        if versions.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "asu_versions",
                reason: String::from("at least one slab is required"),
            });
        }
        if eb.min_slabs_hit as usize > versions.len() {
            return Err(ConfigError::InvalidValue {
                key: "min_slabs_hit",
                reason: format!("larger than the number of slabs ({})", versions.len()),
            });
        }
        if eb.zero_suppress_n_rms < 0.0 || !eb.zero_suppress_n_rms.is_finite() {
            return Err(ConfigError::InvalidValue {
                key: "zero_suppress_n_rms",
                reason: String::from("must be a finite, non-negative number"),
            });
        }

        Ok(())
    }

    /// Segment size in events, None when whole files are handed out
    pub fn split_events(&self) -> Option<u64> {
        if self.monitoring.binary_split_m > 0 {
            Some(self.monitoring.binary_split_m as u64)
        } else {
            None
        }
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.monitoring.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.monitoring.max_poll_interval_ms)
    }

    pub fn segment_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.monitoring.segment_timeout_s)
    }

    pub fn idle_alert(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.monitoring.idle_alert_s)
    }
}

impl EventBuildingConfig {
    pub fn parsed_asu_versions(&self) -> Result<Vec<AsuVersion>, AsuError> {
        self.asu_versions
            .iter()
            .map(|s| AsuVersion::from_str(s))
            .collect()
    }

    /// Event cap, None when unbounded
    pub fn max_entries(&self) -> Option<u64> {
        if self.max_entries >= 0 {
            Some(self.max_entries as u64)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
monitoring:
  max_workers: 4
  output_parent: data
  skip_dirty_dat: true
  binary_split_M: -1
  quality_info: false
snapshot:
  after: [1, 10]
  every: 50
  delete_previous: true
eventbuilding:
  pedestals_file: ped.txt
  mip_calibration_file: mip.txt
  mapping_file: map.txt
  w_config: 3
  min_slabs_hit: 2
  asu_versions: ["13", "COB"]
  max_entries: -1
  no_lg: true
  zero_suppress: true
  merge_within_chip: false
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(config.monitoring.max_workers, 4);
        assert_eq!(config.split_events(), None);
        assert_eq!(config.monitoring.poll_interval_ms, 2000);
        assert!(config.monitoring.resume);
        assert_eq!(config.eventbuilding.merge_rule, MergeRule::Max);
        assert_eq!(config.eventbuilding.max_entries(), None);
        assert_eq!(
            config.eventbuilding.parsed_asu_versions().unwrap(),
            vec![AsuVersion::Fev(13), AsuVersion::Cob]
        );
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let yaml = MINIMAL.replace("quality_info: false", "quality_info: false\n  colour: red");
        assert!(serde_yaml::from_str::<Config>(&yaml).is_err());
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let yaml = MINIMAL.replace("  min_slabs_hit: 2\n", "");
        assert!(serde_yaml::from_str::<Config>(&yaml).is_err());
    }

    #[test]
    fn test_missing_calibration_is_not_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("monitoring.yml");
        std::fs::write(&config_path, MINIMAL).unwrap();
        let config = Config::read_config_file(&config_path).unwrap();
        assert_eq!(config.eventbuilding.pedestals_file, dir.path().join("ped.txt"));
        assert!(!config.eventbuilding.pedestals_file.exists());
    }

    #[test]
    fn test_validate_value_ranges() {
        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        assert!(config.validate().is_ok());
        config.eventbuilding.min_slabs_hit = 3;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key: "min_slabs_hit", .. })
        ));
        config.eventbuilding.min_slabs_hit = 2;
        config.snapshot.after = vec![0, 10];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key: "after", .. })
        ));
    }

    #[test]
    fn test_template_round_trips() {
        let yaml = serde_yaml::to_string(&Config::default()).unwrap();
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.snapshot.after, vec![1, 10]);
        assert_eq!(config.monitoring.binary_split_m, -1);
    }
}

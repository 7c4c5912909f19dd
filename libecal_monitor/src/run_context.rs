use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;

use super::config::Config;
use super::constants::{
    CONFIG_COPY_FILE, LOG_FILE, MASKED_CHANNELS_COPY_FILE, RUN_SETTINGS_FILE, SNAPSHOT_DIR,
    STOP_MONITORING_FILE, SUPPRESS_IDLE_INFO_FILE, TMP_DIR,
};
use super::error::ConfigError;

/// Identifies one monitored run: where its raw data lives and where its output goes.
///
/// Created once at startup and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_name: String,
    pub id_run: u32,
    pub raw_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl RunContext {
    /// Check the raw run folder and work out the run's names. Touches nothing on disk.
    pub fn new(raw_dir: &Path, config: &Config) -> Result<Self, ConfigError> {
        if !raw_dir.is_dir() {
            return Err(ConfigError::BadRawDirectory(raw_dir.to_path_buf()));
        }
        // Canonical form so a trailing separator does not leave us without a basename
        let raw_dir = raw_dir.canonicalize()?;
        if !raw_dir.join(RUN_SETTINGS_FILE).is_file() {
            return Err(ConfigError::MissingRunSettings(raw_dir));
        }

        let run_name = match config.monitoring.output_name.as_ref() {
            Some(name) => name.clone(),
            None => raw_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| ConfigError::BadRawDirectory(raw_dir.clone()))?,
        };
        let output_parent = &config.monitoring.output_parent;
        let id_run = match config.eventbuilding.id_run {
            Some(id) => id,
            None => guess_id_run(&run_name, output_parent),
        };

        Ok(Self {
            output_dir: output_parent.join(&run_name),
            run_name,
            id_run,
            raw_dir,
        })
    }

    pub fn log_path(&self) -> PathBuf {
        self.output_dir.join(LOG_FILE)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.output_dir.join(TMP_DIR)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.output_dir.join(SNAPSHOT_DIR)
    }

    pub fn stop_file(&self) -> PathBuf {
        self.output_dir.join(STOP_MONITORING_FILE)
    }

    pub fn suppress_idle_info_file(&self) -> PathBuf {
        self.output_dir.join(SUPPRESS_IDLE_INFO_FILE)
    }

    /// Make sure the output directory exists and belongs to us.
    ///
    /// A non-empty directory is only reused if an earlier session left its log file behind.
    /// Returns true if the directory is reused. Called before logging starts, so nothing here
    /// logs.
    pub fn claim_output_dir(&self) -> Result<bool, ConfigError> {
        let reused = self.output_dir.is_dir() && self.output_dir.read_dir()?.next().is_some();
        if reused && !self.log_path().is_file() {
            return Err(ConfigError::ForeignOutputDirectory(self.output_dir.clone()));
        }
        std::fs::create_dir_all(&self.output_dir)?;
        Ok(reused)
    }

    /// Lay out the output directory and leave an audit trail of the effective configuration.
    ///
    /// Returns the configuration the run actually uses (with `id_run` filled in).
    pub fn prepare_output(&self, config: &Config, reused: bool) -> Result<Config, ConfigError> {
        if reused {
            log::warn!(
                "The output directory {} already exists. This is expected if a monitoring session for this run was started (and aborted) earlier.",
                self.output_dir.to_string_lossy()
            );
            let suffix = timestamp_suffix()?;
            for name in [CONFIG_COPY_FILE, MASKED_CHANNELS_COPY_FILE] {
                let existing = self.output_dir.join(name);
                if existing.is_file() {
                    std::fs::rename(&existing, with_suffix(&existing, &suffix))?;
                }
            }
            if self.tmp_dir().is_dir() {
                for item in self.tmp_dir().read_dir()? {
                    let path = item?.path();
                    if path.is_file() {
                        std::fs::remove_file(&path)?;
                    }
                }
            }
        }
        std::fs::create_dir_all(self.tmp_dir())?;
        std::fs::create_dir_all(self.snapshot_dir())?;

        std::fs::copy(
            self.raw_dir.join(RUN_SETTINGS_FILE),
            self.output_dir.join(RUN_SETTINGS_FILE),
        )?;
        if let Some(masked) = config.eventbuilding.masked_channels_file.as_ref() {
            std::fs::copy(masked, self.output_dir.join(MASKED_CHANNELS_COPY_FILE))?;
        }

        let mut effective = config.clone();
        effective.eventbuilding.id_run = Some(self.id_run);
        let yaml_str = serde_yaml::to_string(&effective)?;
        std::fs::write(self.output_dir.join(CONFIG_COPY_FILE), yaml_str)?;
        log::info!("Config file written.");
        Ok(effective)
    }
}

/// Work out a run number from the run name.
///
/// Takes the number following `run_` if there is one. Otherwise the longest (then largest)
/// group of at least three digits. As a last resort, the number of runs already monitored
/// under `output_parent`.
pub fn guess_id_run(name: &str, output_parent: &Path) -> u32 {
    let lower = name.to_lowercase();
    if let Some(pos) = lower.find("run_") {
        let digits: String = lower[pos + 4..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if let Ok(id) = digits.parse::<u32>() {
            return id;
        }
    }

    let groups: Vec<&str> = name
        .split(|c: char| !c.is_ascii_digit())
        .filter(|g| !g.is_empty())
        .collect();
    let longest = groups.iter().map(|g| g.len()).max().unwrap_or(0);
    if longest >= 3 {
        if let Some(id) = groups
            .iter()
            .filter(|g| g.len() == longest)
            .filter_map(|g| g.parse::<u32>().ok())
            .max()
        {
            return id;
        }
    }

    match output_parent.read_dir() {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .count() as u32,
        Err(_) => 0,
    }
}

/// `_YYYY-MM-DD-HHMMSS` in UTC
fn timestamp_suffix() -> Result<String, ConfigError> {
    let format = format_description!("_[year]-[month]-[day]-[hour][minute][second]");
    Ok(OffsetDateTime::now_utc().format(&format)?)
}

/// `monitoring.yml` -> `monitoring_<suffix>.yml`
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}{suffix}"),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_dir(parent: &Path, name: &str) -> PathBuf {
        let dir = parent.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(RUN_SETTINGS_FILE), "settings").unwrap();
        dir
    }

    fn config(output_parent: &Path) -> Config {
        let mut config = Config::default();
        config.monitoring.output_parent = output_parent.to_path_buf();
        config.eventbuilding.masked_channels_file = None;
        config
    }

    #[test]
    fn test_guess_id_run() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(guess_id_run("3x3_Run_0123_beam", dir.path()), 123);
        assert_eq!(guess_id_run("scan_20220315_42_001234", dir.path()), 20220315);
        assert_eq!(guess_id_run("beam_123_456", dir.path()), 456);
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        std::fs::write(dir.path().join("c.txt"), "").unwrap();
        assert_eq!(guess_id_run("cosmics_12", dir.path()), 2);
        assert_eq!(guess_id_run("run_", dir.path()), 2);
    }

    #[test]
    fn test_run_settings_required() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("run_5");
        std::fs::create_dir(&raw).unwrap();
        assert!(matches!(
            RunContext::new(&raw, &config(dir.path())),
            Err(ConfigError::MissingRunSettings(_))
        ));
        assert!(matches!(
            RunContext::new(&dir.path().join("nope"), &config(dir.path())),
            Err(ConfigError::BadRawDirectory(_))
        ));
    }

    #[test]
    fn test_prepare_fresh_output() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_dir(dir.path(), "run_90001");
        let out = dir.path().join("out");
        let ctx = RunContext::new(&raw, &config(&out)).unwrap();
        assert_eq!(ctx.run_name, "run_90001");
        assert_eq!(ctx.id_run, 90001);
        assert_eq!(ctx.output_dir, out.join("run_90001"));

        assert!(!ctx.claim_output_dir().unwrap());
        let effective = ctx.prepare_output(&config(&out), false).unwrap();
        assert_eq!(effective.eventbuilding.id_run, Some(90001));
        assert!(ctx.tmp_dir().is_dir());
        assert!(ctx.snapshot_dir().is_dir());
        assert!(ctx.output_dir.join(RUN_SETTINGS_FILE).is_file());
        let written =
            std::fs::read_to_string(ctx.output_dir.join(CONFIG_COPY_FILE)).unwrap();
        let reread: Config = serde_yaml::from_str(&written).unwrap();
        assert_eq!(reread.eventbuilding.id_run, Some(90001));
    }

    #[test]
    fn test_reuse_requires_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_dir(dir.path(), "run_7");
        let mut conf = config(dir.path());
        conf.monitoring.output_name = Some(String::from("monitor_7"));
        let ctx = RunContext::new(&raw, &conf).unwrap();
        std::fs::create_dir_all(&ctx.output_dir).unwrap();
        std::fs::write(ctx.output_dir.join("something.txt"), "").unwrap();
        assert!(matches!(
            ctx.claim_output_dir(),
            Err(ConfigError::ForeignOutputDirectory(_))
        ));

        std::fs::write(ctx.log_path(), "").unwrap();
        std::fs::create_dir_all(ctx.tmp_dir()).unwrap();
        std::fs::write(ctx.tmp_dir().join("snapshot_000001.h5"), "partial").unwrap();
        std::fs::write(ctx.output_dir.join(CONFIG_COPY_FILE), "old").unwrap();
        assert!(ctx.claim_output_dir().unwrap());
        ctx.prepare_output(&conf, true).unwrap();

        assert_eq!(std::fs::read_dir(ctx.tmp_dir()).unwrap().count(), 0);
        let renamed: Vec<String> = std::fs::read_dir(&ctx.output_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("monitoring_") && n.ends_with(".yml"))
            .collect();
        assert_eq!(renamed.len(), 1);
        assert!(ctx.output_dir.join(CONFIG_COPY_FILE).is_file());
    }

    #[test]
    fn test_with_suffix() {
        assert_eq!(
            with_suffix(Path::new("/a/monitoring.yml"), "_2024-01-02-030405"),
            PathBuf::from("/a/monitoring_2024-01-02-030405.yml")
        );
    }
}

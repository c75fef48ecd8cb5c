//! The daemon's YAML configuration file.
use crate::device::PortPath;
use crate::machine::Timings;
use crate::orchestrator::{OrchestratorConfig, ShutdownPolicy};
use crate::rpiboot::DEFAULT_BOOTCODE_PATH;
use crate::topology::RootSelector;
use crate::write::{DEFAULT_BLOCK_SIZE, FlashOptions};
use serde::{Deserialize, Deserializer, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/boot/firmware/tsflash.yml";

const LOG_LEVELS: &[&str] = &["debug", "info", "warning", "error", "critical"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),
    #[error("cannot read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub image_path: PathBuf,
    /// Hub port to watch; the first hub found when absent.
    #[serde(default)]
    pub port: Option<PortPath>,
    #[serde(default = "default_block_size", deserialize_with = "block_size")]
    pub block_size: usize,
    #[serde(default = "default_stable_delay")]
    pub stable_delay: f64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default)]
    pub parallelism: Option<usize>,
    #[serde(default)]
    pub shutdown: ShutdownPolicy,
    #[serde(default = "default_reenum_timeout")]
    pub reenum_timeout: f64,
    #[serde(default = "default_one")]
    pub poll_interval: f64,
    #[serde(default = "default_one")]
    pub cooldown: f64,
    #[serde(default = "default_bootcode_path")]
    pub bootcode_path: PathBuf,
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_stable_delay() -> f64 {
    3.0
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_reenum_timeout() -> f64 {
    30.0
}

fn default_one() -> f64 {
    1.0
}

fn default_bootcode_path() -> PathBuf {
    PathBuf::from(DEFAULT_BOOTCODE_PATH)
}

/// Accepts either a byte count or a size string such as `4M`.
fn block_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(usize),
        Text(String),
    }
    match Size::deserialize(deserializer)? {
        Size::Bytes(n) => Ok(n),
        Size::Text(s) => parse_block_size(&s).map_err(serde::de::Error::custom),
    }
}

/// Parses a size such as `4M`, `512K`, `1MiB` or `4096` into bytes.
///
/// The result must be a non-zero multiple of 512.
pub fn parse_block_size(s: &str) -> Result<usize, ConfigError> {
    let invalid = || ConfigError::Invalid(format!("invalid block size: {s:?}"));
    let trimmed = s.trim();
    let upper = trimmed.to_ascii_uppercase();
    let unit = upper
        .trim_end_matches("IB")
        .trim_end_matches('B');
    let (digits, multiplier) = match unit.chars().last() {
        Some('K') => (&unit[..unit.len() - 1], 1024),
        Some('M') => (&unit[..unit.len() - 1], 1024 * 1024),
        Some('G') => (&unit[..unit.len() - 1], 1024 * 1024 * 1024),
        _ => (unit, 1),
    };
    let value: usize = digits.trim().parse().map_err(|_| invalid())?;
    let bytes = value.checked_mul(multiplier).ok_or_else(invalid)?;
    check_block_size(bytes)?;
    Ok(bytes)
}

fn check_block_size(bytes: usize) -> Result<(), ConfigError> {
    if bytes == 0 || bytes % 512 != 0 {
        return Err(ConfigError::Invalid(format!(
            "block size must be a positive multiple of 512, got {bytes}"
        )));
    }
    Ok(())
}

impl Config {
    /// Reads, parses and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if text.trim().is_empty() {
            return Err(ConfigError::Invalid("configuration file is empty".into()));
        }
        let config: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.image_path.exists() {
            return Err(ConfigError::Invalid(format!(
                "image file does not exist: {}",
                self.image_path.display()
            )));
        }
        if !self.image_path.is_file() {
            return Err(ConfigError::Invalid(format!(
                "image path is not a file: {}",
                self.image_path.display()
            )));
        }
        check_block_size(self.block_size)?;
        for (name, secs) in [
            ("stable_delay", self.stable_delay),
            ("reenum_timeout", self.reenum_timeout),
            ("poll_interval", self.poll_interval),
            ("cooldown", self.cooldown),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a non-negative number of seconds"
                )));
            }
        }
        if self.poll_interval == 0.0 {
            return Err(ConfigError::Invalid("poll_interval must be positive".into()));
        }
        if self.parallelism == Some(0) {
            return Err(ConfigError::Invalid("parallelism must be at least 1".into()));
        }
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log_level must be one of: {}",
                LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }

    pub fn log_filter(&self) -> log::LevelFilter {
        match self.log_level.to_ascii_lowercase().as_str() {
            "debug" => log::LevelFilter::Debug,
            "warning" | "warn" => log::LevelFilter::Warn,
            "error" | "critical" => log::LevelFilter::Error,
            _ => log::LevelFilter::Info,
        }
    }

    /// The typed settings the orchestrator runs with.
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            root: self
                .port
                .clone()
                .map_or(RootSelector::FirstHub, RootSelector::Port),
            poll_interval: seconds(self.poll_interval),
            timings: Timings {
                stable_delay: seconds(self.stable_delay),
                reenum_timeout: seconds(self.reenum_timeout),
                cooldown: seconds(self.cooldown),
            },
            flash: FlashOptions {
                block_size: self.block_size,
                verify: self.verify,
                length: None,
            },
            parallelism: self.parallelism,
            shutdown: self.shutdown,
            ..OrchestratorConfig::default()
        }
    }
}

fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let image = dir.path().join("os.img");
        std::fs::write(&image, b"image").unwrap();
        let path = dir.path().join("tsflash.yml");
        std::fs::write(
            &path,
            format!("image_path: {}\n{}", image.display(), body),
        )
        .unwrap();
        path
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&write_config(&dir, "")).unwrap();
        assert_eq!(config.port, None);
        assert_eq!(config.block_size, 4 * 1024 * 1024);
        assert_eq!(config.stable_delay, 3.0);
        assert_eq!(config.log_filter(), log::LevelFilter::Info);
        assert!(config.verify);
        assert_eq!(config.shutdown, ShutdownPolicy::Drain);
        assert_eq!(config.bootcode_path, PathBuf::from(DEFAULT_BOOTCODE_PATH));

        let orchestrator = config.orchestrator();
        assert_eq!(orchestrator.root, RootSelector::FirstHub);
        assert_eq!(orchestrator.timings.stable_delay, Duration::from_secs(3));
        assert_eq!(orchestrator.timings.reenum_timeout, Duration::from_secs(30));
        assert_eq!(orchestrator.parallelism, None);
    }

    #[test]
    fn full_config_is_honoured() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "port: \"1-2\"\nblock_size: 512K\nstable_delay: 1.5\nlog_level: WARNING\n\
             verify: false\nparallelism: 4\nshutdown: cancel\ncooldown: 0\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.block_size, 512 * 1024);
        assert_eq!(config.log_filter(), log::LevelFilter::Warn);

        let orchestrator = config.orchestrator();
        assert_eq!(orchestrator.root, RootSelector::Port("1-2".parse().unwrap()));
        assert_eq!(orchestrator.timings.stable_delay, Duration::from_millis(1500));
        assert_eq!(orchestrator.timings.cooldown, Duration::ZERO);
        assert_eq!(orchestrator.parallelism, Some(4));
        assert_eq!(orchestrator.shutdown, ShutdownPolicy::Cancel);
        assert!(!orchestrator.flash.verify);
    }

    #[test]
    fn numeric_block_size_is_accepted() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&write_config(&dir, "block_size: 8192\n")).unwrap();
        assert_eq!(config.block_size, 8192);
    }

    #[test]
    fn rejects_bad_values() {
        let dir = TempDir::new().unwrap();
        for body in [
            "block_size: 1000\n",
            "stable_delay: -1\n",
            "log_level: loud\n",
            "parallelism: 0\n",
        ] {
            let err = Config::load(&write_config(&dir, body)).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid(_) | ConfigError::Parse { .. }),
                "{body}: {err}"
            );
        }
    }

    #[test]
    fn missing_image_and_missing_file_are_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tsflash.yml");
        assert!(matches!(Config::load(&path), Err(ConfigError::NotFound(_))));

        std::fs::write(&path, "image_path: /nonexistent/os.img\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));

        std::fs::write(&path, "").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));

        std::fs::write(&path, "port: [1, 2\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn block_size_strings() {
        assert_eq!(parse_block_size("4M").unwrap(), 4 * 1024 * 1024);
        assert_eq!(parse_block_size("4m").unwrap(), 4 * 1024 * 1024);
        assert_eq!(parse_block_size("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_block_size("1MiB").unwrap(), 1024 * 1024);
        assert_eq!(parse_block_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_block_size("4096").unwrap(), 4096);
        assert!(parse_block_size("0").is_err());
        assert!(parse_block_size("100").is_err());
        assert!(parse_block_size("four").is_err());
        assert!(parse_block_size("").is_err());
    }
}

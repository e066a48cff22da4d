//! Configuration loader and validator for the import daemon and its tools.
use crate::model::ImportKind;
use crate::processor::DEFAULT_BATCH_SIZE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const MAX_FILE_SIZE_MB: u64 = 1024 * 1024;
const MAX_DAYS: i64 = 100 * 365;
const MAX_HOURS: u64 = 365 * 24;
const MAX_RETRY_DELAY_SECONDS: u64 = 7 * 24 * 3600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub import: Import,
    #[serde(default)]
    pub queue: Queue,
    #[serde(default)]
    pub cleanup: Cleanup,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Upload staging and batch processing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Import {
    pub upload_dir: String,
    pub batch_size: usize,
    pub max_file_size_mb: u64,
    pub default_kind: ImportKind,
}

impl Default for Import {
    fn default() -> Self {
        Self {
            upload_dir: "./data/uploads".into(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_file_size_mb: 100,
            default_kind: ImportKind::Unified,
        }
    }
}

/// Worker pool and retry policy of the durable queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Queue {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub retry_delays_seconds: Vec<u64>,
    pub shutdown_grace_seconds: u64,
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 500,
            retry_delays_seconds: vec![60, 120, 300],
            shutdown_grace_seconds: 30,
        }
    }
}

/// Retention windows of the cleanup sweeper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Cleanup {
    pub interval_hours: u64,
    pub upload_max_age_days: i64,
    pub status_retention_days: i64,
}

impl Default for Cleanup {
    fn default() -> Self {
        Self {
            interval_hours: 24,
            upload_max_age_days: 2,
            status_retention_days: 14,
        }
    }
}

impl Config {
    /// Ensure required directories exist (data dir and upload dir).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(&self.app.data_dir)?;
        fs::create_dir_all(&self.import.upload_dir)
    }

    /// `DATABASE_URL` wins over the default SQLite file inside `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/clinic-import.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.import.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup.interval_hours.saturating_mul(3600))
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.queue
            .retry_delays_seconds
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.import.upload_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("import.upload_dir must be non-empty"));
    }
    if cfg.import.batch_size == 0 {
        return Err(ConfigError::Invalid("import.batch_size must be > 0"));
    }
    if cfg.import.max_file_size_mb == 0 {
        return Err(ConfigError::Invalid("import.max_file_size_mb must be > 0"));
    }
    if cfg.import.max_file_size_mb > MAX_FILE_SIZE_MB {
        return Err(ConfigError::Invalid("import.max_file_size_mb must be <= 1048576"));
    }

    if cfg.queue.workers == 0 {
        return Err(ConfigError::Invalid("queue.workers must be > 0"));
    }
    if cfg.queue.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("queue.poll_interval_ms must be > 0"));
    }

    if cfg
        .queue
        .retry_delays_seconds
        .iter()
        .any(|s| *s > MAX_RETRY_DELAY_SECONDS)
    {
        return Err(ConfigError::Invalid(
            "queue.retry_delays_seconds entries must be <= 604800",
        ));
    }

    if cfg.cleanup.interval_hours == 0 || cfg.cleanup.interval_hours > MAX_HOURS {
        return Err(ConfigError::Invalid("cleanup.interval_hours must be in 1..=8760"));
    }
    if !(1..=MAX_DAYS).contains(&cfg.cleanup.upload_max_age_days) {
        return Err(ConfigError::Invalid("cleanup.upload_max_age_days must be in 1..=36500"));
    }
    if !(1..=MAX_DAYS).contains(&cfg.cleanup.status_retention_days) {
        return Err(ConfigError::Invalid("cleanup.status_retention_days must be in 1..=36500"));
    }

    Ok(())
}

/// Example configuration shipped with the project.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

import:
  upload_dir: "./data/uploads"
  batch_size: 100
  max_file_size_mb: 100
  default_kind: unified

queue:
  workers: 4
  poll_interval_ms: 500
  retry_delays_seconds: [60, 120, 300]
  shutdown_grace_seconds: 30

cleanup:
  interval_hours: 24
  upload_max_age_days: 2
  status_retention_days: 14
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.import.default_kind, ImportKind::Unified);
        assert_eq!(
            cfg.retry_delays(),
            vec![
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(300)
            ]
        );
    }

    #[test]
    fn optional_sections_fall_back_to_defaults() {
        let cfg: Config = serde_yaml::from_str("app:\n  data_dir: ./d\n").unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.import, Import::default());
        assert_eq!(cfg.queue.retry_delays_seconds, vec![60, 120, 300]);
        assert_eq!(cfg.cleanup.status_retention_days, 14);
    }

    #[test]
    fn invalid_batch_size() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.import.batch_size = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("batch_size")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn oversized_values_are_rejected() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.import.max_file_size_mb = u64::MAX;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
        assert_eq!(cfg.max_upload_bytes(), u64::MAX);

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.cleanup.interval_hours = u64::MAX;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
        assert_eq!(cfg.cleanup_interval(), Duration::from_secs(u64::MAX));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.cleanup.upload_max_age_days = i64::MAX;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.cleanup.status_retention_days = MAX_DAYS + 1;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.queue.retry_delays_seconds = vec![60, u64::MAX];
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.cleanup.status_retention_days = MAX_DAYS;
        cfg.import.max_file_size_mb = MAX_FILE_SIZE_MB;
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_queue_and_cleanup_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.queue.workers = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.cleanup.status_retention_days = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_and_upload_dirs() {
        let td = tempdir().unwrap();
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = td.path().join("data").to_string_lossy().to_string();
        cfg.import.upload_dir = td.path().join("up").to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(td.path().join("data").exists());
        assert!(td.path().join("up").exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.queue.workers, 4);
        assert_eq!(cfg.max_upload_bytes(), 100 * 1024 * 1024);
    }
}

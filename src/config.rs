//! Configuration loader and validator for the newsletter dispatch worker.
use crate::model::LanguageCode;
use crate::processor::ProcessorSettings;
use crate::schedule::ScheduleDefaults;
use crate::timezone::{parse_timezone, OperationalTarget};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub scheduler: Scheduler,
    pub workers: Workers,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Prefix for payload keys, e.g. `prod` → `worker-prod/newsletter-data/…`.
    pub environment: String,
    pub poll_interval_ms: u64,
}

/// Scheduling, queue and retention tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduler {
    pub languages: Vec<String>,
    pub operational_timezone: String,
    pub target_hour: i64,
    pub default_utc_send_hour: i64,
    pub resync_interval_seconds: u64,
    pub preload_lead_hours: u64,
    pub generation_interval_seconds: u64,
    pub retention_days: u64,
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workers {
    pub preload: usize,
    pub fulfill: usize,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/newsletter.db", self.app.data_dir))
    }

    pub fn languages(&self) -> Vec<LanguageCode> {
        // validated on load
        self.scheduler
            .languages
            .iter()
            .filter_map(|l| LanguageCode::new(l).ok())
            .collect()
    }

    pub fn operational_target(&self) -> OperationalTarget {
        OperationalTarget::new(&self.scheduler.operational_timezone, self.scheduler.target_hour)
            .unwrap_or_default()
    }

    pub fn schedule_defaults(&self) -> ScheduleDefaults {
        ScheduleDefaults {
            target: self.operational_target(),
            ..ScheduleDefaults::with_utc_hour(self.scheduler.default_utc_send_hour).unwrap_or_default()
        }
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            resync_interval: Duration::seconds(self.scheduler.resync_interval_seconds as i64),
            preload_lead: Duration::hours(self.scheduler.preload_lead_hours as i64),
        }
    }

    pub fn retention_period(&self) -> Duration {
        Duration::days(self.scheduler.retention_days as i64)
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
    if cfg.app.environment.trim().is_empty() {
        return Err(ConfigError::Invalid("app.environment must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    let s = &cfg.scheduler;
    if s.languages.is_empty() {
        return Err(ConfigError::Invalid("scheduler.languages must be non-empty"));
    }
    if s.languages.iter().any(|l| LanguageCode::new(l).is_err()) {
        return Err(ConfigError::Invalid(
            "scheduler.languages must be two-letter lowercase codes",
        ));
    }
    if parse_timezone(&s.operational_timezone).is_err() {
        return Err(ConfigError::Invalid(
            "scheduler.operational_timezone must be an IANA timezone",
        ));
    }
    if !(0..=23).contains(&s.target_hour) {
        return Err(ConfigError::Invalid("scheduler.target_hour must be within 0..=23"));
    }
    if !(0..=23).contains(&s.default_utc_send_hour) {
        return Err(ConfigError::Invalid(
            "scheduler.default_utc_send_hour must be within 0..=23",
        ));
    }
    if s.resync_interval_seconds == 0 {
        return Err(ConfigError::Invalid("scheduler.resync_interval_seconds must be > 0"));
    }
    if s.generation_interval_seconds == 0 {
        return Err(ConfigError::Invalid(
            "scheduler.generation_interval_seconds must be > 0",
        ));
    }
    if s.retention_days == 0 {
        return Err(ConfigError::Invalid("scheduler.retention_days must be > 0"));
    }
    if s.sweep_interval_seconds == 0 {
        return Err(ConfigError::Invalid("scheduler.sweep_interval_seconds must be > 0"));
    }

    if cfg.workers.preload == 0 {
        return Err(ConfigError::Invalid("workers.preload must be > 0"));
    }
    if cfg.workers.fulfill == 0 {
        return Err(ConfigError::Invalid("workers.fulfill must be > 0"));
    }

    Ok(())
}

/// Returns the example YAML shipped as `config.yaml`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  environment: "dev"
  poll_interval_ms: 60000

scheduler:
  languages:
    - "es"
  operational_timezone: "Etc/GMT+5"
  target_hour: 10
  default_utc_send_hour: 11
  resync_interval_seconds: 10800
  preload_lead_hours: 24
  generation_interval_seconds: 3600
  retention_days: 30
  sweep_interval_seconds: 86400

workers:
  preload: 2
  fulfill: 2
"#
}

//! Configuration loader and validator for the campaign dispatch engine.
use crate::worker::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
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
    pub whatsapp: WhatsApp,
    pub realtime: Realtime,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub job_timeout_seconds: u64,
    pub lease_seconds: u64,
    pub max_backoff_seconds: u64,
}

/// WhatsApp Cloud API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WhatsApp {
    pub api_base: String,
}

/// Real-time stats channel settings. An empty webhook URL disables publishing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Realtime {
    #[serde(default)]
    pub webhook_url: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            workers: self.app.workers,
            poll_interval: Duration::from_millis(self.app.poll_interval_ms),
            job_timeout: Duration::from_secs(self.app.job_timeout_seconds),
            lease_secs: self.app.lease_seconds as i64,
            max_backoff_secs: self.app.max_backoff_seconds as i64,
        }
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
    if cfg.app.workers == 0 {
        return Err(ConfigError::Invalid("app.workers must be > 0"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.job_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.job_timeout_seconds must be > 0"));
    }
    if cfg.app.lease_seconds == 0 {
        return Err(ConfigError::Invalid("app.lease_seconds must be > 0"));
    }
    // The lease must outlive a job attempt, otherwise a slow-but-alive worker
    // gets its job redelivered while still holding it.
    if cfg.app.lease_seconds <= cfg.app.job_timeout_seconds {
        return Err(ConfigError::Invalid(
            "app.lease_seconds must exceed app.job_timeout_seconds",
        ));
    }

    if cfg.whatsapp.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("whatsapp.api_base must be non-empty"));
    }

    Ok(())
}

/// Example YAML configuration, used by tests and `init-config`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  workers: 4
  poll_interval_ms: 500
  job_timeout_seconds: 30
  lease_seconds: 60
  max_backoff_seconds: 3600

whatsapp:
  api_base: "https://graph.facebook.com/"

realtime:
  # Leave empty to disable real-time stats publishing.
  webhook_url: ""
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_workers() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.workers = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("app.workers")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_api_base() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.whatsapp.api_base = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("whatsapp.api_base")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn lease_must_exceed_job_timeout() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.lease_seconds = cfg.app.job_timeout_seconds;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn worker_config_maps_durations() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        let wc = cfg.worker_config();
        assert_eq!(wc.workers, 4);
        assert_eq!(wc.poll_interval, Duration::from_millis(500));
        assert_eq!(wc.job_timeout, Duration::from_secs(30));
        assert_eq!(wc.lease_secs, 60);
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        let mut f = fs::File::create(&p).unwrap();
        f.write_all(example().as_bytes()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.workers, 4);
    }
}

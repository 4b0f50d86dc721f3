//! Configuration loader and validator for the bulk-post scheduler.
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::orchestrator::HEARTBEAT_INTERVAL_SECS;

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
    pub posting: Posting,
    #[serde(default)]
    pub orchestrator: Orchestrator,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// How often the background poller looks for due jobs.
    pub poll_interval_ms: u64,
    /// A `processing` job without a heartbeat for this long is considered abandoned.
    pub stale_after_seconds: u64,
    /// IANA zone used for quiet hours when a request does not name one.
    pub timezone: String,
}

/// Aggregator API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Posting {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Orchestrator {
    /// Consecutive transport/auth failures after which a run is abandoned. 0 disables.
    pub max_consecutive_failures: u32,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
        }
    }
}

impl App {
    /// Data directory with a leading `~/` expanded.
    pub fn resolved_data_dir(&self) -> String {
        match (self.data_dir.strip_prefix("~/"), std::env::var("HOME")) {
            (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
            _ => self.data_dir.clone(),
        }
    }

    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(Tz::UTC)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` if set, otherwise a file in the data directory.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/postcadence.db", self.app.resolved_data_dir())
        })
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
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    // A waiting run only heartbeats once per HEARTBEAT_INTERVAL_SECS.
    if cfg.app.stale_after_seconds < 2 * HEARTBEAT_INTERVAL_SECS {
        return Err(ConfigError::Invalid(
            "app.stale_after_seconds must be at least twice the heartbeat interval (120)",
        ));
    }
    if cfg.app.timezone.parse::<Tz>().is_err() {
        return Err(ConfigError::Invalid("app.timezone must be an IANA zone name"));
    }

    if cfg.posting.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("posting.base_url must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.posting.base_url).is_err() {
        return Err(ConfigError::Invalid("posting.base_url must be a valid URL"));
    }
    if cfg.posting.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("posting.api_key must be non-empty"));
    }

    Ok(())
}

/// Example configuration, also used by tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 60000
  stale_after_seconds: 3600
  timezone: "Europe/London"

posting:
  base_url: "https://api.example-aggregator.com/"
  api_key: "YOUR_AGGREGATOR_API_KEY"

orchestrator:
  max_consecutive_failures: 3
"#
}

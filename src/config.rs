use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Sync engine settings, read from a TOML file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub database_path: PathBuf,
    pub store_open_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub retry_base_secs: u64,
    pub retry_max_secs: u64,
    pub max_attempts: u32,
    pub max_concurrent_reports: usize,
    pub connectivity_quiet_ms: u64,
    pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000/api".to_string(),
            api_token: None,
            database_path: PathBuf::from("./data/missions.db"),
            store_open_timeout_secs: 5,
            request_timeout_secs: 30,
            sync_interval_secs: 30,
            retry_base_secs: 30,
            retry_max_secs: 300,
            max_attempts: 5,
            max_concurrent_reports: 3,
            connectivity_quiet_ms: 1500,
            probe_interval_secs: 15,
        }
    }
}

impl SyncConfig {
    /// Loads the config file; a missing file yields the defaults.
    /// `MISSION_SYNC_API_URL` and `MISSION_SYNC_TOKEN` override the file.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(AppError::Filesystem(e)),
        };

        if let Ok(url) = std::env::var("MISSION_SYNC_API_URL") {
            config.api_base_url = url;
        }
        if let Ok(token) = std::env::var("MISSION_SYNC_TOKEN") {
            config.api_token = Some(token);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(s: &str) -> Result<Self, AppError> {
        toml::from_str(s).map_err(|e| AppError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, AppError> {
        toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.api_base_url.trim().is_empty() {
            return Err(AppError::Config("api_base_url must not be empty".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(AppError::Config("max_attempts must be at least 1".to_string()));
        }
        if self.max_concurrent_reports == 0 {
            return Err(AppError::Config(
                "max_concurrent_reports must be at least 1".to_string(),
            ));
        }
        if self.retry_base_secs > self.retry_max_secs {
            return Err(AppError::Config(
                "retry_base_secs must not exceed retry_max_secs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn store_open_timeout(&self) -> Duration {
        Duration::from_secs(self.store_open_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn connectivity_quiet_window(&self) -> Duration {
        Duration::from_millis(self.connectivity_quiet_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use validator::Validate;

use crate::config::env::{self, EnvKey};

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_WORKER_COMMAND: &str = "python3 process_video.py";
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 15 * 60;
pub const DEFAULT_STORAGE_ROOT: &str = "uploads";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has an invalid value: {value:?}")]
    Malformed { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    pub server_port: u16,
    #[validate(range(min = 1, message = "MAX_UPLOAD_BYTES must be at least 1"))]
    pub max_upload_bytes: u64,
    #[validate(length(min = 1, message = "WORKER_COMMAND must not be empty"))]
    pub worker_command: String,
    #[validate(range(min = 1, max = 86400, message = "JOB_TIMEOUT_SECS must be within 1..=86400"))]
    pub job_timeout_secs: u64,
    #[validate(length(min = 1, message = "STORAGE_ROOT must not be empty"))]
    pub storage_root: String,
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let config = Self {
            server_port: parsed(EnvKey::ServerPort, DEFAULT_PORT)?,
            max_upload_bytes: parsed(EnvKey::MaxUploadBytes, DEFAULT_MAX_UPLOAD_BYTES)?,
            worker_command: env::get_or(EnvKey::WorkerCommand, DEFAULT_WORKER_COMMAND),
            job_timeout_secs: parsed(EnvKey::JobTimeoutSecs, DEFAULT_JOB_TIMEOUT_SECS)?,
            storage_root: env::get_or(EnvKey::StorageRoot, DEFAULT_STORAGE_ROOT),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn storage_root(&self) -> PathBuf {
        PathBuf::from(&self.storage_root)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_PORT,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            worker_command: DEFAULT_WORKER_COMMAND.to_string(),
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            storage_root: DEFAULT_STORAGE_ROOT.to_string(),
        }
    }
}

fn parsed<T: std::str::FromStr>(key: EnvKey, default: T) -> Result<T, ConfigError> {
    let name = key.as_str();
    env::get_parsed(key, default).map_err(|value| ConfigError::Malformed { key: name, value })
}

use std::env;
use std::str::FromStr;

pub enum EnvKey {
    ServerPort,
    MaxUploadBytes,
    WorkerCommand,
    JobTimeoutSecs,
    StorageRoot,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::ServerPort => "APP_PORT",
            EnvKey::MaxUploadBytes => "MAX_UPLOAD_BYTES",
            EnvKey::WorkerCommand => "WORKER_COMMAND",
            EnvKey::JobTimeoutSecs => "JOB_TIMEOUT_SECS",
            EnvKey::StorageRoot => "STORAGE_ROOT",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

/// Parses the variable, returning `Err` with the raw value when it is set but
/// malformed. Unset variables yield the default.
pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> Result<T, String> {
    match get(key) {
        Ok(val) => val.trim().parse::<T>().map_err(|_| val),
        Err(_) => Ok(default),
    }
}

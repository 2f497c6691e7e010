use anyhow::{Context, Result};
use tracing::info;

use crate::config::settings::AppConfig;
use crate::infrastructure::storage::local::BlobStore;
use crate::modules::caption::service::JobCoordinator;
use crate::workers::runner::{JobRunner, WorkerCommand};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub coordinator: JobCoordinator,
}

impl AppState {
    pub fn new(config: AppConfig, coordinator: JobCoordinator) -> Self {
        Self {
            config,
            coordinator,
        }
    }

    /// Wires storage and the worker from configuration. Fails when the
    /// worker cannot be found, so a broken deployment never accepts uploads.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let worker = WorkerCommand::parse(&config.worker_command)
            .context("Invalid WORKER_COMMAND")?;
        let worker = worker
            .validate()
            .with_context(|| format!("Worker {:?} is not available", config.worker_command))?;
        info!("Worker resolved to {} {}", worker.program, worker.args.join(" "));

        let store = BlobStore::new(config.storage_root())
            .context("Failed to prepare storage root")?;
        let coordinator =
            JobCoordinator::new(store, JobRunner::new(), worker, config.job_timeout());

        Ok(Self::new(config, coordinator))
    }
}

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use super::model::{BlobRef, Job, JobId, JobStatus};
use crate::infrastructure::storage::local::{BlobStore, StorageError};
use crate::workers::runner::{JobOutcome, JobRunner, RunnerError, WorkerCommand};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("worker task failed: {0}")]
    Join(#[from] JoinError),
}

/// Why a job produced no output. Only the code and message leave the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    WorkerFailed,
    MissingOutput,
    TimedOut,
    Internal,
}

impl FailureReason {
    pub fn code(self) -> &'static str {
        match self {
            FailureReason::WorkerFailed | FailureReason::MissingOutput => "PROCESSING_FAILED",
            FailureReason::TimedOut => "PROCESSING_TIMEOUT",
            FailureReason::Internal => "INTERNAL_ERROR",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            FailureReason::WorkerFailed | FailureReason::MissingOutput => {
                "Failed to process video"
            }
            FailureReason::TimedOut => "Video processing timed out",
            FailureReason::Internal => "An internal error occurred",
        }
    }
}

/// Releases everything a job put on disk, exactly once.
///
/// Dropping the guard schedules the release on the current runtime (or runs
/// it inline when there is none), so every exit path is covered: normal
/// return, early error, cancelled request, finished or aborted download.
/// When a worker was started, the release first waits for its task to wind
/// down, so the workspace is never removed under a live process.
pub struct CleanupGuard {
    store: BlobStore,
    job: Job,
    worker: Option<oneshot::Receiver<()>>,
    armed: bool,
}

impl CleanupGuard {
    fn new(store: BlobStore, job: Job) -> Self {
        Self {
            store,
            job,
            worker: None,
            armed: true,
        }
    }

    /// Resolves (as closed) once the worker task has finished or been dropped.
    fn wait_for_worker(&mut self, settled: oneshot::Receiver<()>) {
        self.worker = Some(settled);
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    fn job_mut(&mut self) -> &mut Job {
        &mut self.job
    }

    /// Awaited release, for callers that need the files gone before moving on.
    pub async fn release(mut self) {
        self.armed = false;
        worker_settled(self.worker.take()).await;
        release_job(&self.store, &mut self.job).await;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        let store = self.store.clone();
        let mut job = self.job.clone();
        let worker = self.worker.take();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    worker_settled(worker).await;
                    release_job(&store, &mut job).await
                });
            }
            Err(_) => {
                store.release_workspace_blocking(&job.id);
                mark_cleaned(&mut job);
            }
        }
    }
}

async fn worker_settled(worker: Option<oneshot::Receiver<()>>) {
    if let Some(settled) = worker {
        // the sender is never used; only its drop matters
        let _ = settled.await;
    }
}

async fn release_job(store: &BlobStore, job: &mut Job) {
    store.release(&job.input).await;
    if let Some(output) = &job.output {
        store.release(output).await;
    }
    // auxiliary worker files live in the workspace
    store.release_workspace(&job.id).await;
    mark_cleaned(job);
}

fn mark_cleaned(job: &mut Job) {
    let outcome = job.status;
    if let Err(e) = job.advance(JobStatus::Cleaned) {
        // cancelled requests release jobs that never reached an outcome
        debug!(job_id = %job.id, error = %e, "Job released before finishing");
        job.status = JobStatus::Cleaned;
    }
    info!(
        job_id = %job.id,
        outcome = %outcome,
        age_ms = job.age().whole_milliseconds() as i64,
        "Job cleaned"
    );
}

/// A finished job whose output is on disk. Drop it (or its cleanup guard)
/// once the output has been delivered.
pub struct ReadyOutput {
    output: BlobRef,
    cleanup: CleanupGuard,
}

impl ReadyOutput {
    pub fn output(&self) -> &BlobRef {
        &self.output
    }

    pub fn job_id(&self) -> JobId {
        self.cleanup.job_id()
    }

    pub fn into_parts(self) -> (BlobRef, CleanupGuard) {
        (self.output, self.cleanup)
    }
}

pub struct JobFailure {
    reason: FailureReason,
    cleanup: CleanupGuard,
}

impl JobFailure {
    pub fn reason(&self) -> FailureReason {
        self.reason
    }

    pub fn job_id(&self) -> JobId {
        self.cleanup.job_id()
    }

    pub fn into_cleanup(self) -> CleanupGuard {
        self.cleanup
    }
}

pub enum JobResult {
    Ready(ReadyOutput),
    Failed(JobFailure),
}

impl JobResult {
    pub fn job_id(&self) -> JobId {
        match self {
            JobResult::Ready(ready) => ready.job_id(),
            JobResult::Failed(failure) => failure.job_id(),
        }
    }

    /// Awaits cleanup regardless of the outcome.
    pub async fn release(self) {
        match self {
            JobResult::Ready(ready) => ready.cleanup.release().await,
            JobResult::Failed(failure) => failure.cleanup.release().await,
        }
    }
}

/// Drives one job from staged input to a deliverable output or a failure.
///
/// Holds no per-job state; every call works in its own workspace, so calls
/// run concurrently without locking.
#[derive(Clone)]
pub struct JobCoordinator {
    store: BlobStore,
    runner: JobRunner,
    worker: Arc<WorkerCommand>,
    timeout: Duration,
}

impl JobCoordinator {
    pub fn new(store: BlobStore, runner: JobRunner, worker: WorkerCommand, timeout: Duration) -> Self {
        Self {
            store,
            runner,
            worker: Arc::new(worker),
            timeout,
        }
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    pub async fn execute(&self, input: &[u8], extension: &str) -> Result<JobResult, CoordinatorError> {
        let blob = self.store.stage(input, extension).await?;
        Ok(self.execute_staged(blob).await)
    }

    /// Runs the worker on an already staged input. Cleanup of the input is
    /// owned by the returned result from here on.
    pub async fn execute_staged(&self, input: BlobRef) -> JobResult {
        let mut guard = CleanupGuard::new(self.store.clone(), Job::new(input.clone()));
        let job_id = guard.job_id();

        if !tokio::fs::try_exists(&input.path).await.unwrap_or(false) {
            error!(job_id = %job_id, "Staged input is missing: {}", input.path.display());
            return fail(guard, FailureReason::Internal);
        }
        if let Err(e) = guard.job_mut().advance(JobStatus::Staged) {
            error!(error = %e, "Job could not be staged");
            return fail(guard, FailureReason::Internal);
        }
        info!(job_id = %job_id, "Job staged");

        let workspace = match self.store.resolve(&job_id).await {
            Ok(dir) => dir,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to allocate workspace");
                return fail(guard, FailureReason::Internal);
            }
        };

        let output = self.store.output_ref(&job_id);
        guard.job_mut().output = Some(output.clone());
        if let Err(e) = guard.job_mut().advance(JobStatus::Running) {
            error!(error = %e, "Job could not start");
            return fail(guard, FailureReason::Internal);
        }

        info!(
            job_id = %job_id,
            "Processing video: {} -> {}",
            input.path.display(),
            output.path.display()
        );
        let args = vec![
            input.path.clone().into_os_string(),
            output.path.clone().into_os_string(),
        ];

        let (settled, worker_settled) = oneshot::channel();
        guard.wait_for_worker(worker_settled);

        match self.run_isolated(args, workspace, settled).await {
            Ok(JobOutcome::Success { stdout }) => {
                debug!(job_id = %job_id, stdout = %stdout, "Worker output");
                let job = guard.job_mut();
                job.exit_code = Some(0);
                job.diagnostics = Some(stdout);

                if tokio::fs::try_exists(&output.path).await.unwrap_or(false) {
                    if let Err(e) = guard.job_mut().advance(JobStatus::Ready) {
                        error!(error = %e, "Job could not complete");
                        return fail(guard, FailureReason::Internal);
                    }
                    info!(job_id = %job_id, "Video processing complete");
                    JobResult::Ready(ReadyOutput {
                        output,
                        cleanup: guard,
                    })
                } else {
                    warn!(job_id = %job_id, "Worker exited cleanly but wrote no output");
                    fail(guard, FailureReason::MissingOutput)
                }
            }
            Ok(JobOutcome::WorkerFailure { exit_code, stderr }) => {
                error!(job_id = %job_id, exit_code, stderr = %stderr, "Worker failed");
                let job = guard.job_mut();
                job.exit_code = Some(exit_code);
                job.diagnostics = Some(stderr);
                fail(guard, FailureReason::WorkerFailed)
            }
            Ok(JobOutcome::Timeout { elapsed }) => {
                error!(
                    job_id = %job_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Worker exceeded its time limit"
                );
                fail(guard, FailureReason::TimedOut)
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Worker could not run");
                fail(guard, FailureReason::Internal)
            }
        }
    }

    /// Runs the worker on its own task. Dropping the returned future aborts
    /// the task, which kills the worker. `settled` is dropped only after the
    /// runner itself, whether the task completes or is aborted.
    async fn run_isolated(
        &self,
        args: Vec<OsString>,
        workspace: PathBuf,
        settled: oneshot::Sender<()>,
    ) -> Result<JobOutcome, CoordinatorError> {
        let runner = self.runner.clone();
        let worker = Arc::clone(&self.worker);
        let timeout = self.timeout;

        let task = AbortOnDropHandle::new(tokio::spawn(async move {
            // the awaited runner, a tail temporary, drops before `_settled`
            let _settled = settled;
            runner.run(&worker, &args, &workspace, timeout).await
        }));

        Ok(task.await??)
    }
}

fn fail(mut guard: CleanupGuard, reason: FailureReason) -> JobResult {
    let job = guard.job_mut();
    if let Err(e) = job.advance(JobStatus::Failed) {
        warn!(error = %e, "Unexpected failure transition");
        job.status = JobStatus::Failed;
    }
    JobResult::Failed(JobFailure {
        reason,
        cleanup: guard,
    })
}

//! External worker invocation.
//!
//! [`JobRunner::run`] spawns one child process, captures its output, and
//! reports a raw [`JobOutcome`]. It never interprets what the worker does.
//! The child is placed in its own process group so a timeout or a dropped
//! call also takes down anything the worker spawned (ffmpeg, whisper...).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Maximum bytes kept per output stream. Anything beyond is drained and dropped.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("failed waiting on worker: {0}")]
    Wait(#[source] std::io::Error),
    #[error("worker command is empty")]
    EmptyCommand,
    #[error("worker program {0} was not found")]
    ProgramNotFound(String),
    #[error("worker argument {0} points to a missing file")]
    MissingScript(String),
}

/// Raw result of one worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success { stdout: String },
    WorkerFailure { exit_code: i32, stderr: String },
    Timeout { elapsed: Duration },
}

/// Program plus leading arguments, e.g. `python3 process_video.py`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, RunnerError> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(RunnerError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Checks once at startup that the worker can actually be launched and
    /// pins it to absolute paths.
    ///
    /// Jobs run with their workspace as the working directory, so a relative
    /// program or script would otherwise be looked up in the wrong place.
    pub fn validate(&self) -> Result<WorkerCommand, RunnerError> {
        let program = resolve_program(&self.program)
            .ok_or_else(|| RunnerError::ProgramNotFound(self.program.clone()))?;

        // Leading arguments that name a script must exist; flags are ignored.
        let mut args = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            let path = Path::new(arg);
            if arg.starts_with('-') {
                args.push(arg.clone());
            } else if path.exists() {
                args.push(absolute(path).to_string_lossy().into_owned());
            } else if path.extension().is_some() {
                return Err(RunnerError::MissingScript(arg.clone()));
            } else {
                args.push(arg.clone());
            }
        }

        Ok(WorkerCommand {
            program: absolute(&program).to_string_lossy().into_owned(),
            args,
        })
    }
}

fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path_var: OsString = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[derive(Debug, Clone, Default)]
pub struct JobRunner;

impl JobRunner {
    pub fn new() -> Self {
        Self
    }

    /// Runs `command` followed by `args` inside `working_dir`.
    ///
    /// The returned future owns the child: dropping it before completion kills
    /// the worker's process group.
    pub async fn run(
        &self,
        command: &WorkerCommand,
        args: &[OsString],
        working_dir: &Path,
        timeout: Duration,
    ) -> Result<JobOutcome, RunnerError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        let mut group = ProcessGroup::of(&child);
        debug!(pid = ?child.id(), cwd = %working_dir.display(), "Worker spawned");

        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                group.kill();
                return Err(RunnerError::Wait(e));
            }
            Err(_elapsed) => {
                let elapsed = start.elapsed();
                warn!(elapsed_ms = elapsed.as_millis() as u64, "Worker timed out, terminating");
                group.kill();
                terminate(&mut child).await;
                stdout_task.abort();
                stderr_task.abort();
                return Ok(JobOutcome::Timeout { elapsed });
            }
        };
        // The worker is gone; sweep up anything it left running in its group.
        group.kill();

        let stdout = lossy(stdout_task.await.unwrap_or_default());
        let stderr = lossy(stderr_task.await.unwrap_or_default());
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            exit_code = ?status.code(),
            "Worker exited"
        );

        Ok(classify(status, stdout, stderr))
    }
}

fn classify(status: ExitStatus, stdout: String, stderr: String) -> JobOutcome {
    if status.success() {
        JobOutcome::Success { stdout }
    } else {
        // Killed by a signal: no exit code.
        JobOutcome::WorkerFailure {
            exit_code: status.code().unwrap_or(-1),
            stderr,
        }
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Worker already exited");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "Failed to reap worker");
    }
}

async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
        // keep draining so a chatty worker never blocks on a full pipe
        let _ = tokio::io::copy(&mut h, &mut tokio::io::sink()).await;
    }
    buf
}

fn lossy(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Kills the worker's whole process group when dropped or asked to.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            let Ok(pgid) = libc::pid_t::try_from(pgid) else {
                return;
            };
            // SAFETY: killpg only sends a signal; an absent group yields ESRCH.
            let ret = unsafe { libc::killpg(pgid, libc::SIGKILL) };
            if ret == 0 {
                debug!(pgid, "Killed worker process group");
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

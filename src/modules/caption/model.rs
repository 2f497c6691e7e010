use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Identifier of one upload-to-result lifecycle.
///
/// Backed by a UUIDv7: a millisecond timestamp followed by a counter that the
/// generator keeps monotonic within the process, then random bits. Two jobs
/// created in the same millisecond still get distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

/// A blob on local storage that belongs to exactly one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    pub job_id: JobId,
    pub path: PathBuf,
}

impl BlobRef {
    pub fn new(job_id: JobId, path: PathBuf) -> Self {
        Self { job_id, path }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Staged,
    Running,
    Ready,
    Failed,
    Cleaned,
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Staged)
                | (Staged, Running)
                | (Running, Ready)
                | (Running, Failed)
                // staging or workspace allocation can fail before the worker starts
                | (Pending, Failed)
                | (Staged, Failed)
                | (Ready, Cleaned)
                | (Failed, Cleaned)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Staged => "STAGED",
            JobStatus::Running => "RUNNING",
            JobStatus::Ready => "READY",
            JobStatus::Failed => "FAILED",
            JobStatus::Cleaned => "CLEANED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("job {job_id}: illegal transition {from} -> {to}")]
pub struct InvalidTransition {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub input: BlobRef,
    pub output: Option<BlobRef>,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    /// Worker stdout/stderr. Server-side only, never returned to callers.
    pub diagnostics: Option<String>,
    pub created_at: OffsetDateTime,
}

impl Job {
    /// A job for an input blob; it moves to `Staged` once the input is
    /// confirmed on disk.
    pub fn new(input: BlobRef) -> Self {
        Self {
            id: input.job_id,
            input,
            output: None,
            status: JobStatus::Pending,
            exit_code: None,
            diagnostics: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn advance(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        tracing::debug!(job_id = %self.id, from = %self.status, to = %next, "Job transition");
        self.status = next;
        Ok(())
    }

    pub fn age(&self) -> time::Duration {
        OffsetDateTime::now_utc() - self.created_at
    }
}

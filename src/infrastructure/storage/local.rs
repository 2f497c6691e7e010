use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::modules::caption::model::{BlobRef, JobId};

/// Output files always carry this extension; the worker renders mp4.
pub const OUTPUT_EXTENSION: &str = ".mp4";

const RELEASE_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to create {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
    #[error("upload stream interrupted: {0}")]
    Stream(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<io::Error> for StageError {
    fn from(err: io::Error) -> Self {
        StageError::Stream(err.to_string())
    }
}

/// Local-disk storage for job inputs, outputs and per-job workspaces.
///
/// Layout: `<root>/<job id>/` holds everything a job touches, including
/// auxiliary files the worker writes into its working directory.
#[derive(Clone, Debug)]
pub struct BlobStore {
    root: Arc<PathBuf>,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StorageError::Create {
            path: root.clone(),
            source,
        })?;
        let root = std::fs::canonicalize(&root).unwrap_or(root);
        info!("Blob store rooted at {}", root.display());
        Ok(Self {
            root: Arc::new(root),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the job's workspace, without touching the filesystem.
    pub fn workspace_path(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Returns the job's workspace, creating it if absent.
    pub async fn resolve(&self, job_id: &JobId) -> Result<PathBuf, StorageError> {
        let dir = self.workspace_path(job_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| StorageError::Create {
                path: dir.clone(),
                source,
            })?;
        Ok(dir)
    }

    /// Persists `bytes` as the input blob of a freshly allocated job.
    pub async fn stage(&self, bytes: &[u8], extension: &str) -> Result<BlobRef, StorageError> {
        let blob = self.allocate_input(extension).await?;
        let reservation = Reservation::new(self, blob.job_id);
        if let Err(source) = fs::write(&blob.path, bytes).await {
            reservation.abandon().await;
            return Err(StorageError::Write {
                path: blob.path,
                source,
            });
        }
        reservation.keep();
        debug!(job_id = %blob.job_id, size = bytes.len(), "Staged input blob");
        Ok(blob)
    }

    /// Streaming variant of [`BlobStore::stage`]. Stops and releases the
    /// partial workspace as soon as more than `max_bytes` have arrived.
    pub async fn stage_stream<S, E>(
        &self,
        mut stream: S,
        extension: &str,
        max_bytes: u64,
    ) -> Result<BlobRef, StageError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<StageError>,
    {
        let blob = self.allocate_input(extension).await?;
        let reservation = Reservation::new(self, blob.job_id);

        match self.write_stream(&blob, &mut stream, max_bytes).await {
            Ok(total) => {
                reservation.keep();
                debug!(job_id = %blob.job_id, size = total, "Staged input blob");
                Ok(blob)
            }
            Err(e) => {
                reservation.abandon().await;
                Err(e)
            }
        }
    }

    async fn write_stream<S, E>(
        &self,
        blob: &BlobRef,
        stream: &mut S,
        max_bytes: u64,
    ) -> Result<u64, StageError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<StageError>,
    {
        let write_err = |source| StorageError::Write {
            path: blob.path.clone(),
            source,
        };

        let mut file = fs::File::create(&blob.path).await.map_err(write_err)?;
        let mut total: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Into::into)?;
            total += chunk.len() as u64;
            if total > max_bytes {
                return Err(StageError::TooLarge { limit: max_bytes });
            }
            file.write_all(&chunk).await.map_err(write_err)?;
        }

        file.flush().await.map_err(write_err)?;
        Ok(total)
    }

    async fn allocate_input(&self, extension: &str) -> Result<BlobRef, StorageError> {
        let job_id = JobId::new();
        let dir = self.resolve(&job_id).await?;
        let path = dir.join(format!("video-{}{}", job_id, sanitize_extension(extension)));
        Ok(BlobRef::new(job_id, path))
    }

    /// Deterministic output location for a job.
    pub fn output_ref(&self, job_id: &JobId) -> BlobRef {
        let path = self
            .workspace_path(job_id)
            .join(format!("output-{}{}", job_id, OUTPUT_EXTENSION));
        BlobRef::new(*job_id, path)
    }

    /// Best-effort delete. Never fails; a missing file is not worth a warning.
    pub async fn release(&self, blob: &BlobRef) {
        match fs::remove_file(&blob.path).await {
            Ok(()) => debug!(job_id = %blob.job_id, "Released {}", blob.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(job_id = %blob.job_id, "Already gone: {}", blob.path.display())
            }
            Err(e) => warn!(
                job_id = %blob.job_id,
                error = %e,
                "Failed to release {}",
                blob.path.display()
            ),
        }
    }

    /// Best-effort recursive removal of a job's workspace, retried once.
    pub async fn release_workspace(&self, job_id: &JobId) {
        let dir = self.workspace_path(job_id);
        for attempt in 1..=2 {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {
                    debug!(job_id = %job_id, "Workspace removed");
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return,
                Err(e) if attempt == 1 => {
                    debug!(job_id = %job_id, error = %e, "Workspace removal failed, retrying");
                    tokio::time::sleep(RELEASE_RETRY_DELAY).await;
                }
                Err(e) => {
                    warn!(
                        job_id = %job_id,
                        error = %e,
                        "Failed to remove workspace {}",
                        dir.display()
                    );
                }
            }
        }
    }

    /// Blocking counterpart of [`BlobStore::release_workspace`] for contexts
    /// without a runtime.
    pub fn release_workspace_blocking(&self, job_id: &JobId) {
        let dir = self.workspace_path(job_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to remove workspace {}", dir.display()),
        }
    }
}

/// A workspace that is being filled. If the staging future is dropped midway
/// (client went away during upload) the partial workspace is removed.
struct Reservation<'a> {
    store: &'a BlobStore,
    job_id: JobId,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(store: &'a BlobStore, job_id: JobId) -> Self {
        Self {
            store,
            job_id,
            armed: true,
        }
    }

    fn keep(mut self) {
        self.armed = false;
    }

    async fn abandon(mut self) {
        self.armed = false;
        self.store.release_workspace(&self.job_id).await;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(job_id = %self.job_id, "Staging abandoned");
        match Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let job_id = self.job_id;
                handle.spawn(async move { store.release_workspace(&job_id).await });
            }
            Err(_) => self.store.release_workspace_blocking(&self.job_id),
        }
    }
}

/// Keeps only a short alphanumeric extension so client-supplied names never
/// reach the filesystem.
pub fn sanitize_extension(extension: &str) -> String {
    let ext = extension.trim().trim_start_matches('.');
    if ext.is_empty() || ext.len() > 10 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return String::new();
    }
    format!(".{}", ext.to_ascii_lowercase())
}

/// Extension of a client-supplied filename, e.g. `.mp4` for `clip.mp4`.
pub fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(sanitize_extension)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use futures_util::stream;

    use super::*;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().join("uploads")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn stage_writes_bytes_inside_a_fresh_workspace() {
        let (_dir, store) = store();
        let blob = store.stage(b"0123456789", ".mp4").await.unwrap();

        assert_eq!(blob.path.parent().unwrap(), store.workspace_path(&blob.job_id));
        assert_eq!(blob.path.extension().unwrap(), "mp4");
        assert_eq!(fs::read(&blob.path).await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn output_ref_is_deterministic_and_job_scoped() {
        let (_dir, store) = store();
        let id = JobId::new();
        let a = store.output_ref(&id);
        let b = store.output_ref(&id);
        assert_eq!(a, b);
        assert!(a.path.starts_with(store.workspace_path(&id)));
        assert!(a.path.file_name().unwrap().to_str().unwrap().starts_with("output-"));
    }

    #[tokio::test]
    async fn release_is_silent_for_missing_files() {
        let (_dir, store) = store();
        let blob = store.stage(b"x", ".mp4").await.unwrap();
        store.release(&blob).await;
        store.release(&blob).await;
        assert!(!blob.path.exists());
        store.release_workspace(&blob.job_id).await;
        store.release_workspace(&blob.job_id).await;
        assert!(!store.workspace_path(&blob.job_id).exists());
    }

    #[tokio::test]
    async fn oversized_stream_is_rejected_and_leaves_nothing_behind() {
        let (_dir, store) = store();
        let chunks: Vec<Result<Bytes, io::Error>> =
            vec![Ok(Bytes::from_static(b"12345")), Ok(Bytes::from_static(b"67890"))];

        let err = store
            .stage_stream(stream::iter(chunks), ".mp4", 8)
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::TooLarge { limit: 8 }));
        assert_eq!(std::fs::read_dir(store.root()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn interrupted_stream_is_rejected_and_leaves_nothing_behind() {
        let (_dir, store) = store();
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "network drop")),
        ];

        let err = store
            .stage_stream(stream::iter(chunks), ".mp4", 1024)
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::Stream(_)));
        assert_eq!(std::fs::read_dir(store.root()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn stream_at_exact_limit_is_accepted() {
        let (_dir, store) = store();
        let chunks: Vec<Result<Bytes, io::Error>> = vec![Ok(Bytes::from_static(b"12345678"))];
        let blob = store
            .stage_stream(stream::iter(chunks), "mov", 8)
            .await
            .unwrap();
        assert_eq!(fs::read(&blob.path).await.unwrap(), b"12345678");
        assert_eq!(blob.path.extension().unwrap(), "mov");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_stages_never_collide() {
        let (_dir, store) = store();

        let handles: Vec<_> = (0..128)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.stage(format!("{i}").as_bytes(), ".mp4").await })
            })
            .collect();

        let mut ids = HashSet::new();
        let mut paths = HashSet::new();
        for handle in handles {
            let blob = handle.await.unwrap().unwrap();
            assert!(ids.insert(blob.job_id));
            assert!(paths.insert(blob.path.clone()));
            assert!(paths.insert(store.workspace_path(&blob.job_id)));
        }
        assert_eq!(std::fs::read_dir(store.root()).unwrap().count(), 128);
    }

    #[test]
    fn extensions_are_sanitized() {
        assert_eq!(extension_of("clip.mp4"), ".mp4");
        assert_eq!(extension_of("CLIP.MOV"), ".mov");
        assert_eq!(extension_of("noext"), "");
        assert_eq!(sanitize_extension("../../etc"), "");
        assert_eq!(sanitize_extension("mp4;rm"), "");
    }
}

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::Stream;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

use super::dto::DOWNLOAD_FILENAME;
use super::model::JobId;
use super::service::{CleanupGuard, ReadyOutput};
use crate::common::response::ApiError;

/// Response body that owns the job's cleanup guard.
///
/// Whatever ends the transfer (last chunk sent, client gone, I/O error),
/// dropping the body drops the guard, and only then are the job's files
/// released.
pub struct DeliveryStream<S> {
    inner: S,
    job_id: JobId,
    sent: u64,
    finished: bool,
    _cleanup: CleanupGuard,
}

impl<S> DeliveryStream<S> {
    pub fn new(inner: S, cleanup: CleanupGuard) -> Self {
        Self {
            inner,
            job_id: cleanup.job_id(),
            sent: 0,
            finished: false,
            _cleanup: cleanup,
        }
    }
}

impl<S> Stream for DeliveryStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_next(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) => this.sent += chunk.len() as u64,
            Poll::Ready(Some(Err(e))) => {
                error!(job_id = %this.job_id, error = %e, "Error sending file");
            }
            Poll::Ready(None) => {
                this.finished = true;
                info!(job_id = %this.job_id, bytes = this.sent, "File sent successfully");
            }
            Poll::Pending => {}
        }
        polled
    }
}

impl<S> Drop for DeliveryStream<S> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(job_id = %self.job_id, bytes = self.sent, "Transfer ended before completion");
        }
    }
}

/// Streams a ready job's output to the caller as an attachment.
pub async fn download(ready: ReadyOutput) -> Response {
    let (output, cleanup) = ready.into_parts();

    let file = match tokio::fs::File::open(&output.path).await {
        Ok(f) => f,
        Err(e) => {
            error!(job_id = %output.job_id, error = %e, "Failed to open output");
            return ApiError::internal().into_response();
        }
    };
    let length = file.metadata().await.ok().map(|m| m.len());
    let content_type = mime_guess::from_path(&output.path).first_or_octet_stream();

    info!(job_id = %output.job_id, "Sending processed video");
    let body = Body::from_stream(DeliveryStream::new(ReaderStream::new(file), cleanup));

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type.as_ref())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{DOWNLOAD_FILENAME}\""),
        );
    if let Some(len) = length {
        builder = builder.header(header::CONTENT_LENGTH, len);
    }

    builder
        .body(body)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

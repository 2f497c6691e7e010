#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, Response};
use axum::Router;
use tower::ServiceExt;

use captioner::app::create_app;
use captioner::config::settings::AppConfig;
use captioner::infrastructure::storage::local::BlobStore;
use captioner::modules::caption::service::JobCoordinator;
use captioner::state::AppState;
use captioner::workers::runner::{JobRunner, WorkerCommand};

pub const BOUNDARY: &str = "captioner-test-boundary";

pub struct TestApp {
    _dir: tempfile::TempDir,
    pub router: Router,
    pub root: PathBuf,
}

pub struct TestAppBuilder {
    worker_body: String,
    timeout: Duration,
    max_upload_bytes: u64,
}

impl TestAppBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_upload_bytes(mut self, max: u64) -> Self {
        self.max_upload_bytes = max;
        self
    }

    pub fn build(self) -> TestApp {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("worker.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{}", self.worker_body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let root = dir.path().join("uploads");
        let config = AppConfig {
            max_upload_bytes: self.max_upload_bytes,
            worker_command: format!("sh {}", script.display()),
            job_timeout_secs: self.timeout.as_secs().max(1),
            storage_root: root.to_string_lossy().into_owned(),
            ..AppConfig::default()
        };

        let store = BlobStore::new(config.storage_root()).unwrap();
        let worker = WorkerCommand::parse(&config.worker_command).unwrap();
        let coordinator = JobCoordinator::new(store.clone(), JobRunner::new(), worker, self.timeout);
        let router = create_app(AppState::new(config, coordinator));

        TestApp {
            _dir: dir,
            router,
            root: store.root().to_path_buf(),
        }
    }
}

impl TestApp {
    /// A server whose worker runs the given shell script body.
    pub fn with_worker(body: &str) -> TestAppBuilder {
        TestAppBuilder {
            worker_body: body.to_string(),
            timeout: Duration::from_secs(10),
            max_upload_bytes: 1024 * 1024,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn upload(&self, file_name: &str, content_type: &str, data: &[u8]) -> Response<Body> {
        self.send(upload_request("/upload", "video", file_name, content_type, data))
            .await
    }

    pub fn entries(&self) -> Vec<PathBuf> {
        list(&self.root)
    }

    /// Cleanup runs on a background task once the response is dropped.
    pub async fn wait_until_empty(&self) {
        for _ in 0..100 {
            if self.entries().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("files left behind: {:?}", self.entries());
    }
}

fn list(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect()
}

pub fn multipart_body(field: &str, file_name: Option<&str>, content_type: &str, data: &[u8]) -> Vec<u8> {
    let disposition = match file_name {
        Some(name) => format!("form-data; name=\"{field}\"; filename=\"{name}\""),
        None => format!("form-data; name=\"{field}\""),
    };
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: {disposition}\r\nContent-Type: {content_type}\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn multipart_request(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn upload_request(
    uri: &str,
    field: &str,
    file_name: &str,
    content_type: &str,
    data: &[u8],
) -> Request<Body> {
    multipart_request(uri, multipart_body(field, Some(file_name), content_type, data))
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

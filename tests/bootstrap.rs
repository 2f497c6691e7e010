#![cfg(unix)]
//! Server wiring: configuration through `AppState::from_config` and the
//! middleware stack built by `create_app`.

mod common;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use tower::ServiceExt;

use captioner::app::{create_app, with_layers};
use captioner::config::settings::AppConfig;
use captioner::routes::configure_routes;
use captioner::state::AppState;
use common::{body_bytes, body_json, multipart_request, upload_request};

/// A scratch directory under the current directory, plus its path relative
/// to it, so worker commands can be written the way an operator would.
fn local_dir() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir_in(".").unwrap();
    let cwd = std::env::current_dir().unwrap();
    let relative = dir.path().strip_prefix(&cwd).unwrap_or(dir.path()).to_path_buf();
    assert!(relative.is_relative());
    (dir, relative)
}

fn write_worker(dir: &Path, body: &str) {
    let script = dir.join("worker.sh");
    std::fs::write(&script, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn config(dir: &Path, worker_command: String) -> AppConfig {
    AppConfig {
        worker_command,
        storage_root: dir.join("uploads").to_string_lossy().into_owned(),
        ..AppConfig::default()
    }
}

async fn wait_until_empty(root: &Path) {
    for _ in 0..100 {
        if std::fs::read_dir(root).unwrap().next().is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("files left behind in {}", root.display());
}

#[tokio::test]
async fn relative_worker_script_runs_inside_job_workspaces() {
    let (dir, relative) = local_dir();
    write_worker(dir.path(), "printf OK > \"$2\"\n");
    let worker_command = format!("sh {}", relative.join("worker.sh").display());

    let state = AppState::from_config(config(dir.path(), worker_command)).unwrap();
    let root = state.coordinator.store().root().to_path_buf();
    let response = create_app(state)
        .oneshot(upload_request("/upload", "video", "clip.mp4", "video/mp4", b"0123456789"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"OK");
    wait_until_empty(&root).await;
}

#[tokio::test]
async fn relative_worker_program_runs_inside_job_workspaces() {
    let (dir, relative) = local_dir();
    write_worker(dir.path(), "cat \"$1\" > \"$2\"\n");
    let worker_command = format!("./{}", relative.join("worker.sh").display());

    let state = AppState::from_config(config(dir.path(), worker_command)).unwrap();
    let response = create_app(state)
        .oneshot(upload_request("/upload", "video", "clip.mp4", "video/mp4", b"payload"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"payload");
}

#[tokio::test]
async fn startup_refuses_a_missing_worker_script() {
    let (dir, relative) = local_dir();
    let worker_command = format!("sh {}", relative.join("process_video.py").display());

    assert!(AppState::from_config(config(dir.path(), worker_command)).is_err());
}

async fn stage_then_panic(State(state): State<AppState>) -> &'static str {
    let _job = state.coordinator.execute(b"data", ".mp4").await.unwrap();
    panic!("handler failed after staging");
}

#[tokio::test]
async fn panicking_handler_returns_internal_error_and_releases_the_job() {
    let dir = tempfile::TempDir::new().unwrap();
    write_worker(dir.path(), "printf OK > \"$2\"\n");
    let worker_command = format!("sh {}", dir.path().join("worker.sh").display());

    let state = AppState::from_config(config(dir.path(), worker_command)).unwrap();
    let root = state.coordinator.store().root().to_path_buf();
    let app = with_layers(configure_routes(&state).route("/explode", post(stage_then_panic)))
        .with_state(state);

    let response = app
        .oneshot(multipart_request("/explode", Vec::new()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let raw = body_json(response).await;
    assert_eq!(raw["code"], "INTERNAL_ERROR");
    assert_eq!(raw["error"], "An internal error occurred");
    wait_until_empty(&root).await;
}

#![cfg(unix)]

use std::{
    num::NonZeroU32,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;
use webshot::{
    application::{render::ProcessRenderer, snapshot::SnapshotService},
    domain::snapshot::ViewportLimits,
    infra::{
        http::{HttpState, build_router},
        storage::ArtifactStore,
    },
};

const EXAMPLE_SHARD: &str = "c9";
const EXAMPLE_ARTIFACT: &str = "c9/c984d06aafbecf6bc55569f964148ea3.png";

/// Shell renderer that records each invocation in `calls.log` before running `body`.
fn fake_phantomjs(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-phantomjs");
    let calls = dir.join("calls.log");
    let script = format!(
        "#!/bin/sh\necho run >> \"{}\"\n{body}\n",
        calls.display()
    );
    std::fs::write(&path, script).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("set perms");
    path
}

fn invocations(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("calls.log"))
        .map(|log| log.lines().count())
        .unwrap_or(0)
}

fn app(dir: &Path, executable: PathBuf) -> Router {
    let renderer = ProcessRenderer::new(
        executable,
        PathBuf::from("rasterize.js"),
        Duration::from_secs(10),
    );
    let store = Arc::new(ArtifactStore::new(dir.join("data")).expect("store"));
    let limits = ViewportLimits {
        default_width: NonZeroU32::new(1024).expect("non-zero"),
        default_height: NonZeroU32::new(768).expect("non-zero"),
        default_delay_seconds: 1,
        max_width: NonZeroU32::new(4096).expect("non-zero"),
        max_height: NonZeroU32::new(8192).expect("non-zero"),
        max_delay_seconds: 30,
    };
    let service = Arc::new(SnapshotService::new(store, Arc::new(renderer), limits));
    build_router(HttpState::new(service), None)
}

async fn fetch(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec();
    (status, body)
}

fn shard_entries(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir.join("data").join(EXAMPLE_SHARD))
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

async fn assert_failure_is_never_cached(body: &str) {
    let dir = TempDir::new().expect("temp dir");
    let app = app(dir.path(), fake_phantomjs(dir.path(), body));

    for attempt in 1..=2 {
        let (status, body) = fetch(&app, "/?url=https://example.com").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY, "attempt {attempt}");
        assert!(
            String::from_utf8_lossy(&body).starts_with("render error:"),
            "attempt {attempt}"
        );
        assert_eq!(invocations(dir.path()), attempt, "each attempt must render");
    }

    assert!(!dir.path().join("data").join(EXAMPLE_ARTIFACT).exists());
    assert!(shard_entries(dir.path()).is_empty(), "{:?}", shard_entries(dir.path()));
}

#[tokio::test]
async fn empty_output_is_not_served_on_retry() {
    assert_failure_is_never_cached(": > \"$3\"").await;
}

#[tokio::test]
async fn partial_output_from_failed_exit_is_not_served_on_retry() {
    assert_failure_is_never_cached("printf 'partial' > \"$3\"\nexit 3").await;
}

#[tokio::test]
async fn successful_render_is_published_at_artifact_path() {
    let dir = TempDir::new().expect("temp dir");
    let app = app(dir.path(), fake_phantomjs(dir.path(), "printf 'png-bytes' > \"$3\""));

    let (status, body) = fetch(&app, "/?url=https://example.com").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"png-bytes");
    assert_eq!(
        shard_entries(dir.path()),
        vec!["c984d06aafbecf6bc55569f964148ea3.png".to_string()]
    );

    let (status, body) = fetch(&app, "/?url=https://example.com").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"png-bytes");
    assert_eq!(invocations(dir.path()), 1);
}

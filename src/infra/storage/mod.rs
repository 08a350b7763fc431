//! Filesystem-backed snapshot artifacts.
//!
//! Artifacts live at `<root>/<shard>/<digest>.png`. Nothing is cached in
//! memory between requests and nothing is ever evicted; the filesystem is the
//! single source of truth.

mod range;

use std::{
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};

use axum::{
    body::Body,
    http::{
        HeaderValue, StatusCode,
        header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE},
    },
    response::Response,
};
use thiserror::Error;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tracing::debug;

use crate::domain::snapshot::CacheKey;

pub use range::{ByteRange, RangeSelection, select as select_range};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found at {}", .0.display())]
    NotFound(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open storage rooted at `root`, creating the directory if necessary.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the artifact for `key`, creating its shard directory.
    ///
    /// Never fails: if the shard cannot be created the error resurfaces when
    /// the renderer tries to write into it.
    pub async fn path_for(&self, key: &CacheKey) -> PathBuf {
        let shard = self.root.join(key.shard());
        if let Err(err) = fs::create_dir_all(&shard).await {
            debug!(
                target = "infra::storage",
                op = "storage::path_for",
                result = "shard_create_failed",
                shard = %shard.display(),
                error = %err,
                "Could not create shard directory"
            );
        }
        self.root.join(key.relative_path())
    }

    /// True when a regular file can be stat'ed at `path`.
    ///
    /// Stat failures of any kind, permission errors included, read as a miss
    /// so the caller regenerates instead of failing the request.
    pub async fn exists(&self, path: &Path) -> bool {
        matches!(fs::metadata(path).await, Ok(meta) if meta.is_file())
    }

    /// Build a response streaming the artifact, honouring a `Range` header.
    pub async fn serve(&self, path: &Path, range: Option<&str>) -> Result<Response, ArtifactError> {
        let mut file = fs::File::open(path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ArtifactError::NotFound(path.to_path_buf())
            } else {
                ArtifactError::Io(err)
            }
        })?;
        let total = file.metadata().await?.len();

        let (status, body, content_range) = match select_range(range, total) {
            RangeSelection::Full => {
                let mut bytes = Vec::with_capacity(total as usize);
                file.read_to_end(&mut bytes).await?;
                (StatusCode::OK, bytes, None)
            }
            RangeSelection::Partial(span) => {
                file.seek(SeekFrom::Start(span.start)).await?;
                let mut bytes = vec![0; span.len() as usize];
                file.read_exact(&mut bytes).await?;
                (
                    StatusCode::PARTIAL_CONTENT,
                    bytes,
                    Some(span.content_range(total)),
                )
            }
            RangeSelection::Unsatisfiable => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                Vec::new(),
                Some(format!("bytes */{total}")),
            ),
        };

        let length = body.len();
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if status != StatusCode::RANGE_NOT_SATISFIABLE {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
                headers.insert(CONTENT_TYPE, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&length.to_string()) {
            headers.insert(CONTENT_LENGTH, value);
        }
        if let Some(value) = content_range.and_then(|v| HeaderValue::from_str(&v).ok()) {
            headers.insert(CONTENT_RANGE, value);
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tempfile::TempDir;

    async fn body_bytes(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes()
            .to_vec()
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn path_for_uses_sharded_layout_and_creates_shard() {
        let dir = TempDir::new().expect("temp dir");
        let store = ArtifactStore::new(dir.path().join("data")).expect("store");
        let key = CacheKey::derive("https://example.com");

        let path = store.path_for(&key).await;
        assert_eq!(
            path,
            dir.path()
                .join("data")
                .join("c9")
                .join("c984d06aafbecf6bc55569f964148ea3.png")
        );
        assert!(path.parent().expect("shard").is_dir());

        // Idempotent.
        assert_eq!(store.path_for(&key).await, path);
    }

    #[tokio::test]
    async fn exists_only_for_regular_files() {
        let dir = TempDir::new().expect("temp dir");
        let store = ArtifactStore::new(dir.path().to_path_buf()).expect("store");
        let key = CacheKey::derive("https://example.com");
        let path = store.path_for(&key).await;

        assert!(!store.exists(&path).await);
        assert!(!store.exists(path.parent().expect("shard")).await);

        std::fs::write(&path, b"png").expect("write");
        assert!(store.exists(&path).await);
    }

    #[tokio::test]
    async fn serves_whole_file() {
        let dir = TempDir::new().expect("temp dir");
        let store = ArtifactStore::new(dir.path().to_path_buf()).expect("store");
        let path = dir.path().join("shot.png");
        std::fs::write(&path, sample(1000)).expect("write");

        let response = store.serve(&path, None).await.expect("served");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "image/png");
        assert_eq!(response.headers()[CONTENT_LENGTH], "1000");
        assert_eq!(response.headers()[ACCEPT_RANGES], "bytes");
        assert_eq!(body_bytes(response).await, sample(1000));
    }

    #[tokio::test]
    async fn serves_requested_range() {
        let dir = TempDir::new().expect("temp dir");
        let store = ArtifactStore::new(dir.path().to_path_buf()).expect("store");
        let path = dir.path().join("shot.png");
        let data = sample(1000);
        std::fs::write(&path, &data).expect("write");

        let response = store
            .serve(&path, Some("bytes=0-99"))
            .await
            .expect("served");
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes 0-99/1000");
        assert_eq!(response.headers()[CONTENT_LENGTH], "100");
        assert_eq!(body_bytes(response).await, data[..100].to_vec());

        let response = store
            .serve(&path, Some("bytes=-10"))
            .await
            .expect("served");
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(body_bytes(response).await, data[990..].to_vec());
    }

    #[tokio::test]
    async fn unsatisfiable_range_reports_length() {
        let dir = TempDir::new().expect("temp dir");
        let store = ArtifactStore::new(dir.path().to_path_buf()).expect("store");
        let path = dir.path().join("shot.png");
        std::fs::write(&path, sample(10)).expect("write");

        let response = store
            .serve(&path, Some("bytes=50-"))
            .await
            .expect("served");
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes */10");
    }

    #[tokio::test]
    async fn serving_missing_artifact_is_an_error() {
        let dir = TempDir::new().expect("temp dir");
        let store = ArtifactStore::new(dir.path().to_path_buf()).expect("store");

        let err = store
            .serve(&dir.path().join("missing.png"), None)
            .await
            .expect_err("missing");
        assert!(matches!(err, ArtifactError::NotFound(_)));
    }
}

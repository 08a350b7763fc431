//! Cache-or-render decision for snapshot requests.

use std::{path::PathBuf, sync::Arc};

use metrics::counter;
use thiserror::Error;
use tracing::debug;

use crate::{
    application::render::{
        Claim, InFlightRenders, RenderFailure, RenderJob, RenderOutcome, Renderer, await_outcome,
    },
    config::SnapshotSettings,
    domain::{
        error::DomainError,
        snapshot::{CacheKey, RenderRequest, SnapshotParams, ViewportLimits},
    },
    infra::storage::ArtifactStore,
};

const METRIC_CACHE_HIT_TOTAL: &str = "webshot_cache_hit_total";
const METRIC_CACHE_MISS_TOTAL: &str = "webshot_cache_miss_total";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Render(#[from] RenderFailure),
}

/// A snapshot ready to be served from disk.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub path: PathBuf,
    /// Whether this request caused (or joined) a fresh render.
    pub rendered: bool,
}

impl From<&SnapshotSettings> for ViewportLimits {
    fn from(settings: &SnapshotSettings) -> Self {
        Self {
            default_width: settings.width,
            default_height: settings.height,
            default_delay_seconds: settings.delay_seconds,
            max_width: settings.max_width,
            max_height: settings.max_height,
            max_delay_seconds: settings.max_delay_seconds,
        }
    }
}

pub struct SnapshotService {
    store: Arc<ArtifactStore>,
    renderer: Arc<dyn Renderer>,
    inflight: InFlightRenders,
    limits: ViewportLimits,
}

impl SnapshotService {
    pub fn new(
        store: Arc<ArtifactStore>,
        renderer: Arc<dyn Renderer>,
        limits: ViewportLimits,
    ) -> Self {
        Self {
            store,
            renderer,
            inflight: InFlightRenders::new(),
            limits,
        }
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Make sure a current artifact exists for `request`, rendering it when the
    /// cache has none or a refresh is forced.
    pub async fn resolve(&self, request: RenderRequest) -> Result<Snapshot, SnapshotError> {
        let params = SnapshotParams::resolve(&request, &self.limits)?;
        let key = CacheKey::derive(&request.url);
        let path = self.store.path_for(&key).await;

        if !request.force_refresh && self.store.exists(&path).await {
            counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
            debug!(
                target = "application::snapshot",
                op = "snapshot::resolve",
                result = "cache_hit",
                url = %request.url,
                key = %key,
                "Serving cached snapshot"
            );
            return Ok(Snapshot {
                path,
                rendered: false,
            });
        }

        counter!(METRIC_CACHE_MISS_TOTAL).increment(1);
        let job = RenderJob {
            url: request.url,
            output: path.clone(),
            params,
        };
        self.regenerate(&key, job, request.force_refresh).await?;

        Ok(Snapshot {
            path,
            rendered: true,
        })
    }

    async fn regenerate(
        &self,
        key: &CacheKey,
        job: RenderJob,
        force_refresh: bool,
    ) -> RenderOutcome {
        match self.inflight.claim(key) {
            Claim::Leader(lease) => {
                // A render for this key may have finished between the cache
                // check and the claim.
                if !force_refresh && self.store.exists(&job.output).await {
                    let outcome = Ok(job.output.clone());
                    lease.complete(&outcome);
                    return outcome;
                }
                // The render runs on its own task so a client hanging up does
                // not cancel work other requesters are waiting on.
                let renderer = Arc::clone(&self.renderer);
                let task = tokio::spawn(async move {
                    let outcome = renderer.render(&job).await;
                    lease.complete(&outcome);
                    outcome
                });
                task.await
                    .unwrap_or_else(|err| Err(RenderFailure::Aborted(err.to_string())))
            }
            Claim::Follower(receiver) => {
                debug!(
                    target = "application::snapshot",
                    op = "snapshot::regenerate",
                    result = "joined_in_flight",
                    key = %key,
                    "Waiting on in-flight render"
                );
                await_outcome(receiver).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        num::NonZeroU32,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::domain::snapshot::RawRenderRequest;

    #[derive(Default)]
    struct RecordingRenderer {
        calls: AtomicUsize,
        jobs: Mutex<Vec<RenderJob>>,
        fail: bool,
    }

    #[async_trait]
    impl Renderer for RecordingRenderer {
        async fn render(&self, job: &RenderJob) -> RenderOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.jobs.lock().expect("jobs lock").push(job.clone());
            tokio::time::sleep(Duration::from_millis(100)).await;
            if self.fail {
                return Err(RenderFailure::Exited { code: Some(1) });
            }
            tokio::fs::write(&job.output, format!("render #{call}"))
                .await
                .map_err(|err| RenderFailure::Wait(err.to_string()))?;
            Ok(job.output.clone())
        }
    }

    fn limits() -> ViewportLimits {
        ViewportLimits {
            default_width: NonZeroU32::new(1024).unwrap(),
            default_height: NonZeroU32::new(768).unwrap(),
            default_delay_seconds: 1,
            max_width: NonZeroU32::new(4096).unwrap(),
            max_height: NonZeroU32::new(8192).unwrap(),
            max_delay_seconds: 30,
        }
    }

    fn service(dir: &TempDir, renderer: Arc<RecordingRenderer>) -> SnapshotService {
        let store = Arc::new(ArtifactStore::new(dir.path().join("data")).expect("store"));
        SnapshotService::new(store, renderer, limits())
    }

    fn request(url: &str, flush: bool) -> RenderRequest {
        RenderRequest::parse(RawRenderRequest {
            url: Some(url),
            flush: flush.then_some("1"),
            ..Default::default()
        })
        .expect("valid request")
    }

    #[tokio::test]
    async fn miss_renders_with_defaults_and_hit_reuses() {
        let dir = TempDir::new().expect("temp dir");
        let renderer = Arc::new(RecordingRenderer::default());
        let service = service(&dir, renderer.clone());

        let first = service
            .resolve(request("https://example.com", false))
            .await
            .expect("rendered");
        assert!(first.rendered);
        assert_eq!(
            first.path,
            dir.path()
                .join("data/c9/c984d06aafbecf6bc55569f964148ea3.png")
        );

        {
            let jobs = renderer.jobs.lock().expect("jobs lock");
            assert_eq!(jobs.len(), 1);
            assert_eq!(jobs[0].url, "https://example.com");
            assert_eq!(jobs[0].output, first.path);
            assert_eq!(
                jobs[0].params,
                SnapshotParams {
                    width: 1024,
                    height: 768,
                    delay_seconds: 1,
                }
            );
        }

        let second = service
            .resolve(request("https://example.com", false))
            .await
            .expect("cached");
        assert!(!second.rendered);
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forced_refresh_rerenders_existing_artifact() {
        let dir = TempDir::new().expect("temp dir");
        let renderer = Arc::new(RecordingRenderer::default());
        let service = service(&dir, renderer.clone());

        let first = service
            .resolve(request("https://example.com", false))
            .await
            .expect("rendered");
        let refreshed = service
            .resolve(request("https://example.com", true))
            .await
            .expect("re-rendered");

        assert!(refreshed.rendered);
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            std::fs::read_to_string(&first.path).expect("artifact"),
            "render #2"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_render_once() {
        let dir = TempDir::new().expect("temp dir");
        let renderer = Arc::new(RecordingRenderer::default());
        let service = Arc::new(service(&dir, renderer.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&service);
            handles.push(tokio::spawn(async move {
                service.resolve(request("https://example.com", false)).await
            }));
        }

        for handle in handles {
            let snapshot = handle.await.expect("join").expect("resolved");
            assert_eq!(
                std::fs::read_to_string(&snapshot.path).expect("artifact"),
                "render #1"
            );
        }
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_urls_render_independently() {
        let dir = TempDir::new().expect("temp dir");
        let renderer = Arc::new(RecordingRenderer::default());
        let service = Arc::new(service(&dir, renderer.clone()));

        let a = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.resolve(request("https://a.example", false)).await })
        };
        let b = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.resolve(request("https://b.example", false)).await })
        };

        let a = a.await.expect("join").expect("a");
        let b = b.await.expect("join").expect("b");
        assert_ne!(a.path, b.path);
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn leader_skips_render_when_artifact_appeared_after_miss() {
        let dir = TempDir::new().expect("temp dir");
        let renderer = Arc::new(RecordingRenderer::default());
        let service = service(&dir, renderer.clone());

        let key = CacheKey::derive("https://example.com");
        let path = service.store.path_for(&key).await;
        let job = RenderJob {
            url: "https://example.com".to_string(),
            output: path.clone(),
            params: SnapshotParams {
                width: 1024,
                height: 768,
                delay_seconds: 1,
            },
        };

        // Another leader finished between this request's miss and its claim.
        std::fs::write(&path, b"fresh").expect("write artifact");

        let outcome = service.regenerate(&key, job.clone(), false).await;
        assert_eq!(outcome, Ok(path.clone()));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
        assert!(service.inflight.is_empty());

        let outcome = service.regenerate(&key, job, true).await;
        assert_eq!(outcome, Ok(path));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn render_failure_is_propagated() {
        let dir = TempDir::new().expect("temp dir");
        let renderer = Arc::new(RecordingRenderer {
            fail: true,
            ..Default::default()
        });
        let service = service(&dir, renderer.clone());

        let err = service
            .resolve(request("https://example.com", false))
            .await
            .expect_err("render fails");
        assert!(matches!(
            err,
            SnapshotError::Render(RenderFailure::Exited { code: Some(1) })
        ));
    }

    #[tokio::test]
    async fn out_of_bounds_params_never_reach_renderer() {
        let dir = TempDir::new().expect("temp dir");
        let renderer = Arc::new(RecordingRenderer::default());
        let service = service(&dir, renderer.clone());

        let request = RenderRequest::parse(RawRenderRequest {
            url: Some("https://example.com"),
            width: Some("99999"),
            ..Default::default()
        })
        .expect("parses");

        let err = service.resolve(request).await.expect_err("too wide");
        assert!(matches!(err, SnapshotError::Invalid(_)));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
    }
}

//! HTTP surface: a single path-insensitive snapshot endpoint.

mod middleware;
mod snapshot;

use std::sync::Arc;

use axum::{Router, http::HeaderValue, middleware as axum_middleware};

use crate::application::snapshot::SnapshotService;

use self::middleware::{log_responses, set_request_context, set_server_banner};

#[derive(Clone)]
pub struct HttpState {
    pub snapshots: Arc<SnapshotService>,
}

impl HttpState {
    pub fn new(snapshots: Arc<SnapshotService>) -> Self {
        Self { snapshots }
    }
}

/// Every path and method reaches the snapshot handler; `banner`, when set,
/// becomes the `Server` header of each response.
pub fn build_router(state: HttpState, banner: Option<&str>) -> Router {
    let banner = banner.and_then(|value| HeaderValue::from_str(value).ok());

    Router::new()
        .fallback(snapshot::snapshot)
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
        .layer(axum_middleware::from_fn_with_state(banner, set_server_banner))
}

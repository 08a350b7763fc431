use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header::RANGE},
    response::{IntoResponse, Response},
};

use crate::{
    application::{
        error::HttpError,
        render::RenderFailure,
        snapshot::SnapshotError,
    },
    domain::{
        error::DomainError,
        snapshot::{RawRenderRequest, RenderRequest},
    },
    presentation::views::{PromptTemplate, render_template_response},
};

use super::HttpState;

const SOURCE: &str = "infra::http::snapshot";

#[derive(Debug, Default)]
struct SnapshotQuery {
    url: Option<String>,
    width: Option<String>,
    height: Option<String>,
    delay: Option<String>,
    flush: Option<String>,
}

impl SnapshotQuery {
    /// Collect known parameters; the first occurrence of a repeated key wins.
    fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut query = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_str() {
                "url" => &mut query.url,
                "width" => &mut query.width,
                "height" => &mut query.height,
                "delay" => &mut query.delay,
                "flush" => &mut query.flush,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value);
            }
        }
        query
    }

    fn as_raw(&self) -> RawRenderRequest<'_> {
        RawRenderRequest {
            url: self.url.as_deref(),
            width: self.width.as_deref(),
            height: self.height.as_deref(),
            delay: self.delay.as_deref(),
            flush: self.flush.as_deref(),
        }
    }
}

pub(super) async fn snapshot(
    State(state): State<HttpState>,
    Query(pairs): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Response {
    let query = SnapshotQuery::from_pairs(pairs);
    let mut request = match RenderRequest::parse(query.as_raw()) {
        Ok(request) => request,
        Err(DomainError::InvalidUrl) => {
            let url = query.url.as_deref().unwrap_or_default();
            return render_template_response(PromptTemplate { url }, StatusCode::OK);
        }
        Err(err) => return invalid_request(&err),
    };

    let range = headers.get(RANGE).and_then(|value| value.to_str().ok());
    if range.is_some() {
        // Partial fetches only ever read the current artifact.
        request.force_refresh = false;
    }

    let snapshot = match state.snapshots.resolve(request).await {
        Ok(snapshot) => snapshot,
        Err(SnapshotError::Invalid(err)) => return invalid_request(&err),
        Err(SnapshotError::Render(failure)) => return render_failed(&failure),
    };

    match state.snapshots.store().serve(&snapshot.path, range).await {
        Ok(response) => response,
        Err(err) => HttpError::from_error(
            SOURCE,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Snapshot unavailable",
            &err,
        )
        .into_response(),
    }
}

fn invalid_request(err: &DomainError) -> Response {
    HttpError::from_error(SOURCE, StatusCode::BAD_REQUEST, err.to_string(), err).into_response()
}

fn render_failed(failure: &RenderFailure) -> Response {
    let status = match failure {
        RenderFailure::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    HttpError::from_error(SOURCE, status, format!("render error: {failure}"), failure)
        .into_response()
}

//! Snapshot requests, viewport parameters and cache keys.
//!
//! A snapshot is identified only by the URL it was taken from. Viewport and
//! delay parameters shape the rendered image but never the key, so asking for
//! the same URL at a different size overwrites the single cached artifact.

use std::{fmt, num::NonZeroU32, path::PathBuf};

use super::error::DomainError;

/// File extension of every artifact the renderer produces.
pub const ARTIFACT_EXTENSION: &str = "png";

const SHARD_LEN: usize = 2;

/// Returns true when `url` matches `^https?://.*$`.
///
/// `.` does not match a line break, so a URL carrying `\n` is rejected just as
/// an unknown scheme is.
pub fn is_snapshot_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    matches!(rest, Some(rest) if !rest.contains('\n'))
}

/// A validated request for a page snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    pub url: String,
    pub width: Option<NonZeroU32>,
    pub height: Option<NonZeroU32>,
    pub delay_seconds: Option<u32>,
    pub force_refresh: bool,
}

/// Raw, unparsed request fields as they arrive from the query string.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawRenderRequest<'a> {
    pub url: Option<&'a str>,
    pub width: Option<&'a str>,
    pub height: Option<&'a str>,
    pub delay: Option<&'a str>,
    pub flush: Option<&'a str>,
}

impl RenderRequest {
    /// Validate raw request fields.
    ///
    /// The URL is checked first; a bad URL yields [`DomainError::InvalidUrl`]
    /// regardless of the other fields. Empty numeric fields count as unset.
    pub fn parse(raw: RawRenderRequest<'_>) -> Result<Self, DomainError> {
        let url = raw.url.unwrap_or_default();
        if !is_snapshot_url(url) {
            return Err(DomainError::InvalidUrl);
        }

        Ok(Self {
            url: url.to_string(),
            width: parse_dimension(raw.width, "width")?,
            height: parse_dimension(raw.height, "height")?,
            delay_seconds: parse_delay(raw.delay)?,
            force_refresh: parse_flush(raw.flush),
        })
    }
}

/// Values are taken verbatim; surrounding whitespace makes a number invalid.
fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.filter(|value| !value.is_empty())
}

fn parse_dimension(
    raw: Option<&str>,
    field: &'static str,
) -> Result<Option<NonZeroU32>, DomainError> {
    let Some(value) = non_empty(raw) else {
        return Ok(None);
    };
    value
        .parse::<NonZeroU32>()
        .map(Some)
        .map_err(|_| DomainError::validation(field, format!("`{value}` is not a positive integer")))
}

fn parse_delay(raw: Option<&str>) -> Result<Option<u32>, DomainError> {
    let Some(value) = non_empty(raw) else {
        return Ok(None);
    };
    value.parse::<u32>().map(Some).map_err(|_| {
        DomainError::validation("delay", format!("`{value}` is not a non-negative integer"))
    })
}

/// `flush` forces regeneration only when it parses to exactly 1.
fn parse_flush(raw: Option<&str>) -> bool {
    non_empty(raw)
        .and_then(|value| value.parse::<i64>().ok())
        .is_some_and(|value| value == 1)
}

/// Process-wide defaults and upper bounds for viewport parameters.
#[derive(Debug, Clone, Copy)]
pub struct ViewportLimits {
    pub default_width: NonZeroU32,
    pub default_height: NonZeroU32,
    pub default_delay_seconds: u32,
    pub max_width: NonZeroU32,
    pub max_height: NonZeroU32,
    pub max_delay_seconds: u32,
}

/// Viewport parameters handed to the renderer, with every default applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotParams {
    pub width: u32,
    pub height: u32,
    pub delay_seconds: u32,
}

impl SnapshotParams {
    pub fn resolve(request: &RenderRequest, limits: &ViewportLimits) -> Result<Self, DomainError> {
        let width = request.width.unwrap_or(limits.default_width);
        if width > limits.max_width {
            return Err(DomainError::validation(
                "width",
                format!("{width} exceeds the maximum of {}", limits.max_width),
            ));
        }

        let height = request.height.unwrap_or(limits.default_height);
        if height > limits.max_height {
            return Err(DomainError::validation(
                "height",
                format!("{height} exceeds the maximum of {}", limits.max_height),
            ));
        }

        let delay_seconds = request
            .delay_seconds
            .unwrap_or(limits.default_delay_seconds);
        if delay_seconds > limits.max_delay_seconds {
            return Err(DomainError::validation(
                "delay",
                format!(
                    "{delay_seconds} exceeds the maximum of {}",
                    limits.max_delay_seconds
                ),
            ));
        }

        Ok(Self {
            width: width.get(),
            height: height.get(),
            delay_seconds,
        })
    }
}

/// Stable, filesystem-safe identifier of a cached snapshot.
///
/// The digest covers the raw URL bytes exactly as received: no trimming,
/// case-folding or query normalisation takes place.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    digest: String,
}

impl CacheKey {
    pub fn derive(url: &str) -> Self {
        let digest = md5::compute(url.as_bytes());
        Self {
            digest: hex::encode(digest.0),
        }
    }

    /// Full lowercase hex digest.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Leading digest characters used as the shard directory.
    pub fn shard(&self) -> &str {
        &self.digest[..SHARD_LEN]
    }

    pub fn file_name(&self) -> String {
        format!("{}.{ARTIFACT_EXTENSION}", self.digest)
    }

    /// Artifact location relative to the storage root: `<shard>/<digest>.png`.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.shard()).join(self.file_name())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest)
    }
}

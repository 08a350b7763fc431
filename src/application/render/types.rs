use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::snapshot::SnapshotParams;

/// Everything the renderer needs to produce one artifact.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub url: String,
    pub output: PathBuf,
    pub params: SnapshotParams,
}

/// Why a render did not produce a usable artifact.
///
/// Variants carry rendered strings rather than `io::Error` so a single outcome
/// can be handed to every requester waiting on the same key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderFailure {
    #[error("failed to start renderer: {0}")]
    Spawn(String),
    #[error("failed waiting for renderer: {0}")]
    Wait(String),
    #[error("renderer exited unsuccessfully ({})", describe_exit(.code))]
    Exited { code: Option<i32> },
    #[error("renderer produced no file at {}", .path.display())]
    MissingOutput { path: PathBuf },
    #[error("renderer produced an empty file at {}", .path.display())]
    EmptyOutput { path: PathBuf },
    #[error("renderer timed out after {0:?}")]
    TimedOut(Duration),
    #[error("failed to publish rendered artifact: {0}")]
    Publish(String),
    #[error("render aborted: {0}")]
    Aborted(String),
}

impl RenderFailure {
    /// Short label used for metrics and structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            RenderFailure::Spawn(_) => "spawn",
            RenderFailure::Wait(_) => "wait",
            RenderFailure::Exited { .. } => "exit_status",
            RenderFailure::MissingOutput { .. } => "missing_output",
            RenderFailure::EmptyOutput { .. } => "empty_output",
            RenderFailure::TimedOut(_) => "timeout",
            RenderFailure::Publish(_) => "publish",
            RenderFailure::Aborted(_) => "aborted",
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Path of the freshly written artifact, or the reason there is none.
pub type RenderOutcome = Result<PathBuf, RenderFailure>;

/// Produces a page image at `job.output`.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, job: &RenderJob) -> RenderOutcome;
}

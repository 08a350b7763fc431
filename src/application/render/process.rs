use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio::{fs, process::Command, time::timeout};
use tracing::debug;
use uuid::Uuid;

use crate::config::RenderSettings;

use super::types::{RenderFailure, RenderJob, RenderOutcome, Renderer};

const METRIC_RENDER_TOTAL: &str = "webshot_render_total";
const METRIC_RENDER_FAILURE_TOTAL: &str = "webshot_render_failure_total";
const METRIC_RENDER_MS: &str = "webshot_render_ms";

/// Runs an external headless browser (PhantomJS and friends) once per render.
///
/// The child is invoked as
/// `<executable> <script> <url> <output> <delay> <width> <height>` with stdin
/// closed and stdout/stderr inherited from the service. `<output>` is a
/// staging file next to the artifact; it is renamed onto the artifact path
/// only once the render has been verified, and removed otherwise.
#[derive(Debug, Clone)]
pub struct ProcessRenderer {
    executable: PathBuf,
    script: PathBuf,
    timeout: Duration,
    envs: Vec<(String, String)>,
}

impl ProcessRenderer {
    pub fn new(executable: PathBuf, script: PathBuf, timeout: Duration) -> Self {
        Self {
            executable,
            script,
            timeout,
            envs: Vec::new(),
        }
    }

    /// Add an environment variable to every spawned renderer.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn from_settings(settings: &RenderSettings) -> Self {
        Self::new(
            settings.executable.clone(),
            settings.script.clone(),
            settings.timeout,
        )
        .with_env("LIBXCB_ALLOW_SLOPPY_LOCK", "1")
        .with_env("DISPLAY", settings.display.clone())
    }

    async fn run(&self, job: &RenderJob) -> RenderOutcome {
        let staging = staging_path(&job.output);
        let outcome = match self.render_into(job, &staging).await {
            Ok(()) => fs::rename(&staging, &job.output)
                .await
                .map(|()| job.output.clone())
                .map_err(|err| RenderFailure::Publish(err.to_string())),
            Err(failure) => Err(failure),
        };
        if outcome.is_err() {
            let _ = fs::remove_file(&staging).await;
        }
        outcome
    }

    async fn render_into(&self, job: &RenderJob, staging: &Path) -> Result<(), RenderFailure> {
        let mut command = Command::new(&self.executable);
        command
            .arg(&self.script)
            .arg(&job.url)
            .arg(staging)
            .arg(job.params.delay_seconds.to_string())
            .arg(job.params.width.to_string())
            .arg(job.params.height.to_string())
            .envs(self.envs.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                RenderFailure::Spawn(format!(
                    "{} not found: {err}",
                    self.executable.display()
                ))
            } else {
                RenderFailure::Spawn(err.to_string())
            }
        })?;

        let waited = timeout(self.timeout, child.wait()).await;
        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => return Err(RenderFailure::Wait(err.to_string())),
            Err(_) => {
                let _ = child.kill().await;
                return Err(RenderFailure::TimedOut(self.timeout));
            }
        };

        if !status.success() {
            return Err(RenderFailure::Exited {
                code: status.code(),
            });
        }

        match fs::metadata(staging).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
            Ok(meta) if meta.is_file() => Err(RenderFailure::EmptyOutput {
                path: staging.to_path_buf(),
            }),
            _ => Err(RenderFailure::MissingOutput {
                path: staging.to_path_buf(),
            }),
        }
    }
}

/// Unique sibling of `output` the child writes into, keeping the `.png`
/// extension so the browser picks the right encoder.
fn staging_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = output
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!("{stem}.{}.tmp.{extension}", Uuid::new_v4().simple()))
}

#[async_trait]
impl Renderer for ProcessRenderer {
    async fn render(&self, job: &RenderJob) -> RenderOutcome {
        let started_at = Instant::now();
        let outcome = self.run(job).await;
        let elapsed_ms = started_at.elapsed().as_millis() as u64;

        counter!(METRIC_RENDER_TOTAL).increment(1);
        histogram!(METRIC_RENDER_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        match &outcome {
            Ok(path) => debug!(
                target = "application::render::process",
                op = "process::render",
                result = "ok",
                elapsed_ms,
                url = %job.url,
                output = %path.display(),
                width = job.params.width,
                height = job.params.height,
                delay_seconds = job.params.delay_seconds,
                "Snapshot rendered"
            ),
            Err(failure) => {
                counter!(METRIC_RENDER_FAILURE_TOTAL, "reason" => failure.code()).increment(1);
                debug!(
                    target = "application::render::process",
                    op = "process::render",
                    result = "error",
                    elapsed_ms,
                    url = %job.url,
                    error_code = failure.code(),
                    error = %failure,
                    "Snapshot render failed"
                );
            }
        }

        outcome
    }
}

//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::NonZeroU32,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "webshot";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 9464;
const DEFAULT_BANNER: &str = "GWS";
const DEFAULT_WIDTH: u32 = 1024;
const DEFAULT_HEIGHT: u32 = 768;
const DEFAULT_DELAY_SECS: u32 = 1;
const DEFAULT_MAX_WIDTH: u32 = 4096;
const DEFAULT_MAX_HEIGHT: u32 = 8192;
const DEFAULT_MAX_DELAY_SECS: u32 = 30;
const DEFAULT_RENDER_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RENDER_DISPLAY: &str = ":0";
pub(crate) const DEFAULT_RENDERER_PATH: &str = "/usr/local/bin/phantomjs";
pub(crate) const DEFAULT_RENDERER_SCRIPT: &str = "util/rasterize.js";
pub(crate) const DEFAULT_DATA_DIR: &str = "data";

/// Command-line arguments for the webshot binary.
#[derive(Debug, Parser)]
#[command(name = "webshot", version, about = "Web page snapshot cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "WEBSHOT_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the snapshot HTTP service.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Override the renderer executable.
    #[arg(long = "renderer-path", value_name = "PATH")]
    pub executable: Option<PathBuf>,

    /// Override the rasterize script handed to the renderer.
    #[arg(long = "renderer-script", value_name = "PATH")]
    pub script: Option<PathBuf>,

    /// Override the hard timeout applied to a single render.
    #[arg(long = "renderer-timeout-seconds", value_name = "SECONDS")]
    pub timeout_seconds: Option<u64>,

    /// Override the X display exported to the renderer.
    #[arg(long = "renderer-display", value_name = "DISPLAY")]
    pub display: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub render: RenderOverrides,

    /// Override the listener host.
    #[arg(long = "host", value_name = "HOST")]
    pub host: Option<String>,

    /// TCP port number to listen on.
    #[arg(long = "port", value_name = "PORT")]
    pub port: Option<u16>,

    /// Value of the `Server` response header; empty disables it.
    #[arg(long = "server-banner", value_name = "NAME")]
    pub banner: Option<String>,

    /// Default seconds to wait after page load before capturing.
    #[arg(long = "delay", value_name = "SECONDS")]
    pub delay: Option<u32>,

    /// Default viewport width.
    #[arg(long = "width", value_name = "PIXELS")]
    pub width: Option<u32>,

    /// Default viewport height.
    #[arg(long = "height", value_name = "PIXELS")]
    pub height: Option<u32>,

    /// Log every render outcome.
    #[arg(long = "debug", action = clap::ArgAction::SetTrue)]
    pub debug: bool,

    /// Override the directory holding cached snapshots.
    #[arg(long = "data-dir", value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub snapshot: SnapshotSettings,
    pub render: RenderSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub banner: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Defaults and bounds applied to per-request viewport parameters.
#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub width: NonZeroU32,
    pub height: NonZeroU32,
    pub delay_seconds: u32,
    pub max_width: NonZeroU32,
    pub max_height: NonZeroU32,
    pub max_delay_seconds: u32,
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub executable: PathBuf,
    pub script: PathBuf,
    pub timeout: Duration,
    pub display: String,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("WEBSHOT").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    let mut settings = Settings::from_raw(raw)?;
    if let Some(base) = executable_dir() {
        settings.anchor_relative_paths(&base);
    }
    Ok(settings)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    snapshot: RawSnapshotSettings,
    render: RawRenderSettings,
    storage: RawStorageSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.port {
            self.server.port = Some(port);
        }
        if let Some(banner) = overrides.banner.as_ref() {
            self.server.banner = Some(banner.clone());
        }
        if let Some(delay) = overrides.delay {
            self.snapshot.delay_seconds = Some(delay);
        }
        if let Some(width) = overrides.width {
            self.snapshot.width = Some(width);
        }
        if let Some(height) = overrides.height {
            self.snapshot.height = Some(height);
        }
        if overrides.debug {
            self.snapshot.debug = Some(true);
        }
        if let Some(dir) = overrides.data_dir.as_ref() {
            self.storage.data_dir = Some(dir.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }

        self.apply_render_overrides(&overrides.render);
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(path) = overrides.executable.as_ref() {
            self.render.executable = Some(path.clone());
        }
        if let Some(path) = overrides.script.as_ref() {
            self.render.script = Some(path.clone());
        }
        if let Some(seconds) = overrides.timeout_seconds {
            self.render.timeout_seconds = Some(seconds);
        }
        if let Some(display) = overrides.display.as_ref() {
            self.render.display = Some(display.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            snapshot,
            render,
            storage,
        } = raw;

        let server = build_server_settings(server)?;
        let snapshot = build_snapshot_settings(snapshot)?;
        let logging = build_logging_settings(logging, snapshot.debug)?;
        let render = build_render_settings(render)?;
        let storage = build_storage_settings(storage)?;

        Ok(Self {
            server,
            logging,
            snapshot,
            render,
            storage,
        })
    }

    /// Resolve relative script and data paths against `base`.
    ///
    /// Deployments ship the rasterize script and the snapshot directory next to
    /// the binary, so relative paths are anchored there rather than at the
    /// working directory.
    pub fn anchor_relative_paths(&mut self, base: &Path) {
        if self.render.script.is_relative() {
            self.render.script = base.join(&self.render.script);
        }
        if self.storage.data_dir.is_relative() {
            self.storage.data_dir = base.join(&self.storage.data_dir);
        }
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let banner = match server.banner {
        Some(value) => {
            let trimmed = value.trim();
            if !trimmed.bytes().all(|b| b == b' ' || b.is_ascii_graphic()) {
                return Err(LoadError::invalid(
                    "server.banner",
                    "banner must be printable ASCII",
                ));
            }
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        None => Some(DEFAULT_BANNER.to_string()),
    };

    Ok(ServerSettings { addr, banner })
}

fn build_logging_settings(
    logging: RawLoggingSettings,
    debug: bool,
) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None if debug => LevelFilter::DEBUG,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_snapshot_settings(snapshot: RawSnapshotSettings) -> Result<SnapshotSettings, LoadError> {
    let max_width = non_zero_u32(
        snapshot.max_width.unwrap_or(DEFAULT_MAX_WIDTH),
        "snapshot.max_width",
    )?;
    let max_height = non_zero_u32(
        snapshot.max_height.unwrap_or(DEFAULT_MAX_HEIGHT),
        "snapshot.max_height",
    )?;
    let max_delay_seconds = snapshot
        .max_delay_seconds
        .unwrap_or(DEFAULT_MAX_DELAY_SECS);

    let width = non_zero_u32(snapshot.width.unwrap_or(DEFAULT_WIDTH), "snapshot.width")?;
    if width > max_width {
        return Err(LoadError::invalid(
            "snapshot.width",
            format!("must not exceed snapshot.max_width ({max_width})"),
        ));
    }

    let height = non_zero_u32(
        snapshot.height.unwrap_or(DEFAULT_HEIGHT),
        "snapshot.height",
    )?;
    if height > max_height {
        return Err(LoadError::invalid(
            "snapshot.height",
            format!("must not exceed snapshot.max_height ({max_height})"),
        ));
    }

    let delay_seconds = snapshot.delay_seconds.unwrap_or(DEFAULT_DELAY_SECS);
    if delay_seconds > max_delay_seconds {
        return Err(LoadError::invalid(
            "snapshot.delay_seconds",
            format!("must not exceed snapshot.max_delay_seconds ({max_delay_seconds})"),
        ));
    }

    Ok(SnapshotSettings {
        width,
        height,
        delay_seconds,
        max_width,
        max_height,
        max_delay_seconds,
        debug: snapshot.debug.unwrap_or(false),
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let executable = render
        .executable
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RENDERER_PATH));
    if executable.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.executable",
            "path must not be empty",
        ));
    }

    let script = render
        .script
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RENDERER_SCRIPT));
    if script.as_os_str().is_empty() {
        return Err(LoadError::invalid("render.script", "path must not be empty"));
    }

    let timeout_seconds = render
        .timeout_seconds
        .unwrap_or(DEFAULT_RENDER_TIMEOUT_SECS);
    if timeout_seconds == 0 {
        return Err(LoadError::invalid(
            "render.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let display = render
        .display
        .unwrap_or_else(|| DEFAULT_RENDER_DISPLAY.to_string());

    Ok(RenderSettings {
        executable,
        script,
        timeout: Duration::from_secs(timeout_seconds),
        display,
    })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let data_dir = storage
        .data_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    if data_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "storage.data_dir",
            "path must not be empty",
        ));
    }

    Ok(StorageSettings { data_dir })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    banner: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSnapshotSettings {
    width: Option<u32>,
    height: Option<u32>,
    delay_seconds: Option<u32>,
    max_width: Option<u32>,
    max_height: Option<u32>,
    max_delay_seconds: Option<u32>,
    debug: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    executable: Option<PathBuf>,
    script: Option<PathBuf>,
    timeout_seconds: Option<u64>,
    display: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    data_dir: Option<PathBuf>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u32, key: &'static str) -> Result<NonZeroU32, LoadError> {
    NonZeroU32::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn executable_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.parent().map(Path::to_path_buf)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

//! Runtime configuration.
//!
//! Everything is read from environment variables (a `.env` file is loaded by
//! the binary first), with defaults suitable for a local deployment where
//! `yt-dlp` and `ffmpeg` are on `PATH`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::api::server::ApiServerConfig;
use crate::pipeline::TranscodeFormat;
use crate::resolver::extractor::ExtractorOptions;

/// Smallest chunk the relay will read at once.
pub const MIN_CHUNK_SIZE: usize = 8 * 1024;
/// Largest chunk the relay will read at once.
pub const MAX_CHUNK_SIZE: usize = 32 * 1024;

/// An external tool invocation: the executable plus arguments that always
/// precede the generated ones (e.g. `python3 -m yt_dlp`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Parse a whitespace separated command line. Returns `None` when blank.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            leading_args: parts.collect(),
        })
    }
}

/// Per-pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Budget for the resolve phase (first output byte or a resolved URL).
    pub resolve_timeout: Duration,
    /// How long a process may take to exit after its pipes are closed.
    pub terminate_grace: Duration,
    /// Relay read size.
    pub chunk_size: usize,
    /// Chunks buffered between the relay and the HTTP body.
    pub channel_capacity: usize,
    /// Bytes of stderr retained per process.
    pub stderr_tail_bytes: usize,
    /// Budget for a whole download-to-file run.
    pub download_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(30),
            terminate_grace: Duration::from_secs(3),
            chunk_size: 16 * 1024,
            channel_capacity: 4,
            stderr_tail_bytes: 8 * 1024,
            download_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Temporary file store settings.
#[derive(Debug, Clone)]
pub struct TempConfig {
    pub dir: PathBuf,
    pub max_age: Duration,
    pub sweep_interval: Duration,
}

impl Default for TempConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("tunepipe"),
            max_age: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ApiServerConfig,
    pub extractor_command: ToolCommand,
    pub transcoder_command: ToolCommand,
    pub extractor: ExtractorOptions,
    pub default_transcode_format: TranscodeFormat,
    pub transcode_bitrate_kbps: u32,
    /// Candidates tried per request before giving up.
    pub max_candidates: usize,
    pub pipeline: PipelineConfig,
    pub temp: TempConfig,
    pub log_dir: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ApiServerConfig::default(),
            extractor_command: ToolCommand::new("yt-dlp"),
            transcoder_command: ToolCommand::new("ffmpeg"),
            extractor: ExtractorOptions::default(),
            default_transcode_format: TranscodeFormat::Mp3,
            transcode_bitrate_kbps: 192,
            max_candidates: 3,
            pipeline: PipelineConfig::default(),
            temp: TempConfig::default(),
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from the process environment, falling back to defaults.
    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration using `lookup` to read variables.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(bind_address) = get("API_BIND_ADDRESS") {
            config.server.bind_address = bind_address;
        }
        if let Some(port) = parse_var(&get, "API_PORT") {
            config.server.port = port;
        }
        if let Some(enable_cors) = parse_var(&get, "API_ENABLE_CORS") {
            config.server.enable_cors = enable_cors;
        }

        if let Some(cmd) = get("YTDLP_PATH").as_deref().and_then(ToolCommand::parse) {
            config.extractor_command = cmd;
        }
        if let Some(cmd) = get("FFMPEG_PATH").as_deref().and_then(ToolCommand::parse) {
            config.transcoder_command = cmd;
        }

        if let Some(path) = get("YTDLP_COOKIES_FILE") {
            config.extractor.credential_file = Some(PathBuf::from(path));
        }
        if let Some(formats) = get("YTDLP_FORMAT") {
            let preference: Vec<String> = formats
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect();
            if !preference.is_empty() {
                config.extractor.format_preference = preference;
            }
        }
        if let Some(extra) = get("YTDLP_EXTRA_ARGS") {
            config.extractor.extra_args = extra.split_whitespace().map(str::to_string).collect();
        }

        if let Some(secs) = parse_var::<u64, _>(&get, "RESOLVE_TIMEOUT_SECS") {
            config.pipeline.resolve_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64, _>(&get, "TERMINATE_GRACE_SECS") {
            config.pipeline.terminate_grace = Duration::from_secs(secs);
        }
        if let Some(size) = parse_var::<usize, _>(&get, "RELAY_CHUNK_SIZE") {
            config.pipeline.chunk_size = size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        }
        if let Some(capacity) = parse_var::<usize, _>(&get, "RELAY_CHANNEL_CAPACITY") {
            config.pipeline.channel_capacity = capacity.max(1);
        }
        if let Some(bytes) = parse_var::<usize, _>(&get, "STDERR_TAIL_BYTES") {
            config.pipeline.stderr_tail_bytes = bytes.max(256);
        }
        if let Some(secs) = parse_var::<u64, _>(&get, "DOWNLOAD_TIMEOUT_SECS") {
            config.pipeline.download_timeout = Duration::from_secs(secs.max(1));
        }

        if let Some(max) = parse_var::<usize, _>(&get, "MAX_CANDIDATES") {
            config.max_candidates = max.max(1);
        }
        if let Some(format) = parse_var(&get, "DEFAULT_TRANSCODE_FORMAT") {
            config.default_transcode_format = format;
        }
        if let Some(kbps) = parse_var(&get, "TRANSCODE_BITRATE_KBPS") {
            config.transcode_bitrate_kbps = kbps;
        }

        if let Some(dir) = get("TEMP_DIR") {
            config.temp.dir = PathBuf::from(dir);
        }
        if let Some(secs) = parse_var(&get, "TEMP_MAX_AGE_SECS") {
            config.temp.max_age = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&get, "TEMP_SWEEP_INTERVAL_SECS") {
            config.temp.sweep_interval = Duration::from_secs(secs.max(1));
        }

        config.log_dir = get("LOG_DIR");

        config
    }
}

fn parse_var<T, F>(get: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = get(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}

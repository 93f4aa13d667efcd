use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8420
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MediaConfig {
    /// Media folder served to clients; `~` is expanded.
    #[serde(default = "default_media_root")]
    pub root: String,

    /// Extensions treated as RAW camera containers for preview extraction.
    #[serde(default = "default_raw_extensions")]
    pub raw_extensions: Vec<String>,
}

fn default_media_root() -> String {
    "~/Videos".to_string()
}

fn default_raw_extensions() -> Vec<String> {
    ["cr2", "cr3", "nef", "arw", "dng", "orf", "rw2", "raf"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: default_media_root(),
            raw_extensions: default_raw_extensions(),
        }
    }
}

impl MediaConfig {
    /// The media root with `~`/env expansion applied.
    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.root).into_owned())
    }

    pub fn is_raw_extension(&self, extension: &str) -> bool {
        let ext = extension.trim_start_matches('.').to_ascii_lowercase();
        self.raw_extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamingConfig {
    /// How far past the production frontier a segment request may point
    /// before it forces a seek-restart.
    #[serde(default = "default_lookahead")]
    pub lookahead_segments: u32,

    /// Aggregate ceiling on one segment wait, in seconds.
    #[serde(default = "default_segment_wait")]
    pub segment_wait_secs: u64,

    /// Sessions idle longer than this are reaped, in seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Interval between reaper sweeps, in seconds.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Explicit transcoder path; PATH lookup when unset.
    #[serde(default)]
    pub ffmpeg: Option<PathBuf>,

    /// Explicit probe tool path; PATH lookup when unset.
    #[serde(default)]
    pub ffprobe: Option<PathBuf>,
}

fn default_lookahead() -> u32 {
    5
}
fn default_segment_wait() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    15 * 60
}
fn default_reap_interval() -> u64 {
    60
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            lookahead_segments: default_lookahead(),
            segment_wait_secs: default_segment_wait(),
            idle_timeout_secs: default_idle_timeout(),
            reap_interval_secs: default_reap_interval(),
            ffmpeg: None,
            ffprobe: None,
        }
    }
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    use anyhow::Context;

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Load configuration, falling back to defaults when no path is given.
/// A given-but-broken file is an error; silently ignoring it would hide typos.
pub fn load_config_or_default(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => Ok(Config::default()),
    }
}

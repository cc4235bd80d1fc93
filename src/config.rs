use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Pause between two subscriptions in one scheduler tick.
    #[serde(default = "default_subscription_delay_ms")]
    pub subscription_delay_ms: u64,
    /// Pause between two download dispatches.
    #[serde(default = "default_dispatch_delay_ms")]
    pub dispatch_delay_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,
    pub db_path: Option<PathBuf>,
    /// Mark completed tasks `deleted` when their file disappears from disk.
    #[serde(default)]
    pub watch_deletions: bool,
    #[serde(default = "default_deletion_check_interval")]
    pub deletion_check_interval_secs: u64,
    #[serde(default = "default_debounce_ms")]
    pub watch_debounce_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval(),
            subscription_delay_ms: default_subscription_delay_ms(),
            dispatch_delay_ms: default_dispatch_delay_ms(),
            max_concurrent_downloads: default_max_concurrent(),
            db_path: None,
            watch_deletions: false,
            deletion_check_interval_secs: default_deletion_check_interval(),
            watch_debounce_ms: default_debounce_ms(),
        }
    }
}

impl GeneralConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn subscription_delay(&self) -> Duration {
        Duration::from_millis(self.subscription_delay_ms)
    }

    pub fn dispatch_delay(&self) -> Duration {
        Duration::from_millis(self.dispatch_delay_ms)
    }
}

fn default_sync_interval() -> u64 {
    600
}
fn default_subscription_delay_ms() -> u64 {
    2000
}
fn default_dispatch_delay_ms() -> u64 {
    1000
}
fn default_max_concurrent() -> usize {
    2
}
fn default_deletion_check_interval() -> u64 {
    60
}
fn default_debounce_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Optional bearer token sent with every API request.
    pub token: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Substring the API's `message` field must contain for a call to count as successful.
    #[serde(default = "default_success_marker")]
    pub success_marker: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            timeout_secs: default_timeout(),
            success_marker: default_success_marker(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:5555".into()
}
fn default_timeout() -> u64 {
    120
}
fn default_success_marker() -> String {
    "成功".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NfoFormat {
    #[default]
    Jellyfin,
    Emby,
    Plex,
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownloadConfig {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_folder_format")]
    pub folder_name_format: String,
    /// Empty disables the per-post folder level.
    #[serde(default = "default_work_folder_format")]
    pub work_folder_name_format: String,
    #[serde(default = "default_file_format")]
    pub file_name_format: String,
    /// Free-form account label available to templates as `{mark}`.
    #[serde(default)]
    pub mark: String,
    #[serde(default)]
    pub nfo_format: NfoFormat,
    #[serde(default = "default_true")]
    pub cover_images: bool,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            folder_name_format: default_folder_format(),
            work_folder_name_format: default_work_folder_format(),
            file_name_format: default_file_format(),
            mark: String::new(),
            nfo_format: NfoFormat::default(),
            cover_images: true,
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_folder_format() -> String {
    "{nickname}_{type}".into()
}
fn default_work_folder_format() -> String {
    "{create_time}_{desc}".into()
}
fn default_file_format() -> String {
    "{desc}".into()
}
fn default_true() -> bool {
    true
}
fn default_progress_interval_ms() -> u64 {
    1000
}

pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir.join("ddsyncd").join("config.toml"))
}

/// Parse and validate a config document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.api.base_url.trim().is_empty() {
        anyhow::bail!("api.base_url must not be empty");
    }
    url::Url::parse(&config.api.base_url)
        .with_context(|| format!("api.base_url is not a valid URL: {}", config.api.base_url))?;
    if config.general.max_concurrent_downloads == 0 {
        anyhow::bail!("general.max_concurrent_downloads must be at least 1");
    }
    if config.download.file_name_format.trim().is_empty() {
        anyhow::bail!("download.file_name_format must not be empty");
    }
    Ok(())
}

/// Load the config file. A missing file at the default location yields the
/// built-in defaults; an explicitly named file must exist.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (default_config_path()?, false),
    };

    if !explicit && !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content).with_context(|| format!("Invalid config file: {}", path.display()))
}

/// Where settings come from. Downloads and syncs call [`ConfigSource::load`]
/// each time so edits to the file apply to the next operation.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(Option<PathBuf>),
    Fixed(Box<Config>),
}

impl ConfigSource {
    pub fn load(&self) -> crate::error::Result<Config> {
        match self {
            ConfigSource::File(path) => load_config(path.as_deref())
                .map_err(|e| crate::error::Error::Config(format!("{e:#}"))),
            ConfigSource::Fixed(config) => Ok(config.as_ref().clone()),
        }
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::retry::RetryConfig;

pub const DEFAULT_CONFIG_FILE: &str = "downloader.toml";
pub const MAX_WORKERS: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Where the item list comes from.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkSourceConfig {
    /// Scrape one listing page for "<item> <n><unit> ... <action>" anchors.
    Listing {
        url: String,
        #[serde(default = "default_item_marker")]
        item_marker: String,
        #[serde(default = "default_unit_marker")]
        unit_marker: String,
        #[serde(default = "default_action_marker")]
        action_marker: String,
    },
    /// A saved JSON array of `{no, title, url}`.
    File { path: PathBuf },
    /// Numbers 1..=count with a `{no}` URL template.
    Template {
        url_template: String,
        count: u32,
        #[serde(default = "default_item_marker")]
        item_marker: String,
        #[serde(default = "default_unit_marker")]
        unit_marker: String,
    },
}

impl Default for LinkSourceConfig {
    fn default() -> Self {
        LinkSourceConfig::Listing {
            url: "https://risen.runean.com/entry/찬송가-목록".to_string(),
            item_marker: default_item_marker(),
            unit_marker: default_unit_marker(),
            action_marker: default_action_marker(),
        }
    }
}

fn default_item_marker() -> String {
    "찬송가".to_string()
}

fn default_unit_marker() -> String {
    "장".to_string()
}

fn default_action_marker() -> String {
    "바로가기".to_string()
}

/// Downloader configuration. Every field has a default so a partial TOML file
/// (or none at all) is enough.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub download_dir: PathBuf,
    /// Relative paths are resolved against `download_dir`.
    pub progress_file: PathBuf,
    pub log_file: PathBuf,
    pub media_extension: String,
    /// Filename token that marks a media link inside page text.
    pub media_marker: String,
    /// Files at or below this size are treated as truncated leftovers.
    pub min_file_size: u64,
    pub throttle_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub workers: usize,
    pub page_timeout_secs: u64,
    pub binary_timeout_secs: u64,
    pub user_agent: String,
    /// Expected item count used for "K/N" reporting; 0 means "however many the
    /// link source returns".
    pub total_items: u32,
    pub summary_every: usize,
    pub link_source: LinkSourceConfig,
    /// File the values came from; `None` when running on defaults.
    #[serde(skip)]
    pub loaded_from: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            download_dir: PathBuf::from("data/mp3"),
            progress_file: PathBuf::from("progress.json"),
            log_file: PathBuf::from("download_log.txt"),
            media_extension: "mp3".to_string(),
            media_marker: "tfile.mp3".to_string(),
            min_file_size: 10_000,
            throttle_ms: 500,
            max_retries: 2,
            retry_base_delay_secs: 2,
            retry_max_delay_secs: 30,
            workers: 1,
            page_timeout_secs: 30,
            binary_timeout_secs: 60,
            user_agent: format!(
                "hymn-downloader/{} (resumable batch fetcher)",
                env!("CARGO_PKG_VERSION")
            ),
            total_items: 645,
            summary_every: 10,
            link_source: LinkSourceConfig::default(),
            loaded_from: None,
        }
    }
}

impl Config {
    /// Load config from `path`. A missing file means defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;
        config.loaded_from = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()
    }

    fn validate(mut self) -> Result<Self, ConfigError> {
        if self.media_marker.trim().is_empty() {
            return Err(ConfigError::Invalid("media_marker must not be empty".into()));
        }
        if self.media_extension.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "media_extension must not be empty".into(),
            ));
        }
        if let LinkSourceConfig::Template { url_template, .. } = &self.link_source {
            if !url_template.contains("{no}") {
                return Err(ConfigError::Invalid(
                    "link_source.url_template must contain {no}".into(),
                ));
            }
        }
        self.workers = self.workers.clamp(1, MAX_WORKERS);
        self.summary_every = self.summary_every.max(1);
        Ok(self)
    }

    pub fn progress_path(&self) -> PathBuf {
        self.resolve(&self.progress_file)
    }

    pub fn log_path(&self) -> PathBuf {
        self.resolve(&self.log_file)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.download_dir.join(path)
        }
    }

    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn binary_timeout(&self) -> Duration {
        Duration::from_secs(self.binary_timeout_secs)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_secs: self.retry_base_delay_secs,
            max_delay_secs: self.retry_max_delay_secs,
        }
    }
}

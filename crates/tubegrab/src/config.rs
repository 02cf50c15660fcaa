use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the download server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server listens on
    pub bind_addr: String,
    /// Directory where in-flight and finished downloads are written
    pub downloads_dir: PathBuf,
    /// Path to the yt-dlp executable
    pub ytdlp_bin: PathBuf,
    /// Directory (or binary) handed to yt-dlp as --ffmpeg-location
    pub ffmpeg_location: Option<PathBuf>,
    /// Largest file served to a client, in MiB
    pub max_file_size_mb: u64,
    /// Interval in seconds between cleanup sweeps of the downloads directory
    pub cleanup_interval_secs: u64,
    /// Files and finished jobs older than this many seconds are swept
    pub max_file_age_secs: u64,
    /// Length of the rate-limit window in seconds
    pub rate_limit_window_secs: u64,
    /// Requests allowed per client within one window
    pub rate_limit_max_requests: u32,
    /// Retries of a transient yt-dlp failure before giving up
    pub max_retries: u32,
    /// Base delay of the exponential backoff, in milliseconds
    pub retry_base_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ServerConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            downloads_dir: PathBuf::from("downloads"),
            ytdlp_bin: PathBuf::from("yt-dlp"),
            ffmpeg_location: None,
            max_file_size_mb: 500,
            cleanup_interval_secs: 300,
            max_file_age_secs: 300,
            rate_limit_window_secs: 60,
            rate_limit_max_requests: 10,
            max_retries: 3,
            retry_base_delay_ms: 1000,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn max_file_age(&self) -> Duration {
        Duration::from_secs(self.max_file_age_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

//! Application configuration management.

use std::path::{Path, PathBuf};

use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::player::engine::MAX_VOLUME;
use crate::player::session::{PreviousAtStart, SessionOptions};

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Where the lists, covers and downloads live
    #[serde(default)]
    pub library: LibraryConfig,

    /// Player configuration
    #[serde(default)]
    pub player: PlayerConfig,

    /// Search and download configuration
    #[serde(default)]
    pub search: SearchConfig,

    /// Cover fetching
    #[serde(default)]
    pub covers: CoversConfig,

    /// Duration probes
    #[serde(default)]
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Data directory (default: `<data_dir>/jukebox`)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Player configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Volume level (0-200)
    #[serde(default = "default_volume")]
    pub volume: u16,

    /// What "previous" does on the first track
    #[serde(default)]
    pub previous_at_start: PreviousAtStart,

    /// Start the saved playlist on launch
    #[serde(default = "default_true")]
    pub autoplay_on_start: bool,

    /// Network pre-buffer for streams, in milliseconds
    #[serde(default = "default_network_caching_ms")]
    pub network_caching_ms: u32,

    /// Pause between a playback error and skipping to the next track
    #[serde(default = "default_error_skip_delay_ms")]
    pub error_skip_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Results per free-text search
    #[serde(default = "default_results")]
    pub default_results: usize,

    /// Download by default when searching URLs
    #[serde(default)]
    pub download_audio: bool,

    #[serde(default = "default_provider_binary")]
    pub provider_binary: String,

    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoversConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Polls before a probe gives up
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jukebox")
}

fn default_volume() -> u16 {
    80
}

fn default_true() -> bool {
    true
}

fn default_network_caching_ms() -> u32 {
    3000
}

fn default_error_skip_delay_ms() -> u64 {
    100
}

fn default_results() -> usize {
    5
}

fn default_provider_binary() -> String {
    String::from("yt-dlp")
}

fn default_ffmpeg_binary() -> String {
    String::from("ffmpeg")
}

fn default_request_timeout_secs() -> u64 {
    20
}

fn default_user_agent() -> String {
    String::from(
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
         Chrome/124.0 Safari/537.36",
    )
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_max_polls() -> u32 {
    500
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            volume: default_volume(),
            previous_at_start: PreviousAtStart::default(),
            autoplay_on_start: true,
            network_caching_ms: default_network_caching_ms(),
            error_skip_delay_ms: default_error_skip_delay_ms(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_results: default_results(),
            download_audio: false,
            provider_binary: default_provider_binary(),
            ffmpeg_binary: default_ffmpeg_binary(),
        }
    }
}

impl Default for CoversConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
        }
    }
}

impl Config {
    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| color_eyre::eyre::eyre!("Could not determine config directory"))?;

        Ok(config_dir.join("jukebox").join("config.toml"))
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`; a missing file means defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        // Clamp volume to valid range (0-200)
        config.player.volume = config.player.volume.min(MAX_VOLUME);
        config.search.default_results = config.search.default_results.max(1);

        Ok(config)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            volume: self.player.volume,
            previous_at_start: self.player.previous_at_start,
            network_caching_ms: self.player.network_caching_ms,
        }
    }
}

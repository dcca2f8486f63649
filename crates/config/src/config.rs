//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Directory layout configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirsConfig {
    /// Directory for raw ripped titles (one subdirectory per job)
    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,
    /// Staging directory for encoded outputs before final filing
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Final media library directory
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Directory for persisted job records
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_raw_dir() -> PathBuf {
    PathBuf::from("/data/raw")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/data/staging")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/data/media")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/ripd/state")
}

impl Default for DirsConfig {
    fn default() -> Self {
        Self {
            raw_dir: default_raw_dir(),
            staging_dir: default_staging_dir(),
            output_dir: default_output_dir(),
            state_dir: default_state_dir(),
        }
    }
}

/// Optical drive configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriveConfig {
    /// Default optical drive device
    #[serde(default = "default_device")]
    pub device: String,
    /// Eject the disc after a job reaches Done
    #[serde(default = "default_eject_after_rip")]
    pub eject_after_rip: bool,
}

fn default_device() -> String {
    "/dev/sr0".to_string()
}

fn default_eject_after_rip() -> bool {
    true
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            eject_after_rip: default_eject_after_rip(),
        }
    }
}

/// Ripping tool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RipConfig {
    /// Path to the makemkvcon binary
    #[serde(default = "default_makemkv_path")]
    pub makemkv_path: String,
    /// Minimum title duration to rip, in seconds
    #[serde(default = "default_min_title_duration_secs")]
    pub min_title_duration_secs: u64,
    /// Maximum number of titles to rip from a single disc
    #[serde(default = "default_max_titles")]
    pub max_titles: usize,
}

fn default_makemkv_path() -> String {
    "makemkvcon".to_string()
}

fn default_min_title_duration_secs() -> u64 {
    600
}

fn default_max_titles() -> usize {
    50
}

impl Default for RipConfig {
    fn default() -> Self {
        Self {
            makemkv_path: default_makemkv_path(),
            min_title_duration_secs: default_min_title_duration_secs(),
            max_titles: default_max_titles(),
        }
    }
}

/// Encoding tool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    /// Path to the HandBrakeCLI binary
    #[serde(default = "default_handbrake_path")]
    pub handbrake_path: String,
    /// HandBrake preset name
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Video encoder (x264, x265, ...)
    #[serde(default = "default_encoder")]
    pub encoder: String,
    /// Video quality (CRF, lower is better)
    #[serde(default = "default_quality")]
    pub quality: u32,
    /// Concurrent encode slots (0 = auto-derive from core count)
    #[serde(default)]
    pub encode_slots: u32,
    /// Delete raw ripped files once a job reaches Done
    #[serde(default)]
    pub delete_raw_after_done: bool,
}

fn default_handbrake_path() -> String {
    "HandBrakeCLI".to_string()
}

fn default_preset() -> String {
    "Fast 1080p30".to_string()
}

fn default_encoder() -> String {
    "x265".to_string()
}

fn default_quality() -> u32 {
    19
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            handbrake_path: default_handbrake_path(),
            preset: default_preset(),
            encoder: default_encoder(),
            quality: default_quality(),
            encode_slots: 0,
            delete_raw_after_done: false,
        }
    }
}

/// Metadata lookup configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataConfig {
    /// Enable the best-effort metadata lookup
    #[serde(default = "default_metadata_enabled")]
    pub enabled: bool,
    /// ARM metadata API base URL
    #[serde(default = "default_arm_api_url")]
    pub arm_api_url: String,
}

fn default_metadata_enabled() -> bool {
    true
}

fn default_arm_api_url() -> String {
    "https://1337server.pythonanywhere.com".to_string()
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            enabled: default_metadata_enabled(),
            arm_api_url: default_arm_api_url(),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum attempts per retryable stage
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff delay in seconds
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Backoff delay cap in seconds
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    10
}

fn default_backoff_cap_secs() -> u64 {
    300
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub dirs: DirsConfig,
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub rip: RipConfig,
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RIPD_RAW_DIR, RIPD_STAGING_DIR, RIPD_OUTPUT_DIR, RIPD_STATE_DIR
    /// - RIPD_DEVICE, RIPD_EJECT_AFTER_RIP
    /// - RIPD_MAKEMKV_PATH, RIPD_HANDBRAKE_PATH
    /// - RIPD_ENCODE_SLOTS, RIPD_MAX_ATTEMPTS
    /// - RIPD_METADATA_ENABLED, RIPD_ARM_API_URL
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RIPD_RAW_DIR") {
            self.dirs.raw_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("RIPD_STAGING_DIR") {
            self.dirs.staging_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("RIPD_OUTPUT_DIR") {
            self.dirs.output_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("RIPD_STATE_DIR") {
            self.dirs.state_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("RIPD_DEVICE") {
            self.drive.device = val;
        }

        if let Ok(val) = env::var("RIPD_EJECT_AFTER_RIP") {
            if let Some(b) = parse_bool(&val) {
                self.drive.eject_after_rip = b;
            }
        }

        if let Ok(val) = env::var("RIPD_MAKEMKV_PATH") {
            self.rip.makemkv_path = val;
        }

        if let Ok(val) = env::var("RIPD_HANDBRAKE_PATH") {
            self.encode.handbrake_path = val;
        }

        if let Ok(val) = env::var("RIPD_ENCODE_SLOTS") {
            if let Ok(slots) = val.parse::<u32>() {
                self.encode.encode_slots = slots;
            }
        }

        if let Ok(val) = env::var("RIPD_MAX_ATTEMPTS") {
            if let Ok(attempts) = val.parse::<u32>() {
                self.retry.max_attempts = attempts;
            }
        }

        if let Ok(val) = env::var("RIPD_METADATA_ENABLED") {
            if let Some(b) = parse_bool(&val) {
                self.metadata.enabled = b;
            }
        }

        if let Ok(val) = env::var("RIPD_ARM_API_URL") {
            self.metadata.arm_api_url = val;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

/// Parse "true"/"1"/"yes" and "false"/"0"/"no" (case-insensitive)
fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

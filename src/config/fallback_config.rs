//! Fallback configuration file handling
//!
//! Loads and manages the ~/.config/mcp-fallback/config.yaml file: the local
//! participant id, the retry policy, and one section per transport.

use crate::protocol::{
    RetryPolicy, DEFAULT_BASE_PATH, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_POLL_INTERVAL,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry bound stamped onto new envelopes
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wait before reselecting and retrying, in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.backoff_ms))
    }
}

fn default_enabled() -> bool {
    true
}

/// In-process transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryProtocolConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_memory_priority")]
    pub priority: i32,
}

fn default_memory_priority() -> i32 {
    1
}

impl Default for MemoryProtocolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: default_memory_priority(),
        }
    }
}

/// Filesystem transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProtocolConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_file_priority")]
    pub priority: i32,

    /// Directory holding `inbox/` and `outbox/`
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_file_priority() -> i32 {
    2
}

fn default_base_path() -> PathBuf {
    PathBuf::from(DEFAULT_BASE_PATH)
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

impl Default for FileProtocolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: default_file_priority(),
            base_path: default_base_path(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl FileProtocolConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// HTTP transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpProtocolConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_http_priority")]
    pub priority: i32,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Recipient id -> base URL
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
}

fn default_http_priority() -> i32 {
    3
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

impl Default for HttpProtocolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: default_http_priority(),
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
            endpoints: HashMap::new(),
        }
    }
}

impl HttpProtocolConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Per-transport sections
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolsConfig {
    #[serde(default)]
    pub memory: MemoryProtocolConfig,

    #[serde(default)]
    pub file: FileProtocolConfig,

    #[serde(default)]
    pub http: HttpProtocolConfig,
}

/// MCP Fallback configuration
///
/// Represents the complete ~/.config/mcp-fallback/config.yaml file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Sender id stamped on outbound envelopes
    #[serde(default = "default_participant_id")]
    pub participant_id: String,

    /// Health monitor period
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Seconds a transport is skipped after a failed send (0 disables)
    #[serde(default)]
    pub failure_cooldown_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub protocols: ProtocolsConfig,
}

fn default_participant_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "mcp-agent".to_string())
}

fn default_health_check_interval_secs() -> u64 {
    30
}

impl FallbackConfig {
    /// Create a configuration with every default
    pub fn new() -> Self {
        Self {
            participant_id: default_participant_id(),
            health_check_interval_secs: default_health_check_interval_secs(),
            failure_cooldown_secs: 0,
            retry: RetryConfig::default(),
            protocols: ProtocolsConfig::default(),
        }
    }

    /// Load configuration from the default path (~/.config/mcp-fallback/config.yaml)
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        Self::load(&path)
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::FallbackError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading fallback configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            participant_id = %config.participant_id,
            http_port = config.protocols.http.port,
            endpoints = config.protocols.http.endpoints.len(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving fallback configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/mcp-fallback/config.yaml)
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("mcp-fallback");
        path.push("config.yaml");
        path
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_secs)
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self::new()
    }
}

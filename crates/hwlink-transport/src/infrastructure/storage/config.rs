//! TOML-based configuration persistence for the transport.
//!
//! Reads and writes `TransportConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\hwlink\config.toml`
//! - Linux:    `~/.config/hwlink/config.toml`
//! - macOS:    `~/Library/Application Support/hwlink/config.toml`
//!
//! Example:
//!
//! ```toml
//! [transport]
//! backends = ["bridge", "hid"]
//! poll_interval_ms = 500
//! acquire_policy = "steal"
//!
//! [bridge]
//! url = "http://127.0.0.1:21325"
//!
//! [[usb.filters]]
//! vendor_id = 0x1209
//! product_id = 0x53c1
//! ```
//!
//! Every field has a serde default, so a missing file or an older file
//! without newer keys still loads.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hwlink_core::domain::BackendKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::arbitrator::AcquirePolicy;
use crate::application::facade::FacadeSettings;
use crate::infrastructure::backend::bridge::{BridgeSettings, DEFAULT_BRIDGE_URL};
use crate::infrastructure::backend::usb::{UsbFilter, UsbSettings};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub usb: UsbSection,
}

/// Backend selection, polling and session policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    /// Probe order; the first backend that starts becomes active.
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendKind>,
    #[serde(default)]
    pub disabled: Vec<BackendKind>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default)]
    pub acquire_policy: AcquirePolicy,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSection {
    #[serde(default = "default_bridge_url")]
    pub url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Newest daemon release; older daemons are reported as outdated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsbSection {
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    /// Longest single blocking read handed to the HID stack.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Empty accepts every device.
    #[serde(default)]
    pub filters: Vec<UsbFilter>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_backends() -> Vec<BackendKind> {
    BackendKind::ALL.to_vec()
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_call_timeout_ms() -> u64 {
    60_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_bridge_url() -> String {
    DEFAULT_BRIDGE_URL.to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_packet_size() -> usize {
    64
}
fn default_read_timeout_ms() -> u64 {
    200
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            backends: default_backends(),
            disabled: Vec::new(),
            poll_interval_ms: default_poll_interval_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            acquire_policy: AcquirePolicy::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            url: default_bridge_url(),
            request_timeout_ms: default_request_timeout_ms(),
            latest_version: None,
        }
    }
}

impl Default for UsbSection {
    fn default() -> Self {
        Self {
            packet_size: default_packet_size(),
            read_timeout_ms: default_read_timeout_ms(),
            filters: Vec::new(),
        }
    }
}

// ── Conversions into runtime settings ─────────────────────────────────────────

impl TransportConfig {
    pub fn facade_settings(&self) -> FacadeSettings {
        FacadeSettings {
            backends: self.transport.backends.clone(),
            disabled: self.transport.disabled.clone(),
            poll_interval: Duration::from_millis(self.transport.poll_interval_ms.max(1)),
            call_timeout: Duration::from_millis(self.transport.call_timeout_ms),
            acquire_policy: self.transport.acquire_policy,
        }
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            url: self.bridge.url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_millis(self.bridge.request_timeout_ms),
            latest_version: self.bridge.latest_version.clone(),
        }
    }

    pub fn usb_settings(&self) -> UsbSettings {
        UsbSettings {
            packet_size: self.usb.packet_size,
            read_slice: Duration::from_millis(self.usb.read_timeout_ms.max(1)),
            filters: self.usb.filters.clone(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config from the platform location, defaulting when absent.
pub fn load_config() -> Result<TransportConfig, ConfigError> {
    load_from(&config_file_path()?)
}

/// Loads `TransportConfig` from `path`, returning the default config if the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_from(path: &Path) -> Result<TransportConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TransportConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub fn save_config(config: &TransportConfig) -> Result<(), ConfigError> {
    save_to(&config_file_path()?, config)
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_to(path: &Path, config: &TransportConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("hwlink"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("hwlink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("hwlink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

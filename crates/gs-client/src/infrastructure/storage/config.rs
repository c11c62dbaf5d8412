//! TOML-based configuration for the GameStream client.
//!
//! The file lives in the platform config directory:
//! - Windows:  `%APPDATA%\gs-client\config.toml`
//! - Linux:    `~/.config/gs-client/config.toml`
//! - macOS:    `~/Library/Application Support/gs-client/config.toml`
//!
//! ```toml
//! [client]
//! unique_id = "0123456789ABCDEF"
//! device_name = "roth"
//!
//! [network]
//! http_port = 47989
//! https_port = 47984
//!
//! [[hosts]]
//! name = "desktop"
//! address = "192.168.1.20"
//! ```
//!
//! Every field has a serde default, so a missing file, an empty file, or a
//! file written by an older version all load.  Ports are host configuration:
//! a host's advertised `HttpsPort` overrides `https_port` for that host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use gs_core::protocol::{DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
use gs_core::ClientIds;

use crate::application::discover_hosts::DiscoverySettings;
use crate::infrastructure::network::discovery::DEFAULT_SERVICE_TYPE;
use crate::infrastructure::network::Timeouts;

/// Error type for configuration and credential file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The value could not be serialized to TOML.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Statically known hosts, polled actively.
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

/// How this client identifies itself to hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Sent as `uniqueid` on every request.
    #[serde(default = "default_unique_id")]
    pub unique_id: String,
    /// Shown in the host's paired-device list.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Ports and timeouts for the control channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default = "default_fast_fail_timeout_ms")]
    pub fast_fail_timeout_ms: u64,
    #[serde(default = "default_interactive_timeout_ms")]
    pub interactive_timeout_ms: u64,
    #[serde(default = "default_pairing_timeout_ms")]
    pub pairing_timeout_ms: u64,
}

/// Discovery cadence and limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,
    #[serde(default = "default_staleness_window_ms")]
    pub staleness_window_ms: u64,
}

/// A host the user entered by address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostEntry {
    pub name: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_port: Option<u16>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_unique_id() -> String {
    ClientIds::default().unique_id
}
fn default_device_name() -> String {
    ClientIds::default().device_name
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}
fn default_https_port() -> u16 {
    DEFAULT_HTTPS_PORT
}
fn default_fast_fail_timeout_ms() -> u64 {
    2_000
}
fn default_interactive_timeout_ms() -> u64 {
    10_000
}
fn default_pairing_timeout_ms() -> u64 {
    60_000
}
fn default_service_type() -> String {
    DEFAULT_SERVICE_TYPE.to_string()
}
fn default_poll_interval_ms() -> u64 {
    3_000
}
fn default_max_concurrent_probes() -> usize {
    8
}
fn default_staleness_window_ms() -> u64 {
    15_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            unique_id: default_unique_id(),
            device_name: default_device_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            https_port: default_https_port(),
            fast_fail_timeout_ms: default_fast_fail_timeout_ms(),
            interactive_timeout_ms: default_interactive_timeout_ms(),
            pairing_timeout_ms: default_pairing_timeout_ms(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            poll_interval_ms: default_poll_interval_ms(),
            max_concurrent_probes: default_max_concurrent_probes(),
            staleness_window_ms: default_staleness_window_ms(),
        }
    }
}

// ── Conversions into runtime settings ─────────────────────────────────────────

impl ClientConfig {
    pub fn client_ids(&self) -> ClientIds {
        ClientIds {
            unique_id: self.unique_id.clone(),
            device_name: self.device_name.clone(),
        }
    }
}

impl NetworkConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            fast_fail: Duration::from_millis(self.fast_fail_timeout_ms),
            interactive: Duration::from_millis(self.interactive_timeout_ms),
            pairing: Duration::from_millis(self.pairing_timeout_ms),
        }
    }
}

impl DiscoveryConfig {
    /// Probe timeout is bounded by the fast-fail timeout of `network`.
    pub fn settings(&self, network: &NetworkConfig) -> DiscoverySettings {
        DiscoverySettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_concurrent_probes: self.max_concurrent_probes.max(1),
            staleness_window: Duration::from_millis(self.staleness_window_ms),
            probe_timeout: Duration::from_millis(network.fast_fail_timeout_ms),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for client files.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot
/// be determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config at `path`, returning `AppConfig::default()` if the file
/// does not exist yet.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Writes `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    write_toml(path, config)
}

pub(crate) fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(value)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config base directory including `gs-client`.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("gs-client"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("gs-client"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("gs-client")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

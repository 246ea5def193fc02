//! TOML Configuration File Support
//!
//! Bridge configuration lives at `$XDG_CONFIG_HOME/flowbridge/bridge.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments (applied by the caller)
//! 2. `FLOWBRIDGE_*` environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! backend = "embedded"
//!
//! [socket]
//! address = "127.0.0.1:7878"
//! connect_timeout_ms = 5000
//! request_timeout_ms = 0
//!
//! [embedded]
//! packages = []
//! extension_packages = ["sisl"]
//! session_selector = "default"
//!
//! [engine]
//! listen = "127.0.0.1:7878"
//! allow_run_code = true
//! max_connections = 64
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::BackendKind;
use crate::transport::config::{
    BackendSettings, EmbeddedSettings, SocketSettings, DEFAULT_ENGINE_ADDRESS,
};
use crate::transport::socket::ServerOptions;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[socket]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketToml {
    /// Engine address
    pub address: Option<String>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// Per-call timeout in milliseconds (0 = none)
    pub request_timeout_ms: Option<u64>,
}

/// `[embedded]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedToml {
    /// Extra runtime distribution packages
    pub packages: Option<Vec<String>>,
    /// Extra index packages
    pub extension_packages: Option<Vec<String>>,
    /// Session selector
    pub session_selector: Option<String>,
    /// Runtime distribution directory
    pub runtime_dir: Option<PathBuf>,
}

/// `[engine]` section, read by the engine daemon
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineToml {
    /// Listen address
    pub listen: Option<String>,
    /// Accept run_code requests
    pub allow_run_code: Option<bool>,
    /// Connection limit
    pub max_connections: Option<usize>,
}

/// Top-level TOML structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeToml {
    /// Selected backend
    pub backend: Option<BackendKind>,
    /// Socket transport section
    pub socket: SocketToml,
    /// Embedded transport section
    pub embedded: EmbeddedToml,
    /// Engine daemon section
    pub engine: EngineToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved bridge configuration
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Selected backend
    pub backend: BackendKind,
    /// Socket transport settings
    pub socket: SocketSettings,
    /// Embedded transport settings
    pub embedded: EmbeddedSettings,
    /// Engine daemon listen address
    pub engine_listen: String,
    /// Engine daemon server options
    pub engine: ServerOptions,
    /// Config file that was loaded, if any
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::None,
            socket: SocketSettings::default(),
            embedded: EmbeddedSettings::default(),
            engine_listen: DEFAULT_ENGINE_ADDRESS.to_string(),
            engine: ServerOptions::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl BridgeConfig {
    /// Configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Record that the caller applied CLI overrides
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Settings for the selected backend
    #[must_use]
    pub fn backend_settings(&self) -> BackendSettings {
        match self.backend {
            BackendKind::None => BackendSettings::None,
            BackendKind::Socket => BackendSettings::Socket(self.socket.clone()),
            BackendKind::Embedded => BackendSettings::Embedded(self.embedded.clone()),
        }
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("flowbridge").join("bridge.toml"))
}

/// Load configuration from the default path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or an
/// environment variable holds an invalid value.
pub fn load_config() -> Result<BridgeConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the process environment
///
/// A missing file is not an error.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<BridgeConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
pub fn load_config_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<BridgeConfig, ConfigError> {
    let mut config = BridgeConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: BridgeToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
        }
    }

    apply_env_config(&mut config, env)?;
    Ok(config)
}

fn apply_toml_config(config: &mut BridgeConfig, toml: BridgeToml) {
    if let Some(backend) = toml.backend {
        config.backend = backend;
    }

    if let Some(address) = toml.socket.address {
        config.socket.address = address;
    }
    if let Some(timeout) = toml.socket.connect_timeout_ms {
        config.socket.connect_timeout_ms = timeout;
    }
    if let Some(timeout) = toml.socket.request_timeout_ms {
        config.socket.request_timeout_ms = timeout;
    }

    if let Some(packages) = toml.embedded.packages {
        config.embedded.packages = packages;
    }
    if let Some(packages) = toml.embedded.extension_packages {
        config.embedded.extension_packages = packages;
    }
    if let Some(selector) = toml.embedded.session_selector {
        config.embedded.session_selector = selector;
    }
    if toml.embedded.runtime_dir.is_some() {
        config.embedded.runtime_dir = toml.embedded.runtime_dir;
    }

    if let Some(listen) = toml.engine.listen {
        config.engine_listen = listen;
    }
    if let Some(allow) = toml.engine.allow_run_code {
        config.engine.allows_run_code = allow;
    }
    if let Some(max) = toml.engine.max_connections {
        config.engine.max_connections = max;
    }
}

fn parse_backend(value: &str) -> Result<BackendKind, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "none" | "" => Ok(BackendKind::None),
        "socket" => Ok(BackendKind::Socket),
        "embedded" => Ok(BackendKind::Embedded),
        other => Err(ConfigError::ValidationError(format!(
            "FLOWBRIDGE_BACKEND must be none, socket or embedded, got '{other}'"
        ))),
    }
}

fn parse_millis(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key} must be milliseconds, got '{value}'")))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn apply_env_config(
    config: &mut BridgeConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let mut touched = false;

    if let Some(backend) = env("FLOWBRIDGE_BACKEND") {
        config.backend = parse_backend(&backend)?;
        touched = true;
    }
    if let Some(address) = env("FLOWBRIDGE_SOCKET_ADDR") {
        config.socket.address = address;
        touched = true;
    }
    if let Some(timeout) = env("FLOWBRIDGE_CONNECT_TIMEOUT") {
        config.socket.connect_timeout_ms = parse_millis("FLOWBRIDGE_CONNECT_TIMEOUT", &timeout)?;
        touched = true;
    }
    if let Some(timeout) = env("FLOWBRIDGE_REQUEST_TIMEOUT") {
        config.socket.request_timeout_ms = parse_millis("FLOWBRIDGE_REQUEST_TIMEOUT", &timeout)?;
        touched = true;
    }
    if let Some(packages) = env("FLOWBRIDGE_PACKAGES") {
        config.embedded.packages = parse_list(&packages);
        touched = true;
    }
    if let Some(packages) = env("FLOWBRIDGE_EXTENSION_PACKAGES") {
        config.embedded.extension_packages = parse_list(&packages);
        touched = true;
    }
    if let Some(selector) = env("FLOWBRIDGE_SESSION") {
        config.embedded.session_selector = selector;
        touched = true;
    }
    if let Some(dir) = env("FLOWBRIDGE_RUNTIME_DIR") {
        config.embedded.runtime_dir = Some(PathBuf::from(dir));
        touched = true;
    }
    if let Some(listen) = env("FLOWBRIDGE_ENGINE_LISTEN") {
        config.engine_listen = listen;
        touched = true;
    }
    if let Some(allow) = env("FLOWBRIDGE_ALLOW_RUN_CODE") {
        config.engine.allows_run_code = allow != "0" && allow.to_lowercase() != "false";
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
    Ok(())
}

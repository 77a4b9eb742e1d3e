//! TOML-based configuration persistence for the server role.
//!
//! Reads and writes [`ServerConfig`] to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\Airlift\server.toml`
//! - Linux:    `~/.config/airlift/server.toml`
//! - macOS:    `~/Library/Application Support/Airlift/server.toml`
//!
//! Every field carries a serde default so the server works on first run
//! (before a config file exists) and keeps working when an older file is
//! missing newer fields.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use airlift_core::discovery::{DEFAULT_DISCOVERY_PORT, DEFAULT_SERVICE};
use airlift_core::{Reachability, RoutePolicy};

use crate::engine::EngineConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub network: NetworkConfig,
    /// Passcode clients must match before sending payloads. Absent = no
    /// passcode required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passcode: Option<String>,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// What the server advertises about itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// Display name other devices on the network will see.
    #[serde(default = "default_name")]
    pub name: String,
    /// Service label probes are answered for.
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Extra key/value pairs published with the advertisement.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Port and bind-address settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// IP address to bind the listeners to. `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port for the transfer listener; 0 lets the OS pick and the
    /// advertisement publishes whatever was assigned.
    #[serde(default)]
    pub transfer_port: u16,
    /// UDP port for discovery probes.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_name() -> String {
    "airlift-server".to_string()
}
fn default_service_type() -> String {
    DEFAULT_SERVICE.to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            network: NetworkConfig::default(),
            passcode: None,
            log_level: default_log_level(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            service_type: default_service_type(),
            metadata: HashMap::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            transfer_port: 0,
            discovery_port: default_discovery_port(),
        }
    }
}

impl ServerConfig {
    /// Engine settings derived from this file. An unparseable bind address
    /// falls back to all interfaces.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            bind_address: self
                .network
                .bind_address
                .parse()
                .unwrap_or_else(|_| "0.0.0.0".parse().unwrap()),
            transfer_port: self.network.transfer_port,
            discovery_port: self.network.discovery_port,
            service: self.service.service_type.clone(),
            passcode: self.passcode.clone(),
            reachability: Reachability::default(),
            route: RoutePolicy::default(),
            write_chunk: 64 * 1024,
        }
    }

    /// The advertised metadata as the byte map discovery publishes.
    pub fn advertised_metadata(&self) -> HashMap<String, Vec<u8>> {
        self.service
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().into_bytes()))
            .collect()
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

/// Resolves the full path to the config file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("server.toml"))
}

/// Loads [`ServerConfig`] from disk, returning `ServerConfig::default()` if
/// the file does not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config() -> Result<ServerConfig, ConfigError> {
    let path = config_file_path()?;

    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let cfg: ServerConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Persists `config` to disk, creating the config directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &ServerConfig) -> Result<(), ConfigError> {
    let path = config_file_path()?;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(())
}

/// Resolves the platform config base directory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("Airlift"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("airlift"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("Airlift")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_the_protocol_constants() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.service.service_type, DEFAULT_SERVICE);
        assert_eq!(cfg.network.discovery_port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(cfg.network.transfer_port, 0);
        assert_eq!(cfg.passcode, None);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn test_toml_round_trip() {
        let mut cfg = ServerConfig::default();
        cfg.service.name = "den-pc".to_string();
        cfg.network.transfer_port = 40100;
        cfg.passcode = Some("orchid".to_string());
        cfg.service
            .metadata
            .insert("kind".to_string(), "photos".to_string());

        let text = toml::to_string_pretty(&cfg).expect("serialize");
        let restored: ServerConfig = toml::from_str(&text).expect("deserialize");
        assert_eq!(cfg, restored);
    }

    #[test]
    fn test_absent_passcode_is_omitted_from_toml() {
        let cfg = ServerConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(!text.contains("passcode"), "None passcode must be omitted");
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let cfg: ServerConfig = toml::from_str("[service]\n[network]\n").expect("minimal");
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn test_partial_network_overrides_defaults() {
        let text = "[service]\n[network]\ndiscovery_port = 29999\n";
        let cfg: ServerConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.network.discovery_port, 29999);
        assert_eq!(cfg.network.bind_address, "0.0.0.0");
    }

    #[test]
    fn test_invalid_toml_is_a_parse_error() {
        let result: Result<ServerConfig, toml::de::Error> = toml::from_str("[[[ nope");
        assert!(result.is_err());
    }

    #[test]
    fn test_engine_config_carries_the_file_settings() {
        let mut cfg = ServerConfig::default();
        cfg.network.bind_address = "127.0.0.1".to_string();
        cfg.network.transfer_port = 40101;
        cfg.passcode = Some("orchid".to_string());

        let engine = cfg.engine_config();
        assert_eq!(engine.bind_address, "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(engine.transfer_port, 40101);
        assert_eq!(engine.passcode.as_deref(), Some("orchid"));
    }

    #[test]
    fn test_unparseable_bind_address_falls_back_to_all_interfaces() {
        let mut cfg = ServerConfig::default();
        cfg.network.bind_address = "not-an-ip".to_string();
        let engine = cfg.engine_config();
        assert_eq!(engine.bind_address, "0.0.0.0".parse::<std::net::IpAddr>().unwrap());
    }

    #[test]
    fn test_advertised_metadata_maps_strings_to_bytes() {
        let mut cfg = ServerConfig::default();
        cfg.service
            .metadata
            .insert("kind".to_string(), "photos".to_string());
        let meta = cfg.advertised_metadata();
        assert_eq!(meta.get("kind").unwrap(), b"photos");
    }

    #[test]
    fn test_save_and_load_round_trip_via_temp_dir() {
        let dir = std::env::temp_dir().join(format!("airlift_cfg_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("server.toml");

        let mut cfg = ServerConfig::default();
        cfg.network.transfer_port = 40102;
        cfg.log_level = "debug".to_string();

        // Mirrors save_config/load_config against an explicit path.
        std::fs::write(&path, toml::to_string_pretty(&cfg).unwrap()).unwrap();
        let loaded: ServerConfig =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

        assert_eq!(loaded.network.transfer_port, 40102);
        assert_eq!(loaded.log_level, "debug");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_config_file_path_ends_with_server_toml() {
        if let Ok(path) = config_file_path() {
            assert!(path.ends_with("server.toml"));
        }
        // NoPlatformConfigDir in a stripped environment is also acceptable.
    }
}

//! Configuration management for the LAN mesh.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::transport::wire::{MAX_NAME_LENGTH, MAX_PROFILE_IMAGE};
use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "mesh.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "MESH";

/// Complete configuration for a mesh node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Local identity and profile
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Trust policy selection
    #[serde(default)]
    pub trust: TrustConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network and transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the datagram socket and connection listener bind to
    pub bind_address: IpAddr,
    /// Well-known mesh port; used for both UDP and TCP. 0 picks an ephemeral port.
    pub port: u16,
    /// Port assumed for peers learned from the network (defaults to `port`)
    pub peer_port: Option<u16>,
    /// Send announce and withdraw datagrams on the local interfaces
    pub broadcast: bool,
    /// Re-announce interval in seconds (0 = announce only on startup)
    pub announce_interval_secs: u64,
    /// Outbound connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Upper bound for one connection's whole exchange, in milliseconds
    pub io_timeout_ms: u64,
    /// Largest accepted message payload in bytes
    pub max_message_size: usize,
    /// Peers introduced directly instead of through broadcast discovery
    pub bootstrap_peers: Vec<BootstrapPeer>,
}

/// A peer known ahead of time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapPeer {
    /// Reachable endpoint of the peer
    pub address: SocketAddr,
    /// Base64 encoded public key
    pub public_key: String,
}

/// Local identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name shown to other peers
    pub display_name: Option<String>,
    /// Optional image file sent to peers during the handshake
    pub profile_image: Option<PathBuf>,
    /// Directory holding `identity.key` and `identity.pub`
    pub keys_dir: PathBuf,
}

/// Which trust policy admits peers into the mesh
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrustMode {
    /// Every correctly signed key is admitted
    AllowAll,
    /// A single file listing one base64 key per line
    File,
    /// A directory with one key file per trusted peer
    Directory,
}

/// Trust policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Policy kind
    pub mode: TrustMode,
    /// Key list file or key directory, depending on `mode`
    pub path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: crate::defaults::DEFAULT_PORT,
            peer_port: None,
            broadcast: true,
            announce_interval_secs: 0,
            connect_timeout_ms: crate::defaults::DEFAULT_CONNECT_TIMEOUT_MS,
            io_timeout_ms: crate::defaults::DEFAULT_IO_TIMEOUT_MS,
            max_message_size: crate::MAX_MESSAGE_SIZE,
            bootstrap_peers: Vec::new(),
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lan-mesh")
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            profile_image: None,
            keys_dir: data_dir().join("keys"),
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            mode: TrustMode::Directory,
            path: Some(data_dir().join("trusted")),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NetworkConfig {
    /// Port peers are assumed to listen on
    pub fn remote_port(&self) -> u16 {
        self.peer_port.unwrap_or(self.port)
    }

    /// Outbound connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-connection exchange timeout
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl MeshConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or fails validation
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults, an optional file and the environment
    ///
    /// Without an explicit path, `mesh.toml` in the working directory and
    /// `<config_dir>/lan-mesh/mesh.toml` are tried in that order.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            config = Self::from_file(path)?;
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("lan-mesh")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            if let Some(location) = default_locations.iter().find(|l| l.exists()) {
                config = Self::from_file(location)?;
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Apply `MESH_*` environment overrides
    fn merge_from_env(mut self) -> Result<Self> {
        if let Some(port) = env_override("NETWORK_PORT") {
            self.network.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: format!("{}_NETWORK_PORT", ENV_PREFIX),
                value: port,
            })?;
        }

        if let Some(name) = env_override("IDENTITY_DISPLAY_NAME") {
            self.identity.display_name = Some(name);
        }

        if let Some(level) = env_override("LOGGING_LEVEL") {
            self.logging.level = level;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.network.connect_timeout_ms == 0 {
            return Err(invalid("network.connect_timeout_ms", "0"));
        }

        if self.network.io_timeout_ms == 0 {
            return Err(invalid("network.io_timeout_ms", "0"));
        }

        if self.network.max_message_size == 0 {
            return Err(invalid("network.max_message_size", "0"));
        }

        if self.trust.mode != TrustMode::AllowAll && self.trust.path.is_none() {
            return Err(ConfigError::MissingField {
                field: "trust.path".to_string(),
            }
            .into());
        }

        if let Some(name) = &self.identity.display_name {
            if name.len() > MAX_NAME_LENGTH {
                return Err(invalid("identity.display_name", &format!("{} bytes", name.len())));
            }
        }

        if let Some(path) = &self.identity.profile_image {
            if let Ok(metadata) = std::fs::metadata(path) {
                if metadata.len() > MAX_PROFILE_IMAGE as u64 {
                    return Err(invalid(
                        "identity.profile_image",
                        &format!("{} bytes", metadata.len()),
                    ));
                }
            }
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => return Err(invalid("logging.level", other)),
        }

        Ok(())
    }

    /// Ensure the key directory and, for directory trust, the trust directory exist
    pub fn ensure_directories(&self) -> Result<()> {
        let mut dirs_to_create = vec![&self.identity.keys_dir];
        if self.trust.mode == TrustMode::Directory {
            dirs_to_create.extend(self.trust.path.as_ref());
        }

        for dir in dirs_to_create {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                    path: dir.display().to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn invalid(field: &str, value: &str) -> crate::utils::MeshError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

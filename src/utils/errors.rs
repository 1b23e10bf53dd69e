//! Error types and handling for the LAN mesh.
//!
//! Errors are layered the same way the mesh is: crypto primitives, network
//! plumbing, protocol framing and configuration each get their own enum, and
//! [`MeshError`] unifies them. Remote-caused failures (malformed packets,
//! failed proofs, untrusted keys) are contained by the listener that saw them;
//! only construction-time errors are expected to reach the embedding
//! application as hard failures.

use thiserror::Error;

/// Result type alias for the mesh library
pub type Result<T> = std::result::Result<T, MeshError>;

/// Top-level error type for all mesh operations
#[derive(Error, Debug, Clone)]
pub enum MeshError {
    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Network and transport layer errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Wire protocol and peer admission errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// Base64 encoding/decoding errors
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    /// Decryption operation failure
    #[error("Decryption failed: {reason}")]
    Decryption { reason: String },

    /// Key derivation failure
    #[error("Key derivation failed: {reason}")]
    KeyDerivation { reason: String },
}

/// Network and transport layer errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Connection establishment failure
    #[error("Connection failed to {peer}: {reason}")]
    ConnectionFailed { peer: String, reason: String },

    /// Binding a listening socket failed
    #[error("Failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    /// Broadcast datagram could not be sent on any interface
    #[error("Broadcast failed: {reason}")]
    Broadcast { reason: String },

    /// Timeout during network operation
    #[error("Network timeout: {operation}")]
    Timeout { operation: String },

    /// Peer not present in the registry
    #[error("Peer not found: {peer_id}")]
    PeerNotFound { peer_id: String },

    /// Peer is known but no handshake has produced a session key yet
    #[error("No session key for peer: {peer_id}")]
    NoSessionKey { peer_id: String },

    /// Operation requires a started mesh
    #[error("Mesh is not running")]
    NotRunning,
}

/// Wire protocol and admission errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Truncated or garbled framing
    #[error("Malformed packet: {reason}")]
    MalformedPacket { reason: String },

    /// Identity proof did not verify against the claimed key
    #[error("Authentication failure")]
    AuthenticationFailure,

    /// The trust policy rejected the claimed key
    #[error("Untrusted key")]
    UntrustedKey,

    /// Message from a peer without a completed handshake
    #[error("Unknown sender: {peer_id}")]
    UnknownSender { peer_id: String },

    /// First byte of a connection was not a known command
    #[error("Unknown command tag: {tag}")]
    UnknownCommand { tag: u8 },

    /// Length field exceeds the ceiling for that field
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Missing required configuration
    #[error("Missing configuration: {field}")]
    MissingField { field: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

impl ProtocolError {
    /// Shorthand for a [`ProtocolError::MalformedPacket`]
    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        Self::MalformedPacket {
            reason: reason.into(),
        }
    }
}

impl MeshError {
    /// Returns true if retrying the same operation later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(NetworkError::Timeout { .. })
                | Self::Network(NetworkError::ConnectionFailed { .. })
                | Self::Network(NetworkError::NoSessionKey { .. })
        )
    }

    /// Returns true if the error was caused by a remote party failing a
    /// security check rather than by noise or local misconfiguration
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::Decryption { .. })
                | Self::Protocol(ProtocolError::AuthenticationFailure)
                | Self::Protocol(ProtocolError::UntrustedKey)
                | Self::Protocol(ProtocolError::UnknownSender { .. })
        )
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        // A short read while parsing a length-prefixed field is a framing problem
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return Self::Protocol(ProtocolError::malformed("unexpected end of stream"));
        }
        Self::Io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for MeshError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Network(NetworkError::Timeout {
            operation: "connection exchange".to_string(),
        })
    }
}

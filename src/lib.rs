//! # LAN Mesh
//!
//! A serverless peer-to-peer mesh for one local network segment. Nodes find
//! each other through signed broadcast announcements, prove possession of
//! their Ed25519 keys with a nonce challenge, agree on a per-peer session key
//! and exchange encrypted messages over short-lived TCP connections.
//!
//! ## Features
//!
//! - **Broadcast Discovery**: signed join and leave datagrams on every IPv4 interface
//! - **Authenticated Connections**: every connection starts with a fresh-nonce proof
//! - **Session Keys**: sealed to the recipient's identity key during the handshake
//! - **Pluggable Trust**: allow-all, key list file or key directory policies
//! - **Event Stream**: joins, leaves, profile changes and messages for any front end
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lan_mesh::{Mesh, MeshConfig, MeshEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MeshConfig::load(None)?;
//!     let mut mesh = Mesh::from_config(&config)?;
//!     let mut events = mesh.take_events().ok_or("event stream taken")?;
//!     mesh.start().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let MeshEvent::MessageReceived { sender, payload, .. } = event {
//!             println!("{}: {}", sender, String::from_utf8_lossy(&payload));
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: identity keys, signatures, sealing, the keystream and trust policies
//! - [`network`]: the peer registry and broadcast discovery
//! - [`session`]: challenge-response proofs and the Identify handshake
//! - [`transport`]: wire framing, the connection listener and message delivery
//! - [`mesh`]: the node lifecycle tying everything together
//! - [`utils`]: configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod crypto;
pub mod mesh;
pub mod network;
pub mod session;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use crypto::{AllowAll, Identity, SessionKey, TrustDirectory, TrustList, TrustPolicy};
pub use mesh::{Mesh, MeshStats};
pub use network::{MeshEvent, PeerIdentity};
pub use transport::Profile;
pub use utils::{MeshConfig, MeshError, Result};

/// Maximum message size in bytes (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default configuration values
pub mod defaults {
    /// Well-known port for discovery datagrams and connections
    pub const DEFAULT_PORT: u16 = 6969;

    /// Default outbound connect timeout in milliseconds
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;

    /// Default upper bound for one connection's exchange in milliseconds
    pub const DEFAULT_IO_TIMEOUT_MS: u64 = 10_000;
}

//! Session establishment between two peers.
//!
//! This module provides the nonce challenge-response proof used on every
//! connection and the Identify handshake that delivers the session key.

pub(crate) mod handshake;
pub mod proof;

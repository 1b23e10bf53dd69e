//! Cryptographic primitives, node identity and trust policies.
//!
//! This module provides everything the protocol engines need from
//! cryptography: signing and verifying identity claims, sealing session keys
//! to a peer, the message keystream, and the pluggable trust decision.

pub mod cipher;
pub mod identity;
pub mod trust;

pub use cipher::*;
pub use identity::*;
pub use trust::{AllowAll, TrustDirectory, TrustList, TrustPolicy};

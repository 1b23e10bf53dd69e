//! Network layer: who is out there and how we learn about them.
//!
//! This module provides the peer registry and broadcast discovery on the
//! local network.

pub mod discovery;
pub mod registry;

pub use discovery::{decode_announcement, encode_announcement, AnnounceKind, Announcement};
pub use registry::*;

//! Transport layer for mesh connections.
//!
//! This module provides the binary framing, the inbound connection listener
//! and encrypted message delivery.

pub(crate) mod listener;
pub(crate) mod messaging;
pub mod wire;

pub use wire::{Command, Profile};

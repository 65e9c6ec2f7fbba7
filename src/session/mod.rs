//! Per-run key state.
//!
//! The keyring is populated by the handshake round and read by every
//! broadcast round after it.

pub mod keyring;

pub use keyring::*;

//! Transport layer for broadcast rounds.
//!
//! This module provides package framing, reassembly, the handshake
//! messages, and the client and server halves that move them over TCP.

pub mod client;
pub mod collector;
pub mod net;
pub mod package;
pub mod protocol;
pub mod server;

pub use client::Client;
pub use collector::Collector;
pub use package::*;
pub use protocol::{max_handshake_size, Challenge, HandshakeCipher, HandshakeReply};
pub use server::{BroadcastOutcome, HandshakeOutcome, Server};

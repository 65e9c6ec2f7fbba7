//! # Secure P2P Broadcast
//!
//! A peer-to-peer broadcast library for a fixed group of mutually trusting
//! nodes. Every node sends one payload per round to every other node and
//! receives one payload from each of them over plain TCP.
//!
//! ## Features
//!
//! - **Password Handshake**: A shared password seals a challenge/response
//!   exchange that hands every sender its own key and identifier
//! - **Two Ciphers**: AES-256-CBC with password-derived keys, or RSA-OAEP
//!   with per-node keypairs
//! - **Framing**: Payloads of any size are split into identifier-tagged
//!   packages and reassembled regardless of arrival order
//! - **Round Orchestration**: Server and client halves run concurrently,
//!   with one listening socket reused across rounds
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use secure_p2p_broadcast::{NodeConfig, Runner};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::new(
//!         "127.0.0.1:5000",
//!         vec!["127.0.0.1:5001".to_string()],
//!         "Test",
//!     );
//!     let mut runner = Runner::connect(config).await?;
//!     for (sender, reply) in runner.broadcast_str("Hello").await? {
//!         println!("{sender}: {reply}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: Key derivation and the symmetric and asymmetric ciphers
//! - [`session`]: The keyring filled in by the handshake
//! - [`transport`]: Package framing, reassembly and the client/server halves
//! - [`utils`]: Configuration and error handling
//! - [`app`]: The [`Runner`] that drives handshake and broadcast rounds

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod session;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::{Replies, Runner};
pub use crypto::{Cipher, CipherMode};
pub use session::Keyring;
pub use transport::{build_packages, Collector, Package};
pub use utils::{NodeConfig, P2pError, Result, TestMode};

/// Version information for the broadcast protocol
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Default configuration values
pub mod defaults {
    /// Default listening address
    pub const DEFAULT_HOST: &str = "127.0.0.1:5000";

    /// Default upper bound for one frame, header included
    pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1_024_000;

    /// Default width of identifiers and sequence numbers in bytes
    pub const DEFAULT_ID_WIDTH: usize = 3;

    /// Narrowest identifier width that still holds every challenge
    pub const MIN_ID_WIDTH: usize = 3;

    /// Widest identifier width that fits a `u32`
    pub const MAX_ID_WIDTH: usize = 4;

    /// Hash iterations for the password-derived master key
    pub const DEFAULT_SHA_ITERATIONS: u32 = 100_000;

    /// RSA modulus size
    pub const DEFAULT_RSA_BITS: usize = 2048;

    /// Smallest handshake challenge
    pub const MIN_CHALLENGE: u32 = 1_000_000;

    /// Largest handshake challenge
    pub const MAX_CHALLENGE: u32 = 9_999_999;

    /// First wait after a refused connection (ms)
    pub const DEFAULT_RETRY_BASE_MS: u64 = 2000;

    /// Added wait per further refusal (ms)
    pub const DEFAULT_RETRY_STEP_MS: u64 = 1000;

    /// Pause between two packages to the same peer (ms)
    pub const DEFAULT_SEND_INTERVAL_MS: u64 = 2000;

    /// Deadline for reading one message (ms)
    pub const DEFAULT_READ_TIMEOUT_MS: u64 = 60_000;
}

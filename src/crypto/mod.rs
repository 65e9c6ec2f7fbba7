//! Payload and handshake encryption.
//!
//! Two interchangeable strategies sit behind the [`Cipher`] trait: a
//! password-derived AES-256-CBC cipher and an RSA-OAEP cipher with per-node
//! keypairs. The strategy is chosen once when a node starts, see
//! [`select_cipher`].

pub mod asymmetric;
pub mod symmetric;

pub use asymmetric::*;
pub use symmetric::*;

use crate::utils::NodeConfig;
use std::sync::Arc;

/// Which strategy a [`Cipher`] implements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// Shared password key, AES-256-CBC
    Symmetric,
    /// Per-node RSA keypairs, OAEP
    Asymmetric,
}

/// Encryption capability shared by both strategies
///
/// Keys are opaque bytes: a 32-byte AES key for the symmetric strategy, a
/// DER public key for the asymmetric one.
pub trait Cipher: Send + Sync + std::fmt::Debug {
    /// Strategy implemented by this cipher
    fn mode(&self) -> CipherMode;

    /// Encrypt `plaintext` for the holder of `key`
    fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> crate::Result<Vec<u8>>;

    /// Decrypt `ciphertext` received under `key`
    fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> crate::Result<Vec<u8>>;

    /// Derive or hand out the key a peer confirming `confirmation` should use
    fn issue_key(&self, confirmation: u32) -> crate::Result<Vec<u8>>;
}

/// Pick the payload cipher for a run
///
/// Asymmetric mode needs this node's server keypair; without one the
/// symmetric `handshake` cipher is reused.
pub fn select_cipher(
    config: &NodeConfig,
    handshake: &SymmetricCipher,
    server_keys: Option<Arc<RsaKeyPair>>,
) -> Arc<dyn Cipher> {
    match (config.crypto.asymmetric, server_keys) {
        (true, Some(keys)) => Arc::new(AsymmetricCipher::new(keys)),
        (true, None) => {
            log::warn!("Asymmetric mode requested without a keypair, using the password key");
            Arc::new(handshake.clone())
        }
        (false, _) => Arc::new(handshake.clone()),
    }
}

/// Render key material for logs, hidden below verbose level 2
pub fn reveal(key: &[u8], verbose: u8) -> String {
    if verbose >= 2 {
        hex::encode(key)
    } else {
        format!("<{} bytes>", key.len())
    }
}

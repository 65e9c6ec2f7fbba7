//! RSA-OAEP encryption with per-node keypairs.

use super::{Cipher, CipherMode};
use crate::utils::{AuthError, CryptoError, Result};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;

/// OAEP overhead with SHA-256: two digests plus two bytes
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

/// An RSA keypair with its DER-encoded public half
#[derive(Clone)]
pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    public_der: Vec<u8>,
}

impl RsaKeyPair {
    /// Generate a fresh keypair
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyGeneration` if the modulus size is unusable
    pub fn generate(bits: usize) -> Result<Self> {
        let private =
            RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| CryptoError::KeyGeneration {
                reason: e.to_string(),
            })?;
        let public = RsaPublicKey::from(&private);
        let public_der = public
            .to_public_key_der()
            .map_err(|e| CryptoError::KeyGeneration {
                reason: e.to_string(),
            })?
            .as_bytes()
            .to_vec();

        Ok(Self {
            private,
            public,
            public_der,
        })
    }

    /// Public key as DER SubjectPublicKeyInfo, the form sent to peers
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// Public key
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Modulus size in bytes
    pub fn size(&self) -> usize {
        self.public.size()
    }
}

impl fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeyPair")
            .field("bits", &(self.size() * 8))
            .finish_non_exhaustive()
    }
}

/// Parse a peer's public key from DER
pub fn public_key_from_der(der: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(der).map_err(|e| {
        CryptoError::InvalidKey {
            reason: format!("public key: {e}"),
        }
        .into()
    })
}

/// RSA-OAEP (SHA-256) under this node's server keypair
///
/// Payloads longer than one OAEP block are split into blocks of at most
/// `k - 66` bytes, each encrypted to exactly `k` bytes.
#[derive(Debug, Clone)]
pub struct AsymmetricCipher {
    own: Arc<RsaKeyPair>,
}

impl AsymmetricCipher {
    /// Create a cipher that decrypts with `own` and hands out its public key
    pub fn new(own: Arc<RsaKeyPair>) -> Self {
        Self { own }
    }
}

impl Cipher for AsymmetricCipher {
    fn mode(&self) -> CipherMode {
        CipherMode::Asymmetric
    }

    /// Encrypt for the holder of the DER public key `key`
    fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        let recipient = public_key_from_der(key)?;
        let block = recipient
            .size()
            .checked_sub(OAEP_OVERHEAD)
            .filter(|b| *b > 0)
            .ok_or_else(|| CryptoError::InvalidKey {
                reason: format!("{} byte modulus too small for OAEP", recipient.size()),
            })?;

        let mut rng = OsRng;
        let mut out = Vec::with_capacity((plaintext.len() / block + 1) * recipient.size());
        // An empty message still produces one block
        let chunks: Vec<&[u8]> = if plaintext.is_empty() {
            vec![plaintext]
        } else {
            plaintext.chunks(block).collect()
        };

        for chunk in chunks {
            let encrypted = recipient
                .encrypt(&mut rng, Oaep::new::<Sha256>(), chunk)
                .map_err(|e| CryptoError::Encryption {
                    reason: e.to_string(),
                })?;
            out.extend_from_slice(&encrypted);
        }

        Ok(out)
    }

    /// Decrypt with this node's private key; `key` is not consulted
    fn decrypt(&self, ciphertext: &[u8], _key: &[u8]) -> Result<Vec<u8>> {
        let k = self.own.size();
        if ciphertext.is_empty() || ciphertext.len() % k != 0 {
            return Err(AuthError::WrongKey {
                reason: format!("{} bytes is not a multiple of {k}", ciphertext.len()),
            }
            .into());
        }

        let mut out = Vec::with_capacity(ciphertext.len());
        for block in ciphertext.chunks_exact(k) {
            let plain = self
                .own
                .private
                .decrypt(Oaep::new::<Sha256>(), block)
                .map_err(|e| {
                    log::warn!("OAEP decryption failed: {e}");
                    AuthError::WrongKey {
                        reason: e.to_string(),
                    }
                })?;
            out.extend_from_slice(&plain);
        }

        Ok(out)
    }

    fn issue_key(&self, _confirmation: u32) -> Result<Vec<u8>> {
        Ok(self.own.public_key_der().to_vec())
    }
}

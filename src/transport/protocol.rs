//! Handshake message definitions.
//!
//! Before encryption under the password key, a challenge is
//!
//! ```text
//! challenge(W) [client public key DER]
//! ```
//!
//! and the reply is
//!
//! ```text
//! confirmation(W) key bytes
//! ```
//!
//! where `confirmation = challenge + 1` becomes the identifier the
//! challenger tags its packages with for the rest of the run.

use super::{decode_uint, encode_uint};
use crate::crypto::{Cipher, SymmetricCipher, KEY_LENGTH};
use crate::defaults::{MAX_CHALLENGE, MIN_CHALLENGE};
use crate::utils::{AuthError, FrameError, Result};
use rand::Rng;
use std::fmt;

/// AES block size; sealed messages are padded to a multiple of it
const AES_BLOCK: usize = 16;

/// Upper bound on the SubjectPublicKeyInfo framing around an RSA modulus
const SPKI_OVERHEAD: usize = 48;

/// Largest sealed handshake message a node sends or receives
///
/// Replies carry the issued key: an AES key, or the responder's DER
/// public key in asymmetric mode, where challenges carry a public key of
/// the same size. PKCS#7 always adds at least one byte.
pub fn max_handshake_size(width: usize, asymmetric: bool, rsa_bits: usize) -> usize {
    let key = if asymmetric {
        (rsa_bits + 7) / 8 + SPKI_OVERHEAD
    } else {
        KEY_LENGTH
    };
    ((width + key) / AES_BLOCK + 1) * AES_BLOCK
}

/// A handshake challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Random number in `MIN_CHALLENGE..=MAX_CHALLENGE`
    pub number: u32,
    /// Challenger's public key, asymmetric mode only
    pub public_key: Option<Vec<u8>>,
}

impl Challenge {
    /// Draw a fresh challenge
    pub fn random(public_key: Option<Vec<u8>>) -> Self {
        Self {
            number: rand::thread_rng().gen_range(MIN_CHALLENGE..=MAX_CHALLENGE),
            public_key,
        }
    }

    /// The number a responder must answer with
    pub fn confirmation(&self) -> u32 {
        self.number + 1
    }

    /// Encode before encryption
    pub fn to_bytes(&self, width: usize) -> Result<Vec<u8>> {
        let mut bytes = encode_uint(self.number, width)?;
        if let Some(key) = &self.public_key {
            bytes.extend_from_slice(key);
        }
        Ok(bytes)
    }

    /// Decode and range-check a decrypted challenge
    ///
    /// With `with_public_key` everything after the number is the
    /// challenger's public key; otherwise the message must be exactly the
    /// number.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::ChallengeOutOfRange` for anything that is not a
    /// valid challenge, which is what a wrong password usually produces
    pub fn from_bytes(bytes: &[u8], width: usize, with_public_key: bool) -> Result<Self> {
        let well_formed = if with_public_key {
            bytes.len() > width
        } else {
            bytes.len() == width
        };

        let number = if bytes.len() >= width {
            decode_uint(&bytes[..width])
        } else {
            0
        };

        if !well_formed || !(MIN_CHALLENGE..=MAX_CHALLENGE).contains(&number) {
            return Err(AuthError::ChallengeOutOfRange {
                value: u64::from(number),
            }
            .into());
        }

        Ok(Self {
            number,
            public_key: with_public_key.then(|| bytes[width..].to_vec()),
        })
    }
}

/// A responder's answer to a challenge
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    /// Challenge plus one
    pub confirmation: u32,
    /// Key the challenger must use when sending to the responder
    pub key: Vec<u8>,
}

impl fmt::Debug for HandshakeReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeReply")
            .field("confirmation", &self.confirmation)
            .field("key_len", &self.key.len())
            .finish()
    }
}

impl HandshakeReply {
    /// Encode before encryption
    pub fn to_bytes(&self, width: usize) -> Result<Vec<u8>> {
        let mut bytes = encode_uint(self.confirmation, width)?;
        bytes.extend_from_slice(&self.key);
        Ok(bytes)
    }

    /// Decode a decrypted reply
    pub fn from_bytes(bytes: &[u8], width: usize) -> Result<Self> {
        if bytes.len() <= width {
            return Err(FrameError::TooShort {
                len: bytes.len(),
                min: width + 1,
            }
            .into());
        }

        Ok(Self {
            confirmation: decode_uint(&bytes[..width]),
            key: bytes[width..].to_vec(),
        })
    }
}

/// The password key every handshake message is sealed with
#[derive(Clone)]
pub struct HandshakeCipher {
    cipher: SymmetricCipher,
    key: [u8; KEY_LENGTH],
}

impl HandshakeCipher {
    /// Combine the run-wide symmetric cipher with the master key
    pub fn new(cipher: SymmetricCipher, key: [u8; KEY_LENGTH]) -> Self {
        Self { cipher, key }
    }

    /// Encrypt under the master key
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher.encrypt(plaintext, &self.key)
    }

    /// Decrypt under the master key
    pub fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.cipher.decrypt(ciphertext, &self.key)
    }

    /// The underlying symmetric cipher
    pub fn cipher(&self) -> &SymmetricCipher {
        &self.cipher
    }
}

impl fmt::Debug for HandshakeCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeCipher").finish_non_exhaustive()
    }
}

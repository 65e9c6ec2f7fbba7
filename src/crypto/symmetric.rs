//! Password-derived AES-256-CBC encryption.
//!
//! Every participant derives the same master key from the shared password
//! and the same IV from the shared address list, so nothing has to be
//! negotiated before the first encrypted message. The password hash is
//! deliberately slow; per-peer keys issued during the handshake skip the
//! iterated step.

use super::{Cipher, CipherMode};
use crate::utils::{AuthError, CryptoError, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::Md5;
use rand::Rng;
use sha2::{Digest, Sha256, Sha512};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES-256 key length in bytes
pub const KEY_LENGTH: usize = 32;

/// CBC initialization vector length in bytes
pub const IV_LENGTH: usize = 16;

/// Derive a 256-bit key from a password
///
/// SHA-512 is seeded with the password, then `iterations` times the running
/// digest is absorbed back into the same hash state. The key is SHA-256 of
/// the final SHA-512 digest. With `iterations == 0` this is a plain
/// SHA-256(SHA-512(password)).
///
/// # Example
///
/// ```rust
/// use secure_p2p_broadcast::crypto::derive_key;
///
/// let key = derive_key("Test", 1_000);
/// assert_eq!(key, derive_key("Test", 1_000));
/// assert_ne!(key, derive_key("Test", 0));
/// ```
pub fn derive_key(password: &str, iterations: u32) -> [u8; KEY_LENGTH] {
    let mut hasher = Sha512::new();
    hasher.update(password.as_bytes());

    for _ in 0..iterations {
        let digest = hasher.clone().finalize();
        hasher.update(digest);
    }

    Sha256::digest(hasher.finalize()).into()
}

/// Derive the IV shared by every participant of a run
///
/// The input is the sorted list of all addresses (peers and own host)
/// rendered as `['a:1', 'b:2']`, so every node arrives at the same bytes
/// regardless of how its own peer list is ordered.
pub fn derive_iv(host: &str, peers: &[String]) -> [u8; IV_LENGTH] {
    let mut addresses: Vec<&str> = peers.iter().map(String::as_str).collect();
    addresses.push(host);
    addresses.sort_unstable();

    let rendered = format!(
        "[{}]",
        addresses
            .iter()
            .map(|a| format!("'{a}'"))
            .collect::<Vec<_>>()
            .join(", ")
    );

    Md5::digest(rendered.as_bytes()).into()
}

/// AES-256-CBC with PKCS#7 padding under a run-wide IV
#[derive(Debug, Clone)]
pub struct SymmetricCipher {
    iv: [u8; IV_LENGTH],
    ignore_wrong_keys: bool,
}

impl SymmetricCipher {
    /// Create a cipher using the shared IV
    ///
    /// With `ignore_wrong_keys` a failed padding check yields an empty
    /// plaintext instead of [`AuthError::BadPadding`].
    pub fn new(iv: [u8; IV_LENGTH], ignore_wrong_keys: bool) -> Self {
        Self {
            iv,
            ignore_wrong_keys,
        }
    }

    /// Build the cipher for a host and its peer list
    pub fn for_peers(host: &str, peers: &[String], ignore_wrong_keys: bool) -> Self {
        Self::new(derive_iv(host, peers), ignore_wrong_keys)
    }

    /// The shared initialization vector
    pub fn iv(&self) -> &[u8; IV_LENGTH] {
        &self.iv
    }
}

impl Cipher for SymmetricCipher {
    fn mode(&self) -> CipherMode {
        CipherMode::Symmetric
    }

    fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        let encryptor = Aes256CbcEnc::new_from_slices(key, &self.iv).map_err(|_| {
            CryptoError::InvalidKey {
                reason: format!("expected {KEY_LENGTH} byte AES key, got {}", key.len()),
            }
        })?;

        Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        let decryptor = Aes256CbcDec::new_from_slices(key, &self.iv).map_err(|_| {
            CryptoError::InvalidKey {
                reason: format!("expected {KEY_LENGTH} byte AES key, got {}", key.len()),
            }
        })?;

        match decryptor.decrypt_padded_vec_mut::<Pkcs7>(ciphertext) {
            Ok(plaintext) => Ok(plaintext),
            Err(_) if self.ignore_wrong_keys => {
                log::warn!(
                    "Padding check failed on {} bytes, ignoring wrong key",
                    ciphertext.len()
                );
                Ok(Vec::new())
            }
            Err(_) => {
                log::error!("Padding check failed on {} bytes", ciphertext.len());
                Err(AuthError::BadPadding {
                    reason: "wrong password or key".to_string(),
                }
                .into())
            }
        }
    }

    /// A fresh key derived from the confirmation plus a random salt
    fn issue_key(&self, confirmation: u32) -> Result<Vec<u8>> {
        let salt: u32 = rand::thread_rng()
            .gen_range(crate::defaults::MIN_CHALLENGE..=crate::defaults::MAX_CHALLENGE);
        let seed = u64::from(confirmation) + u64::from(salt);

        Ok(derive_key(&seed.to_string(), 0).to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::P2pError;

    fn peers() -> Vec<String> {
        vec!["127.0.0.1:5002".to_string(), "127.0.0.1:5001".to_string()]
    }

    #[test]
    fn test_key_derivation() {
        let key = derive_key("Test", 500);
        assert_eq!(key.len(), KEY_LENGTH);
        assert_eq!(key, derive_key("Test", 500));
        assert_ne!(key, derive_key("Test", 501));
        assert_ne!(key, derive_key("test", 500));
    }

    #[test]
    fn test_zero_iterations_is_plain_double_hash() {
        let expected: [u8; KEY_LENGTH] = Sha256::digest(Sha512::digest(b"Test")).into();
        assert_eq!(derive_key("Test", 0), expected);
    }

    #[test]
    fn test_iv_independent_of_peer_order() {
        let a = derive_iv("127.0.0.1:5000", &peers());
        let mut reversed = peers();
        reversed.reverse();
        assert_eq!(a, derive_iv("127.0.0.1:5000", &reversed));

        // Same address set seen from another node
        let other = vec!["127.0.0.1:5000".to_string(), "127.0.0.1:5002".to_string()];
        assert_eq!(a, derive_iv("127.0.0.1:5001", &other));

        let rendered = "['127.0.0.1:5000', '127.0.0.1:5001', '127.0.0.1:5002']";
        let expected: [u8; IV_LENGTH] = Md5::digest(rendered.as_bytes()).into();
        assert_eq!(a, expected);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = SymmetricCipher::for_peers("127.0.0.1:5000", &peers(), false);
        let key = derive_key("Test", 10);

        for message in [&b""[..], &b"Hello World!"[..], &[0xAB; 4096][..]] {
            let encrypted = cipher.encrypt(message, &key).unwrap();
            assert_eq!(encrypted.len() % 16, 0);
            assert_eq!(cipher.decrypt(&encrypted, &key).unwrap(), message);
        }
    }

    #[test]
    fn test_wrong_key_is_auth_failure() {
        let cipher = SymmetricCipher::for_peers("127.0.0.1:5000", &peers(), false);
        let encrypted = cipher.encrypt(b"Hello World!", &derive_key("Test", 10)).unwrap();

        // A wrong key passes the padding check about once in 256 tries
        let failures = ["Wrong", "wrong", "Test ", "tEST", "1234", "Tset"]
            .iter()
            .map(|password| cipher.decrypt(&encrypted, &derive_key(password, 10)))
            .filter(|r| matches!(r, Err(P2pError::Auth(AuthError::BadPadding { .. }))))
            .count();
        assert!(failures >= 5);

        let truncated = cipher.decrypt(&encrypted[..15], &derive_key("Test", 10));
        assert!(matches!(truncated, Err(P2pError::Auth(AuthError::BadPadding { .. }))));
    }

    #[test]
    fn test_wrong_key_ignored() {
        let cipher = SymmetricCipher::for_peers("127.0.0.1:5000", &peers(), true);
        let encrypted = cipher.encrypt(b"Hello World!", &derive_key("Test", 10)).unwrap();

        for password in ["Wrong", "wrong", "Test ", "tEST"] {
            let result = cipher.decrypt(&encrypted, &derive_key(password, 10)).unwrap();
            assert_ne!(result, b"Hello World!");
        }
        assert!(cipher.decrypt(&encrypted[..15], &derive_key("Test", 10)).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_key_length() {
        let cipher = SymmetricCipher::for_peers("127.0.0.1:5000", &peers(), false);
        assert!(matches!(
            cipher.encrypt(b"data", &[0u8; 16]),
            Err(P2pError::Crypto(CryptoError::InvalidKey { .. }))
        ));
    }

    #[test]
    fn test_issued_keys_are_fresh() {
        let cipher = SymmetricCipher::for_peers("127.0.0.1:5000", &peers(), false);
        let first = cipher.issue_key(1_234_568).unwrap();
        let second = cipher.issue_key(1_234_568).unwrap();

        assert_eq!(first.len(), KEY_LENGTH);
        // Salts collide with probability ~1e-7
        assert_ne!(first, second);
    }
}

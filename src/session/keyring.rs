//! Per-run store of negotiated keys.
//!
//! The handshake fills two maps: `reception` holds the key material used to
//! decrypt data arriving from a peer (keyed by the identifier that peer tags
//! its packages with), `submission` holds the identifier and key used when
//! sending to a peer address. A fully negotiated keyring has one entry of
//! each kind per peer.

use crate::crypto::{RsaKeyPair, IV_LENGTH};
use crate::utils::{KeyringError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Identifier and key used when sending to one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionKey {
    /// Identifier the peer confirmed during the handshake
    pub identifier: u32,
    /// Key material to encrypt with
    pub key: Vec<u8>,
}

/// One negotiated keyring entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEntry {
    /// Key for data arriving with `identifier`
    Reception {
        /// Identifier the sender tags its packages with
        identifier: u32,
        /// Key material issued to or received from that sender
        key: Vec<u8>,
    },
    /// Identifier and key for sending to `address`
    Submission {
        /// Peer address (`address:port`)
        address: String,
        /// Confirmed identifier and key
        key: SubmissionKey,
    },
}

/// Negotiated keys for one run, never persisted
#[derive(Debug, Default, Clone)]
pub struct Keyring {
    reception: HashMap<u32, Vec<u8>>,
    submission: HashMap<String, SubmissionKey>,
    server_keys: Option<Arc<RsaKeyPair>>,
    client_keys: Option<Arc<RsaKeyPair>>,
    initialization_vector: Option<[u8; IV_LENGTH]>,
}

impl Keyring {
    /// Create an empty keyring
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a reception or submission entry, replacing an older one
    pub fn add_peer(&mut self, entry: PeerEntry) {
        match entry {
            PeerEntry::Reception { identifier, key } => {
                if self.reception.insert(identifier, key).is_some() {
                    log::warn!("Replaced reception key for identifier {identifier}");
                }
            }
            PeerEntry::Submission { address, key } => {
                if self.submission.insert(address.clone(), key).is_some() {
                    log::warn!("Replaced submission key for {address}");
                }
            }
        }
    }

    /// Merge the entries negotiated by one handshake round
    pub fn extend<I: IntoIterator<Item = PeerEntry>>(&mut self, entries: I) {
        for entry in entries {
            self.add_peer(entry);
        }
    }

    /// Key for data arriving tagged with `identifier`
    ///
    /// # Errors
    ///
    /// Returns `KeyringError::PeerUnknown` if no key was negotiated
    pub fn for_reception(&self, identifier: u32) -> Result<&[u8]> {
        self.reception
            .get(&identifier)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                KeyringError::PeerUnknown {
                    peer: identifier.to_string(),
                }
                .into()
            })
    }

    /// Identifier and key for sending to `address`
    ///
    /// # Errors
    ///
    /// Returns `KeyringError::PeerUnknown` if no key was negotiated
    pub fn for_submission(&self, address: &str) -> Result<&SubmissionKey> {
        self.submission.get(address).ok_or_else(|| {
            KeyringError::PeerUnknown {
                peer: address.to_string(),
            }
            .into()
        })
    }

    /// Reception plus submission entries
    pub fn len(&self) -> usize {
        self.reception.len() + self.submission.len()
    }

    /// True before the handshake
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of reception entries
    pub fn reception_len(&self) -> usize {
        self.reception.len()
    }

    /// Number of submission entries
    pub fn submission_len(&self) -> usize {
        self.submission.len()
    }

    /// Identifiers with a reception key
    pub fn reception_identifiers(&self) -> impl Iterator<Item = u32> + '_ {
        self.reception.keys().copied()
    }

    /// Fail unless every one of `peer_count` peers has both entries
    pub fn ensure_complete(&self, peer_count: usize) -> Result<()> {
        self.check(2 * peer_count, self.len())
    }

    /// Fail unless every peer can be sent to
    pub fn ensure_submission(&self, peer_count: usize) -> Result<()> {
        self.check(peer_count, self.submission.len())
    }

    /// Fail unless every peer can be received from
    pub fn ensure_reception(&self, peer_count: usize) -> Result<()> {
        self.check(peer_count, self.reception.len())
    }

    fn check(&self, expected: usize, actual: usize) -> Result<()> {
        if actual == expected {
            Ok(())
        } else {
            Err(KeyringError::Incomplete { expected, actual }.into())
        }
    }

    /// Store this node's RSA keypairs
    pub fn set_keypairs(&mut self, server: Arc<RsaKeyPair>, client: Arc<RsaKeyPair>) {
        self.server_keys = Some(server);
        self.client_keys = Some(client);
    }

    /// Keypair whose public half is handed to peers that send to us
    pub fn server_keys(&self) -> Option<&Arc<RsaKeyPair>> {
        self.server_keys.as_ref()
    }

    /// Keypair whose public half accompanies our handshake challenges
    pub fn client_keys(&self) -> Option<&Arc<RsaKeyPair>> {
        self.client_keys.as_ref()
    }

    /// Store the run-wide IV
    pub fn set_initialization_vector(&mut self, iv: [u8; IV_LENGTH]) {
        self.initialization_vector = Some(iv);
    }

    /// The run-wide IV, symmetric mode only
    pub fn initialization_vector(&self) -> Option<&[u8; IV_LENGTH]> {
        self.initialization_vector.as_ref()
    }
}

//! Outbound half of a round.
//!
//! Peers are served one after another. A failure toward one peer is logged
//! and the client moves on; only a wrong shared password stops the round.

use super::net::{connect_with_retry, read_message, write_message};
use super::protocol::{Challenge, HandshakeCipher, HandshakeReply};
use super::build_packages;
use crate::crypto::{reveal, Cipher};
use crate::session::{Keyring, PeerEntry, SubmissionKey};
use crate::utils::{AuthError, NodeConfig, Result};
use std::sync::Arc;

/// Connects to every peer for a handshake or a broadcast
#[derive(Debug, Clone)]
pub struct Client {
    /// Run configuration
    config: Arc<NodeConfig>,
    /// Password key sealing handshake messages
    handshake: HandshakeCipher,
    /// Payload cipher selected for the run
    cipher: Arc<dyn Cipher>,
}

impl Client {
    /// Create a client for one node
    pub fn new(config: Arc<NodeConfig>, handshake: HandshakeCipher, cipher: Arc<dyn Cipher>) -> Self {
        Self {
            config,
            handshake,
            cipher,
        }
    }

    /// Challenge every peer and collect the submission keys they issue
    ///
    /// `public_key` accompanies each challenge in asymmetric mode. Peers
    /// that cannot be reached or fail the challenge are left out of the
    /// result.
    ///
    /// # Errors
    ///
    /// Only errors that must end the run, such as a reply that does not
    /// decrypt under the shared password
    pub async fn handshake(&self, public_key: Option<&[u8]>) -> Result<Vec<PeerEntry>> {
        let mut entries = Vec::with_capacity(self.config.peer_count());

        for peer in &self.config.network.peers {
            match self.handshake_peer(peer, public_key).await {
                Ok(entry) => entries.push(entry),
                Err(e) if e.is_fatal() => {
                    log::error!("Handshake with {peer} failed: {e}");
                    return Err(e);
                }
                Err(e) => log::warn!("Dropping peer {peer}: {e}"),
            }
        }

        log::info!(
            "Handshake client confirmed {}/{} peers",
            entries.len(),
            self.config.peer_count()
        );
        Ok(entries)
    }

    async fn handshake_peer(&self, peer: &str, public_key: Option<&[u8]>) -> Result<PeerEntry> {
        let width = self.config.network.id_width;
        let challenge = Challenge::random(public_key.map(<[u8]>::to_vec));
        let request = self.handshake.seal(&challenge.to_bytes(width)?)?;

        let mut stream = connect_with_retry(peer, &self.config.timing).await?;
        log::debug!("Sending challenge to {peer}");
        write_message(&mut stream, &request, peer).await?;

        let response = read_message(
            &mut stream,
            self.config.network.max_chunk_size,
            self.config.timing.read_timeout(),
            peer,
        )
        .await?;

        let plain = self.handshake.open(&response)?;
        let reply = match HandshakeReply::from_bytes(&plain, width) {
            Ok(reply) => reply,
            // Wrong keys are only tolerated with ignore_wrong_keys, and they yield nothing
            Err(_) if plain.is_empty() => HandshakeReply {
                confirmation: 0,
                key: Vec::new(),
            },
            Err(e) => return Err(e),
        };

        if reply.confirmation != challenge.confirmation() {
            return Err(AuthError::ChallengeMismatch {
                peer: peer.to_string(),
                expected: challenge.confirmation(),
                received: reply.confirmation,
            }
            .into());
        }

        log::debug!(
            "Peer {peer} confirmed {} with key {}",
            reply.confirmation,
            reveal(&reply.key, self.config.logging.verbose)
        );

        Ok(PeerEntry::Submission {
            address: peer.to_string(),
            key: SubmissionKey {
                identifier: reply.confirmation,
                key: reply.key,
            },
        })
    }

    /// Send `payload` to every peer, returning how many peers got all of it
    ///
    /// Each peer gets the payload encrypted under its own submission key,
    /// framed, and delivered one package per connection with a pause
    /// between packages.
    pub async fn broadcast(&self, keyring: &Keyring, payload: &[u8]) -> usize {
        let mut delivered = 0;

        for peer in &self.config.network.peers {
            match self.send_to_peer(keyring, peer, payload).await {
                Ok(count) => {
                    log::debug!("Sent {count} packages to {peer}");
                    delivered += 1;
                }
                Err(e) => log::error!("Abandoning send to {peer}: {e}"),
            }
        }

        log::info!(
            "Broadcast of {} bytes delivered to {delivered}/{} peers",
            payload.len(),
            self.config.peer_count()
        );
        delivered
    }

    async fn send_to_peer(&self, keyring: &Keyring, peer: &str, payload: &[u8]) -> Result<usize> {
        let entry = keyring.for_submission(peer)?;
        let encrypted = self.cipher.encrypt(payload, &entry.key)?;
        let packages = build_packages(
            self.config.network.id_width,
            self.config.network.max_chunk_size,
            entry.identifier,
            &encrypted,
            self.config.logging.verbose,
        )?;

        for (index, package) in packages.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.timing.send_interval()).await;
            }

            let frame = package.to_wire()?;
            if self.config.logging.verbose >= 3 {
                log::trace!("Frame {} to {peer}: {}", package.sequence, hex::encode(&frame));
            }

            let mut stream = connect_with_retry(peer, &self.config.timing).await?;
            write_message(&mut stream, &frame, peer).await?;
        }

        Ok(packages.len())
    }
}

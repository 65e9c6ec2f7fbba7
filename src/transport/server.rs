//! Inbound half of a round.
//!
//! The server accepts one connection at a time and handles it to the end
//! before accepting the next. The listening socket is owned by the caller
//! and survives across rounds, so connections a faster peer opens for the
//! next round wait in the backlog instead of being reset.

use super::net::{bind_reusable, read_message, write_message};
use super::protocol::{Challenge, HandshakeCipher, HandshakeReply};
use super::{Collector, Package};
use crate::crypto::{reveal, Cipher};
use crate::session::{Keyring, PeerEntry};
use crate::utils::{ConfigError, NodeConfig, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// Result of answering the handshake challenges of every peer
#[derive(Debug, Default)]
pub struct HandshakeOutcome {
    /// One reception entry per confirmed challenger
    pub entries: Vec<PeerEntry>,
    /// Broadcast frames that arrived before the handshake ended
    pub carried: Vec<Package>,
}

/// Result of one broadcast round
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    /// Decrypted payload per sender identifier
    pub results: HashMap<u32, Vec<u8>>,
    /// Frames that belong to the next round
    pub carried: Vec<Package>,
}

/// Accepts connections for a handshake or a broadcast round
#[derive(Debug, Clone)]
pub struct Server {
    config: Arc<NodeConfig>,
    handshake: HandshakeCipher,
    cipher: Arc<dyn Cipher>,
}

impl Server {
    /// Create a server for one node
    pub fn new(config: Arc<NodeConfig>, handshake: HandshakeCipher, cipher: Arc<dyn Cipher>) -> Self {
        Self {
            config,
            handshake,
            cipher,
        }
    }

    /// Bind the node's host address
    pub async fn listen(&self) -> Result<TcpListener> {
        bind_reusable(&self.config.network.host).await
    }

    fn expected_clients(&self) -> Result<usize> {
        match self.config.peer_count() {
            0 => Err(ConfigError::NoPeers.into()),
            n => Ok(n),
        }
    }

    async fn next_message(&self, listener: &TcpListener) -> Option<(TcpStream, String, Vec<u8>)> {
        let (mut stream, address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Accept failed: {e}");
                return None;
            }
        };
        let address = address.to_string();

        match read_message(
            &mut stream,
            self.config.network.max_chunk_size,
            self.config.timing.read_timeout(),
            &address,
        )
        .await
        {
            Ok(message) => {
                if self.config.logging.verbose >= 3 {
                    log::trace!("Received from {address}: {}", hex::encode(&message));
                }
                Some((stream, address, message))
            }
            Err(e) => {
                log::warn!("Dropping connection from {address}: {e}");
                None
            }
        }
    }

    /// Answer challenges until every peer has been confirmed
    ///
    /// Each challenger gets a reply sealed under the password key carrying
    /// its confirmation number and the key it must send with. Messages that
    /// are not challenges but valid package frames are kept for the first
    /// broadcast round.
    ///
    /// # Errors
    ///
    /// `ConfigError::NoPeers` without peers, or an authentication failure
    /// on the shared password path when wrong keys are not ignored
    pub async fn run_handshake(&self, listener: &TcpListener) -> Result<HandshakeOutcome> {
        let expected = self.expected_clients()?;
        let width = self.config.network.id_width;
        let mut reception: HashMap<u32, Vec<u8>> = HashMap::new();
        let mut carried = Vec::new();

        while reception.len() < expected {
            let Some((mut stream, address, message)) = self.next_message(listener).await else {
                continue;
            };

            match self.answer_challenge(&message) {
                Ok((confirmation, stored, reply)) => {
                    if let Err(e) = write_message(&mut stream, &reply, &address).await {
                        log::warn!("Reply to {address} failed: {e}");
                        continue;
                    }
                    log::debug!(
                        "Confirmed {confirmation} for {address}, key {}",
                        reveal(&stored, self.config.logging.verbose)
                    );
                    if reception.insert(confirmation, stored).is_some() {
                        log::warn!("Confirmation {confirmation} issued twice");
                    }
                }
                Err(e) => match Package::from_wire(&message, width) {
                    Ok(package) => {
                        log::debug!(
                            "Keeping early package {} from {} for the first broadcast",
                            package.sequence,
                            package.identifier
                        );
                        carried.push(package);
                    }
                    Err(_) if e.is_fatal() => {
                        log::error!("Challenge from {address} failed: {e}");
                        return Err(e);
                    }
                    Err(_) => log::warn!("Ignoring challenge from {address}: {e}"),
                },
            }
        }

        log::info!("Handshake server confirmed {expected} peers");
        Ok(HandshakeOutcome {
            entries: reception
                .into_iter()
                .map(|(identifier, key)| PeerEntry::Reception { identifier, key })
                .collect(),
            carried,
        })
    }

    /// Decrypt a challenge and build the sealed reply
    ///
    /// Returns the confirmation, the key to store for reception and the
    /// reply bytes.
    fn answer_challenge(&self, message: &[u8]) -> Result<(u32, Vec<u8>, Vec<u8>)> {
        let width = self.config.network.id_width;
        let plain = self.handshake.open(message)?;
        let challenge = Challenge::from_bytes(&plain, width, self.config.crypto.asymmetric)?;
        let confirmation = challenge.confirmation();

        let issued = self.cipher.issue_key(confirmation)?;
        // Asymmetric peers are remembered by their public key
        let stored = challenge.public_key.unwrap_or_else(|| issued.clone());

        let reply = HandshakeReply {
            confirmation,
            key: issued,
        };
        let sealed = self.handshake.seal(&reply.to_bytes(width)?)?;
        Ok((confirmation, stored, sealed))
    }

    /// Collect one payload from every peer and decrypt it
    ///
    /// `carried` holds frames left over from the previous round; frames for
    /// a sender that already completed this round are handed on to the
    /// next one.
    ///
    /// # Errors
    ///
    /// `ConfigError::NoPeers` without peers, or a fatal decryption failure
    pub async fn run_broadcast(
        &self,
        listener: &TcpListener,
        keyring: &Keyring,
        carried: Vec<Package>,
    ) -> Result<BroadcastOutcome> {
        let expected = self.expected_clients()?;
        let width = self.config.network.id_width;
        let mut collector = Collector::new(expected);
        let mut outcome = BroadcastOutcome::default();

        for package in carried {
            self.accept_package(package, keyring, &mut collector, &mut outcome)?;
        }

        while !collector.is_finished() {
            let Some((_stream, address, frame)) = self.next_message(listener).await else {
                continue;
            };

            match Package::from_wire(&frame, width) {
                Ok(package) => self.accept_package(package, keyring, &mut collector, &mut outcome)?,
                Err(e) => log::warn!("Dropping frame from {address}: {e}"),
            }
        }

        log::info!(
            "Broadcast server collected {}/{expected} payloads",
            outcome.results.len()
        );
        Ok(outcome)
    }

    fn accept_package(
        &self,
        package: Package,
        keyring: &Keyring,
        collector: &mut Collector,
        outcome: &mut BroadcastOutcome,
    ) -> Result<()> {
        let identifier = package.identifier;

        if collector.is_complete(identifier) {
            log::debug!("Package from {identifier} belongs to the next round");
            outcome.carried.push(package);
            return Ok(());
        }

        let key = match keyring.for_reception(identifier) {
            Ok(key) => key,
            Err(e) => {
                log::warn!("Dropping package {}: {e}", package.sequence);
                return Ok(());
            }
        };

        if collector.load([package]).is_empty() {
            return Ok(());
        }

        let encrypted = collector.get_payload(identifier);
        match self.cipher.decrypt(&encrypted, key) {
            Ok(payload) => {
                log::debug!("Payload from {identifier}: {} bytes", payload.len());
                outcome.results.insert(identifier, payload);
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                log::error!("Cannot decrypt payload from {identifier}: {e}");
                Err(e)
            }
            Err(e) => {
                log::warn!("Discarding payload from {identifier}: {e}");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_key, SymmetricCipher};
    use crate::session::SubmissionKey;
    use crate::transport::{build_packages, Client};

    fn config(host: &str, peers: Vec<String>) -> NodeConfig {
        let mut config = NodeConfig::new(host, peers, "Test");
        config.crypto.asymmetric = false;
        config.crypto.sha_iterations = 10;
        config.network.max_chunk_size = 128;
        config.timing.retry_base_ms = 10;
        config.timing.retry_step_ms = 10;
        config.timing.send_interval_ms = 1;
        config.timing.read_timeout_ms = 2_000;
        config
    }

    fn parts(config: &NodeConfig, password: &str) -> (HandshakeCipher, Arc<dyn Cipher>) {
        let symmetric = SymmetricCipher::for_peers(
            &config.network.host,
            &config.network.peers,
            config.crypto.ignore_wrong_keys,
        );
        (
            HandshakeCipher::new(symmetric.clone(), derive_key(password, 10)),
            Arc::new(symmetric),
        )
    }

    #[tokio::test]
    async fn test_handshake_server_confirms_client() {
        let listener = bind_reusable("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap().to_string();
        let client_addr = "127.0.0.1:1".to_string();

        let server_config = Arc::new(config(&server_addr, vec![client_addr.clone()]));
        let client_config = Arc::new(config(&client_addr, vec![server_addr.clone()]));
        let (handshake, cipher) = parts(&server_config, "Test");
        let server = Server::new(server_config, handshake.clone(), cipher.clone());
        let client = Client::new(client_config, handshake, cipher);

        let task = tokio::spawn(async move { server.run_handshake(&listener).await });
        let submissions = client.handshake(None).await.unwrap();
        let outcome = task.await.unwrap().unwrap();

        assert_eq!(submissions.len(), 1);
        assert_eq!(outcome.entries.len(), 1);
        let (PeerEntry::Submission { key, .. }, PeerEntry::Reception { identifier, key: stored }) =
            (&submissions[0], &outcome.entries[0])
        else {
            panic!("unexpected entries");
        };
        assert_eq!(key.identifier, *identifier);
        assert_eq!(&key.key, stored);
    }

    #[tokio::test]
    async fn test_undecryptable_challenge_is_fatal() {
        let listener = bind_reusable("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap().to_string();
        let config = Arc::new(config(&server_addr, vec!["127.0.0.1:1".to_string()]));
        let (handshake, cipher) = parts(&config, "Test");
        let server = Server::new(config, handshake, cipher);

        let task = tokio::spawn(async move { server.run_handshake(&listener).await });

        // Neither a whole number of AES blocks nor a valid frame
        let mut stream = TcpStream::connect(server_addr.as_str()).await.unwrap();
        write_message(&mut stream, b"not a handshake message", &server_addr)
            .await
            .unwrap();

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(crate::utils::P2pError::Auth(crate::utils::AuthError::BadPadding { .. }))
        ));
    }

    #[tokio::test]
    async fn test_early_package_carried_into_broadcast() {
        let listener = bind_reusable("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap().to_string();
        let client_addr = "127.0.0.1:1".to_string();
        let server_config = Arc::new(config(&server_addr, vec![client_addr.clone()]));
        let client_config = Arc::new(config(&client_addr, vec![server_addr.clone()]));
        let (handshake, cipher) = parts(&server_config, "Test");
        let server = Server::new(server_config, handshake.clone(), cipher.clone());
        let client = Client::new(client_config, handshake, cipher);

        let early = Package::new(1_000_001, 1, b"early".to_vec(), true, 3);
        let frame = early.to_wire().unwrap();
        let mut stream = TcpStream::connect(server_addr.as_str()).await.unwrap();
        write_message(&mut stream, &frame, &server_addr).await.unwrap();

        let task = tokio::spawn(async move { server.run_handshake(&listener).await });
        client.handshake(None).await.unwrap();
        let outcome = task.await.unwrap().unwrap();

        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.carried, vec![early]);
    }

    #[tokio::test]
    async fn test_broadcast_server_decrypts_and_carries_over() {
        let listener = bind_reusable("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap().to_string();
        let config = Arc::new(config(&server_addr, vec!["127.0.0.1:1".to_string()]));
        let (handshake, cipher) = parts(&config, "Test");
        let server = Server::new(config.clone(), handshake, cipher.clone());

        let key = derive_key("issued", 0).to_vec();
        let mut keyring = Keyring::new();
        keyring.add_peer(PeerEntry::Reception {
            identifier: 31337,
            key: key.clone(),
        });

        // Frames of this round plus the first frame of the next one
        let first = cipher.encrypt(b"round one payload", &key).unwrap();
        let second = cipher.encrypt(b"round two", &key).unwrap();
        let mut frames: Vec<Package> = build_packages(3, 40, 31337, &first, 0).unwrap();
        let next = build_packages(3, 40, 31337, &second, 0).unwrap();
        frames.push(next[0].clone());
        // An unknown sender is ignored
        frames.insert(0, Package::new(99, 1, b"??".to_vec(), true, 3));

        let outcome = server.run_broadcast(&listener, &keyring, frames).await.unwrap();
        assert_eq!(outcome.results[&31337], b"round one payload");
        assert_eq!(outcome.carried, vec![next[0].clone()]);
    }

    #[tokio::test]
    async fn test_broadcast_server_over_sockets() {
        let listener = bind_reusable("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap().to_string();
        let client_addr = "127.0.0.1:1".to_string();
        let server_config = Arc::new(config(&server_addr, vec![client_addr.clone()]));
        let client_config = Arc::new(config(&client_addr, vec![server_addr.clone()]));
        let (handshake, cipher) = parts(&server_config, "Test");

        let key = derive_key("issued", 0).to_vec();
        let mut server_keys = Keyring::new();
        server_keys.add_peer(PeerEntry::Reception {
            identifier: 777,
            key: key.clone(),
        });
        let mut client_keys = Keyring::new();
        client_keys.add_peer(PeerEntry::Submission {
            address: server_addr.clone(),
            key: SubmissionKey {
                identifier: 777,
                key,
            },
        });

        let server = Server::new(server_config, handshake.clone(), cipher.clone());
        let task = tokio::spawn(async move {
            server.run_broadcast(&listener, &server_keys, Vec::new()).await
        });

        let payload = vec![0x5A; 1000];
        let client = Client::new(client_config, handshake, cipher);
        assert_eq!(client.broadcast(&client_keys, &payload).await, 1);

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[&777], payload);
    }

    #[tokio::test]
    async fn test_no_peers_is_config_error() {
        let listener = bind_reusable("127.0.0.1:0").await.unwrap();
        let config = Arc::new(config("127.0.0.1:1", Vec::new()));
        let (handshake, cipher) = parts(&config, "Test");
        let server = Server::new(config, handshake, cipher);

        let result = server.run_handshake(&listener).await;
        assert!(matches!(
            result,
            Err(crate::utils::P2pError::Config(ConfigError::NoPeers))
        ));
    }
}

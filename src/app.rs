//! Round orchestration.
//!
//! A [`Runner`] owns everything one node needs for a run: the validated
//! configuration, the payload cipher selected at startup, the keyring the
//! handshake fills in, and the listening socket that is kept open from one
//! round to the next. Each round runs the server half in a background task
//! and the client half inline, then joins both before anything is returned.

use crate::{
    crypto::{derive_key, reveal, select_cipher, Cipher, CipherMode, RsaKeyPair, SymmetricCipher},
    session::Keyring,
    transport::{Client, HandshakeCipher, Package, Server},
    utils::{ConfigError, NodeConfig, P2pError, Result, TestMode},
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Replies of one round keyed by sender identifier
pub type Replies<T> = HashMap<u32, T>;

/// One node of a broadcast run
#[derive(Debug)]
pub struct Runner {
    /// Validated run configuration
    config: Arc<NodeConfig>,
    /// Keys negotiated by the handshake
    keyring: Arc<Keyring>,
    /// Password key for handshake messages
    handshake: HandshakeCipher,
    /// Payload cipher
    cipher: Arc<dyn Cipher>,
    /// Listening socket kept between rounds
    listener: Option<TcpListener>,
    /// Frames received early, replayed into the next broadcast round
    carried: Vec<Package>,
    /// Broadcast rounds started so far
    rounds: u64,
}

impl Runner {
    /// Validate `config` and prepare the node's key material
    ///
    /// This derives the master key, which is deliberately slow, and in
    /// asymmetric mode generates two RSA keypairs. Async callers should
    /// prefer [`Runner::connect`], which runs this on a blocking thread.
    ///
    /// # Errors
    ///
    /// Any `ConfigError` from validation, or a key generation failure
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let password = config
            .crypto
            .password
            .as_deref()
            .ok_or_else(|| ConfigError::MissingField {
                field: "crypto.password".to_string(),
            })?;
        let verbose = config.logging.verbose;

        log::info!(
            "Protocol {}, awaited peers: {} (host {})",
            crate::PROTOCOL_VERSION,
            config.peer_count(),
            config.network.host
        );
        log::debug!(
            "Deriving master key with {} iterations",
            config.crypto.sha_iterations
        );
        let master = derive_key(password, config.crypto.sha_iterations);
        log::debug!("Master key {}", reveal(&master, verbose));

        let symmetric = SymmetricCipher::for_peers(
            &config.network.host,
            &config.network.peers,
            config.crypto.ignore_wrong_keys,
        );

        let mut keyring = Keyring::new();
        let server_keys = if config.crypto.asymmetric {
            log::info!("Generating {}-bit RSA keypairs", config.crypto.rsa_bits);
            let server = Arc::new(RsaKeyPair::generate(config.crypto.rsa_bits)?);
            let client = Arc::new(RsaKeyPair::generate(config.crypto.rsa_bits)?);
            keyring.set_keypairs(Arc::clone(&server), client);
            Some(server)
        } else {
            log::debug!("Initialization vector {}", reveal(symmetric.iv(), verbose));
            keyring.set_initialization_vector(*symmetric.iv());
            None
        };

        let cipher = select_cipher(&config, &symmetric, server_keys);
        log::info!("Payload cipher: {:?}", cipher.mode());

        Ok(Self {
            config: Arc::new(config),
            keyring: Arc::new(keyring),
            handshake: HandshakeCipher::new(symmetric, master),
            cipher,
            listener: None,
            carried: Vec::new(),
            rounds: 0,
        })
    }

    /// Create a runner and run the handshake round
    ///
    /// # Errors
    ///
    /// See [`Runner::new`] and [`Runner::initialize_keyring`]
    pub async fn connect(config: NodeConfig) -> Result<Self> {
        let mut runner = tokio::task::spawn_blocking(move || Self::new(config))
            .await
            .map_err(|e| P2pError::unexpected(format!("Key setup task failed: {e}")))??;
        runner.initialize_keyring().await?;
        Ok(runner)
    }

    /// Run the handshake round and fill in the keyring
    ///
    /// Outside the isolation test modes the keyring must end up with a
    /// reception and a submission entry for every peer.
    ///
    /// # Errors
    ///
    /// `KeyringError::Incomplete` if some peer could not be negotiated,
    /// `P2pError::Interrupted` on Ctrl-C, or a fatal handshake failure
    pub async fn initialize_keyring(&mut self) -> Result<()> {
        interruptible(self.handshake_round()).await
    }

    async fn handshake_round(&mut self) -> Result<()> {
        let mode = self.config.test_mode;
        let mut keyring = (*self.keyring).clone();

        let server = if mode == TestMode::Client {
            None
        } else {
            log::info!("Starting handshake server");
            let (ready_tx, ready_rx) = oneshot::channel();
            let server = self.server();
            let listener = self.listener.take();
            Some(
                start_server(
                    async move {
                        let listener = ready_listener(&server, listener, ready_tx).await?;
                        let outcome = server.run_handshake(&listener).await?;
                        Ok::<_, P2pError>((listener, outcome))
                    },
                    ready_rx,
                )
                .await?,
            )
        };

        if mode != TestMode::Server {
            let public_key = keyring
                .client_keys()
                .map(|keys| keys.public_key_der().to_vec());
            let entries = self.client().handshake(public_key.as_deref()).await?;
            keyring.extend(entries);
        }

        if let Some(task) = server {
            let (listener, outcome) = task.join().await?;
            self.listener = Some(listener);
            keyring.extend(outcome.entries);
            self.carried.extend(outcome.carried);
        }

        if matches!(mode, TestMode::Server | TestMode::Client) {
            log::info!("Isolated handshake finished with {} keys", keyring.len());
        } else {
            if let Err(e) = keyring.ensure_complete(self.config.peer_count()) {
                log::error!("Keyring incomplete, could not reach every peer: {e}");
                return Err(e);
            }
            log::info!("Keyring complete with {} entries", keyring.len());
        }

        self.keyring = Arc::new(keyring);
        Ok(())
    }

    /// Send `payload` to every peer and collect one payload from each
    ///
    /// In `r2client` mode only the sending half runs and the result is
    /// empty; in `r2server` mode only the receiving half runs.
    ///
    /// # Errors
    ///
    /// `KeyringError::Incomplete` before any socket is touched if the
    /// keyring cannot serve this round, `P2pError::Interrupted` on Ctrl-C,
    /// or a fatal decryption failure
    pub async fn broadcast_raw(&mut self, payload: &[u8]) -> Result<Replies<Vec<u8>>> {
        interruptible(self.broadcast_round(payload)).await
    }

    async fn broadcast_round(&mut self, payload: &[u8]) -> Result<Replies<Vec<u8>>> {
        let mode = self.config.test_mode;
        let peers = self.config.peer_count();
        match mode {
            TestMode::R2client => self.keyring.ensure_submission(peers)?,
            TestMode::R2server => self.keyring.ensure_reception(peers)?,
            _ => self.keyring.ensure_complete(peers)?,
        }

        self.rounds += 1;
        log::info!(
            "Broadcast round {} with {} bytes",
            self.rounds,
            payload.len()
        );

        let server = if mode == TestMode::R2client {
            None
        } else {
            let (ready_tx, ready_rx) = oneshot::channel();
            let server = self.server();
            let listener = self.listener.take();
            let keyring = Arc::clone(&self.keyring);
            let carried = std::mem::take(&mut self.carried);
            Some(
                start_server(
                    async move {
                        let listener = ready_listener(&server, listener, ready_tx).await?;
                        let outcome = server.run_broadcast(&listener, &keyring, carried).await?;
                        Ok::<_, P2pError>((listener, outcome))
                    },
                    ready_rx,
                )
                .await?,
            )
        };

        if mode != TestMode::R2server {
            let delivered = self.client().broadcast(&self.keyring, payload).await;
            if delivered < peers {
                log::warn!("Payload reached only {delivered} of {peers} peers");
            }
        }

        let Some(task) = server else {
            return Ok(Replies::new());
        };

        let (listener, outcome) = task.join().await?;
        self.listener = Some(listener);
        self.carried = outcome.carried;
        log::info!("Broadcast round {} finished", self.rounds);
        Ok(outcome.results)
    }

    /// Broadcast a string; every reply must be UTF-8
    ///
    /// # Errors
    ///
    /// See [`Runner::broadcast_raw`]; `P2pError::Encoding` for a reply
    /// that is not UTF-8
    pub async fn broadcast_str(&mut self, message: &str) -> Result<Replies<String>> {
        self.broadcast_raw(message.as_bytes())
            .await?
            .into_iter()
            .map(|(identifier, reply)| Ok((identifier, String::from_utf8(reply)?)))
            .collect()
    }

    /// Broadcast a serializable value and decode every reply as the same type
    ///
    /// # Errors
    ///
    /// See [`Runner::broadcast_raw`]; `P2pError::Serialization` if a value
    /// cannot be encoded or a reply cannot be decoded
    pub async fn broadcast_obj<T>(&mut self, value: &T) -> Result<Replies<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = bincode::serialize(value)?;
        self.broadcast_raw(&payload)
            .await?
            .into_iter()
            .map(|(identifier, reply)| Ok((identifier, bincode::deserialize(&reply)?)))
            .collect()
    }

    fn client(&self) -> Client {
        Client::new(
            Arc::clone(&self.config),
            self.handshake.clone(),
            Arc::clone(&self.cipher),
        )
    }

    fn server(&self) -> Server {
        Server::new(
            Arc::clone(&self.config),
            self.handshake.clone(),
            Arc::clone(&self.cipher),
        )
    }

    /// Run configuration
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Keys negotiated so far
    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Which payload cipher this node uses
    pub fn cipher_mode(&self) -> CipherMode {
        self.cipher.mode()
    }

    /// Broadcast rounds started so far
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Address of the listening socket, once a round has bound it
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

/// Server half of a round; aborted when dropped
struct ServerTask<T>(JoinHandle<Result<(TcpListener, T)>>);

impl<T> ServerTask<T> {
    async fn join(mut self) -> Result<(TcpListener, T)> {
        (&mut self.0)
            .await
            .map_err(|e| P2pError::unexpected(format!("Server task failed: {e}")))?
    }
}

impl<T> Drop for ServerTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawn a server round and wait until it is listening
async fn start_server<T, F>(round: F, ready: oneshot::Receiver<()>) -> Result<ServerTask<T>>
where
    T: Send + 'static,
    F: Future<Output = Result<(TcpListener, T)>> + Send + 'static,
{
    let task = ServerTask(tokio::spawn(round));
    if ready.await.is_err() {
        // The task ended before listening; surface its error
        task.join().await?;
        return Err(P2pError::unexpected("Server stopped before listening"));
    }
    Ok(task)
}

async fn ready_listener(
    server: &Server,
    listener: Option<TcpListener>,
    ready: oneshot::Sender<()>,
) -> Result<TcpListener> {
    let listener = match listener {
        Some(listener) => listener,
        None => server.listen().await?,
    };
    // Nobody waits any more after an interrupt
    let _ = ready.send(());
    Ok(listener)
}

async fn interruptible<T, F>(round: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    interruptible_with(round, tokio::signal::ctrl_c()).await
}

/// Race `round` against `signal`; the round is dropped if the signal fires
///
/// A signal that fails to install is ignored and the round runs to the end.
async fn interruptible_with<T, F, S>(round: F, signal: S) -> Result<T>
where
    F: Future<Output = Result<T>>,
    S: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        result = round => result,
        Ok(()) = signal => {
            log::warn!("Terminated manually");
            Err(P2pError::Interrupted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::KeyringError;
    use std::time::Duration;

    fn symmetric_config(host: &str, peers: &[&str]) -> NodeConfig {
        let mut config = NodeConfig::new(
            host.to_string(),
            peers.iter().map(|p| (*p).to_string()).collect(),
            "Test".to_string(),
        );
        config.crypto.asymmetric = false;
        config.crypto.sha_iterations = 10;
        config.network.max_chunk_size = 256;
        config.timing.retry_base_ms = 20;
        config.timing.retry_step_ms = 20;
        config.timing.send_interval_ms = 1;
        config.timing.read_timeout_ms = 5_000;
        config
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = symmetric_config("127.0.0.1:46000", &[]);
        assert!(matches!(
            Runner::new(config),
            Err(P2pError::Config(ConfigError::NoPeers))
        ));

        let config = symmetric_config("127.0.0.1:46000", &["127.0.0.1:46000"]);
        assert!(matches!(
            Runner::new(config),
            Err(P2pError::Config(ConfigError::SelfReferentialHost { .. }))
        ));
    }

    #[test]
    fn test_new_rejects_chunk_below_handshake() {
        let mut config = symmetric_config("127.0.0.1:46000", &["127.0.0.1:46001"]);
        config.network.max_chunk_size = 40;
        assert!(matches!(
            Runner::new(config),
            Err(P2pError::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[tokio::test]
    async fn test_interrupt_releases_listener() {
        // The only peer never comes up, so the handshake keeps retrying
        let host = "127.0.0.1:46060";
        let mut runner = Runner::new(symmetric_config(host, &["127.0.0.1:46061"])).unwrap();

        let signal = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(std::net::TcpListener::bind(host).is_err());
            Ok::<(), std::io::Error>(())
        };
        let result = interruptible_with(runner.handshake_round(), signal).await;
        assert!(matches!(result, Err(P2pError::Interrupted)));
        assert_eq!(result.unwrap_err().exit_code(), 130);
        assert!(runner.local_addr().is_none());

        let mut rebound = None;
        for _ in 0..50 {
            match std::net::TcpListener::bind(host) {
                Ok(listener) => {
                    rebound = Some(listener);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        assert!(rebound.is_some());
    }

    #[tokio::test]
    async fn test_failed_signal_lets_round_finish() {
        let signal = async {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no signal handler",
            ))
        };
        let result = interruptible_with(async { Ok::<_, P2pError>(7) }, signal).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_new_prepares_keys() {
        let runner = Runner::new(symmetric_config("127.0.0.1:46010", &["127.0.0.1:46011"])).unwrap();
        assert_eq!(runner.cipher_mode(), CipherMode::Symmetric);
        assert!(runner.keyring().is_empty());
        assert!(runner.keyring().initialization_vector().is_some());
        assert!(runner.keyring().server_keys().is_none());
        assert!(runner.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_requires_keyring() {
        let mut runner =
            Runner::new(symmetric_config("127.0.0.1:46020", &["127.0.0.1:46021"])).unwrap();

        let result = runner.broadcast_raw(b"too early").await;
        assert!(matches!(
            result,
            Err(P2pError::Keyring(KeyringError::Incomplete {
                expected: 2,
                actual: 0
            }))
        ));
        // Nothing was bound
        assert!(runner.local_addr().is_none());
        assert_eq!(runner.rounds(), 0);
    }

    #[tokio::test]
    async fn test_isolation_modes_check_their_half() {
        let mut config = symmetric_config("127.0.0.1:46030", &["127.0.0.1:46031"]);
        config.test_mode = TestMode::R2client;
        let mut runner = Runner::new(config).unwrap();
        assert!(matches!(
            runner.broadcast_raw(b"x").await,
            Err(P2pError::Keyring(KeyringError::Incomplete { expected: 1, .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_nodes_exchange_strings() {
        let a = symmetric_config("127.0.0.1:46040", &["127.0.0.1:46041"]);
        let b = symmetric_config("127.0.0.1:46041", &["127.0.0.1:46040"]);

        let node_b = tokio::spawn(async move {
            let mut runner = Runner::connect(b).await.unwrap();
            runner.broadcast_str("from b").await.unwrap()
        });
        let mut runner = Runner::connect(a).await.unwrap();
        assert_eq!(runner.keyring().len(), 2);
        let from_b = runner.broadcast_str("from a").await.unwrap();
        let from_a = node_b.await.unwrap();

        assert_eq!(from_b.into_values().collect::<Vec<_>>(), vec!["from b"]);
        assert_eq!(from_a.into_values().collect::<Vec<_>>(), vec!["from a"]);
        assert!(runner.local_addr().is_some());
        assert_eq!(runner.rounds(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_isolated_handshake_halves() {
        let mut server = symmetric_config("127.0.0.1:46050", &["127.0.0.1:46051"]);
        server.test_mode = TestMode::Server;
        let mut client = symmetric_config("127.0.0.1:46051", &["127.0.0.1:46050"]);
        client.test_mode = TestMode::Client;

        let server_node = tokio::spawn(Runner::connect(server));
        let client_node = Runner::connect(client).await.unwrap();
        let server_node = server_node.await.unwrap().unwrap();

        assert_eq!(client_node.keyring().submission_len(), 1);
        assert_eq!(client_node.keyring().reception_len(), 0);
        assert_eq!(server_node.keyring().reception_len(), 1);
        assert_eq!(server_node.keyring().submission_len(), 0);
    }
}

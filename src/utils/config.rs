//! Configuration management for a broadcast node.
//!
//! Values are resolved once, in a fixed order: built-in defaults, then a
//! TOML file, then `P2P_*` environment variables, then command-line
//! arguments (applied by the binary). The resulting [`NodeConfig`] is
//! validated and never mutated again once a [`Runner`](crate::Runner) owns it.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "p2p.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "P2P";

/// Complete configuration for one broadcast node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Addresses and framing
    pub network: NetworkConfig,
    /// Keys and cipher selection
    pub crypto: CryptoConfig,
    /// Backoff, pacing and read deadlines
    pub timing: TimingConfig,
    /// Verbosity of internal state in logs
    pub logging: LoggingConfig,
    /// Run only one half of a round
    pub test_mode: TestMode,
}

/// Addresses and framing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Own listening address (`address:port`)
    pub host: String,
    /// Every other participant (`address:port`)
    pub peers: Vec<String>,
    /// Upper bound for one frame on the wire, header included
    pub max_chunk_size: usize,
    /// Width in bytes of identifiers and sequence numbers
    pub id_width: usize,
}

/// Cipher selection and key derivation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Shared secret every participant knows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Use per-node RSA keys for payloads instead of the password key
    pub asymmetric: bool,
    /// Return empty results instead of aborting on a wrong key
    pub ignore_wrong_keys: bool,
    /// Iterations of the password hash
    pub sha_iterations: u32,
    /// RSA modulus size for asymmetric mode
    pub rsa_bits: usize,
}

/// Timing parameters, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// First wait after a refused connection
    pub retry_base_ms: u64,
    /// Added to the wait after every further refusal
    pub retry_step_ms: u64,
    /// Pause between two chunks sent to the same peer
    pub send_interval_ms: u64,
    /// Deadline for reading one message from a connection
    pub read_timeout_ms: u64,
    /// Give up on a peer after this many refusals (unbounded if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 0 hides all key material, 2 shows keys, 3 also shows raw frames
    pub verbose: u8,
}

/// Which half of a round a node runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TestMode {
    /// Run both halves
    #[default]
    None,
    /// Handshake responder only
    Server,
    /// Handshake initiator only
    Client,
    /// Broadcast sender only
    R2client,
    /// Broadcast receiver only
    R2server,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: crate::defaults::DEFAULT_HOST.to_string(),
            peers: Vec::new(),
            max_chunk_size: crate::defaults::DEFAULT_MAX_CHUNK_SIZE,
            id_width: crate::defaults::DEFAULT_ID_WIDTH,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            password: None,
            asymmetric: true,
            ignore_wrong_keys: false,
            sha_iterations: crate::defaults::DEFAULT_SHA_ITERATIONS,
            rsa_bits: crate::defaults::DEFAULT_RSA_BITS,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: crate::defaults::DEFAULT_RETRY_BASE_MS,
            retry_step_ms: crate::defaults::DEFAULT_RETRY_STEP_MS,
            send_interval_ms: crate::defaults::DEFAULT_SEND_INTERVAL_MS,
            read_timeout_ms: crate::defaults::DEFAULT_READ_TIMEOUT_MS,
            max_retries: None,
        }
    }
}

impl TimingConfig {
    /// Pause between chunks
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    /// Per-message read deadline
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl NodeConfig {
    /// Create a configuration for `host` talking to `peers` with a shared password
    pub fn new<S: Into<String>>(host: S, peers: Vec<String>, password: S) -> Self {
        let mut config = Self::default();
        config.network.host = host.into();
        config.network.peers = peers;
        config.crypto.password = Some(password.into());
        config
    }

    /// Load configuration from a TOML file
    ///
    /// Missing fields keep their defaults. The result is not validated,
    /// since command-line arguments may still complete it.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        toml::from_str(&content).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Load configuration from defaults, a file and the environment
    ///
    /// An explicit `config_file` must exist. Without one, `./p2p.toml` and
    /// the per-user config directory are tried in that order.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_locations().into_iter().find(|p| p.exists()) {
                Some(path) => {
                    log::debug!("Using configuration file {}", path.display());
                    Self::from_file(path)?
                }
                None => Self::default(),
            },
        };

        config.merge_from_env()
    }

    fn default_locations() -> Vec<PathBuf> {
        vec![
            PathBuf::from(DEFAULT_CONFIG_FILE),
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("secure-p2p-broadcast")
                .join("config.toml"),
        ]
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Override fields from `P2P_*` environment variables
    fn merge_from_env(mut self) -> Result<Self> {
        let var = |name: &str| std::env::var(format!("{ENV_PREFIX}_{name}")).ok();

        if let Some(host) = var("HOST") {
            self.network.host = host;
        }

        if let Some(peers) = var("PEERS") {
            self.network.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(password) = var("PASSWORD") {
            self.crypto.password = Some(password);
        }

        if let Some(asymmetric) = var("ASYMMETRIC") {
            self.crypto.asymmetric =
                parse_bool(&asymmetric).ok_or_else(|| ConfigError::InvalidValue {
                    field: format!("{ENV_PREFIX}_ASYMMETRIC"),
                    value: asymmetric.clone(),
                })?;
        }

        if let Some(verbose) = var("VERBOSE") {
            self.logging.verbose = verbose.parse().map_err(|_| ConfigError::InvalidValue {
                field: format!("{ENV_PREFIX}_VERBOSE"),
                value: verbose.clone(),
            })?;
        }

        Ok(self)
    }

    /// Sanity checks run once before a node starts
    pub fn validate(&self) -> Result<()> {
        if self.crypto.password.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingField {
                field: "crypto.password".to_string(),
            }
            .into());
        }

        if self.network.peers.is_empty() {
            return Err(ConfigError::NoPeers.into());
        }

        check_address("network.host", &self.network.host)?;
        let mut seen = HashSet::new();
        for peer in &self.network.peers {
            check_address("network.peers", peer)?;
            if !seen.insert(peer.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "network.peers".to_string(),
                    value: format!("duplicate peer {peer}"),
                }
                .into());
            }
        }

        if seen.contains(self.network.host.as_str()) {
            return Err(ConfigError::SelfReferentialHost {
                host: self.network.host.clone(),
            }
            .into());
        }

        if !(crate::defaults::MIN_ID_WIDTH..=crate::defaults::MAX_ID_WIDTH)
            .contains(&self.network.id_width)
        {
            return Err(ConfigError::InvalidValue {
                field: "network.id_width".to_string(),
                value: self.network.id_width.to_string(),
            }
            .into());
        }

        if self.network.max_chunk_size <= crate::transport::header_overhead(self.network.id_width) {
            return Err(ConfigError::InvalidValue {
                field: "network.max_chunk_size".to_string(),
                value: self.network.max_chunk_size.to_string(),
            }
            .into());
        }

        let handshake = crate::transport::max_handshake_size(
            self.network.id_width,
            self.crypto.asymmetric,
            self.crypto.rsa_bits,
        );
        if self.network.max_chunk_size < handshake {
            return Err(ConfigError::InvalidValue {
                field: "network.max_chunk_size".to_string(),
                value: format!(
                    "{} is below the {handshake} byte handshake message",
                    self.network.max_chunk_size
                ),
            }
            .into());
        }

        if self.logging.verbose > 3 {
            return Err(ConfigError::InvalidValue {
                field: "logging.verbose".to_string(),
                value: self.logging.verbose.to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Number of participants other than this node
    pub fn peer_count(&self) -> usize {
        self.network.peers.len()
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn check_address(field: &str, address: &str) -> Result<()> {
    let valid = match address.rsplit_once(':') {
        Some((ip, port)) => !ip.is_empty() && port.parse::<u16>().map_or(false, |p| p != 0),
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: address.to_string(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::P2pError;
    use tempfile::NamedTempFile;

    fn sample() -> NodeConfig {
        NodeConfig::new(
            "127.0.0.1:5000",
            vec!["127.0.0.1:5001".to_string(), "127.0.0.1:5002".to_string()],
            "Test",
        )
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.network.id_width, 3);
        assert_eq!(config.network.max_chunk_size, 1_024_000);
        assert_eq!(config.crypto.sha_iterations, 100_000);
        assert!(config.crypto.asymmetric);
        assert_eq!(config.test_mode, TestMode::None);

        // No password and no peers yet
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(sample().validate().is_ok());

        let mut config = sample();
        config.network.peers.clear();
        assert!(matches!(
            config.validate(),
            Err(P2pError::Config(ConfigError::NoPeers))
        ));

        let mut config = sample();
        config.network.peers.push("127.0.0.1:5000".to_string());
        assert!(matches!(
            config.validate(),
            Err(P2pError::Config(ConfigError::SelfReferentialHost { .. }))
        ));

        let mut config = sample();
        config.crypto.password = None;
        assert!(matches!(
            config.validate(),
            Err(P2pError::Config(ConfigError::MissingField { .. }))
        ));

        let mut config = sample();
        config.network.peers.push("localhost".to_string());
        assert!(config.validate().is_err());

        let mut config = sample();
        config.network.peers.push("127.0.0.1:5001".to_string());
        assert!(config.validate().is_err());

        let mut config = sample();
        config.network.id_width = 2;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.network.max_chunk_size = 13;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunk_size_must_fit_handshake() {
        // A 1024-bit public key does not fit into 150 bytes
        let mut config = sample();
        config.crypto.rsa_bits = 1024;
        config.network.max_chunk_size = 150;
        assert!(matches!(
            config.validate(),
            Err(P2pError::Config(ConfigError::InvalidValue { ref field, .. }))
                if field == "network.max_chunk_size"
        ));
        config.network.max_chunk_size = 192;
        assert!(config.validate().is_ok());

        // A sealed reply with an AES key takes three blocks
        let mut config = sample();
        config.crypto.asymmetric = false;
        config.network.max_chunk_size = 40;
        assert!(config.validate().is_err());
        config.network.max_chunk_size = 48;
        assert!(config.validate().is_ok());

        let mut config = sample();
        config.network.max_chunk_size = 319;
        assert!(config.validate().is_err());
        config.network.max_chunk_size = 320;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let toml_str = sample().to_toml_string().unwrap();
        assert!(toml_str.contains("peers"));
        assert!(toml_str.contains("test_mode = \"none\""));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = sample();
        config.test_mode = TestMode::R2server;
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = NodeConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.network.peers, config.network.peers);
        assert_eq!(loaded.crypto.password.as_deref(), Some("Test"));
        assert_eq!(loaded.test_mode, TestMode::R2server);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(
            temp_file.path(),
            "[network]\nhost = \"10.0.0.1:4000\"\npeers = [\"10.0.0.2:4000\"]\n\n[crypto]\npassword = \"pw\"\nasymmetric = false\n",
        )
        .unwrap();

        let config = NodeConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.network.host, "10.0.0.1:4000");
        assert!(!config.crypto.asymmetric);
        assert_eq!(config.network.id_width, 3);
        assert_eq!(config.timing.retry_base_ms, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_explicit_file() {
        let result = NodeConfig::load(Some(Path::new("/nonexistent/p2p.toml")));
        assert!(matches!(
            result,
            Err(P2pError::Config(ConfigError::FileNotFound { .. }))
        ));
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("P2P_PEERS", "127.0.0.1:7001, 127.0.0.1:7002");
        std::env::set_var("P2P_ASYMMETRIC", "false");

        let config = NodeConfig::default().merge_from_env().unwrap();
        assert_eq!(config.network.peers.len(), 2);
        assert_eq!(config.network.peers[1], "127.0.0.1:7002");
        assert!(!config.crypto.asymmetric);

        std::env::remove_var("P2P_PEERS");
        std::env::remove_var("P2P_ASYMMETRIC");
    }
}

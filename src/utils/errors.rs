//! Error types and handling for the broadcast transport.
//!
//! Per-package and per-peer failures are kept apart from the aggregate
//! failures that end a run, so the orchestrator can decide what escalates
//! into a process exit and what only gets logged.

use thiserror::Error;

/// Result type alias for the broadcast library
pub type Result<T> = std::result::Result<T, P2pError>;

/// Comprehensive error type for all transport operations
#[derive(Error, Debug, Clone)]
pub enum P2pError {
    /// Malformed or truncated package frames
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Network and socket errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Authentication failures (wrong key, challenge mismatch)
    #[error("Authentication failure: {0}")]
    Auth(#[from] AuthError),

    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Keyring lookup and completeness errors
    #[error("Keyring error: {0}")]
    Keyring(#[from] KeyringError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The run was interrupted from outside (Ctrl-C)
    #[error("Terminated manually")]
    Interrupted,

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// Structured payload encoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A reply that should have been text was not UTF-8
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Generic error for unexpected conditions
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Package framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame shorter than the fixed header
    #[error("Frame too short: {len} bytes (min: {min})")]
    TooShort { len: usize, min: usize },

    /// Leading and trailing identifiers differ
    #[error("Identifier mismatch: head {head}, tail {tail}")]
    IdentifierMismatch { head: u32, tail: u32 },

    /// Identifier 0 is reserved for unparseable frames
    #[error("Zero identifier")]
    ZeroIdentifier,

    /// Identifier does not fit the configured width
    #[error("Identifier {identifier} does not fit in {width} bytes")]
    IdentifierOverflow { identifier: u32, width: usize },

    /// Payload needs more sequence numbers than the width can encode
    #[error("Payload needs {chunks} chunks, more than {width} bytes can number")]
    TooManyChunks { chunks: usize, width: usize },

    /// Max chunk size leaves no room for payload bytes
    #[error("Chunk size {max_chunk_size} leaves no room after {overhead} header bytes")]
    ChunkTooSmall { max_chunk_size: usize, overhead: usize },

    /// Frame exceeds the configured maximum
    #[error("Frame too large: {size} bytes (max: {max})")]
    Oversized { size: usize, max: usize },
}

/// Network and socket errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Connection refused and the retry budget ran out
    #[error("Peer unreachable: {peer} after {attempts} attempts")]
    PeerUnreachable { peer: String, attempts: u32 },

    /// Connection establishment or transfer failure
    #[error("Connection failed to {peer}: {reason}")]
    ConnectionFailed { peer: String, reason: String },

    /// Listening socket could not be set up
    #[error("Bind failed on {address}: {reason}")]
    BindFailed { address: String, reason: String },

    /// Invalid network address
    #[error("Invalid address: {address}")]
    InvalidAddress { address: String },

    /// Timeout during network operation
    #[error("Network timeout: {operation}")]
    Timeout { operation: String },
}

/// Authentication failures
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    /// AES padding check failed, the password or derived key is wrong
    #[error("Bad padding: {reason}")]
    BadPadding { reason: String },

    /// Decryption failed under a per-peer key
    #[error("Wrong key: {reason}")]
    WrongKey { reason: String },

    /// Handshake reply did not confirm the challenge
    #[error("Challenge mismatch from {peer}: expected {expected}, got {received}")]
    ChallengeMismatch {
        peer: String,
        expected: u32,
        received: u32,
    },

    /// Decrypted challenge is outside the accepted range
    #[error("Challenge out of range: {value}")]
    ChallengeOutOfRange { value: u64 },
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Key generation failure
    #[error("Key generation failed: {reason}")]
    KeyGeneration { reason: String },

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },
}

/// Keyring errors
#[derive(Error, Debug, Clone)]
pub enum KeyringError {
    /// No key negotiated for this peer
    #[error("Peer unknown: {peer}")]
    PeerUnknown { peer: String },

    /// Fewer negotiated entries than the peer set requires
    #[error("Keyring incomplete: {actual} entries, expected {expected}")]
    Incomplete { expected: usize, actual: usize },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Missing required configuration
    #[error("Missing configuration: {field}")]
    MissingField { field: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Nobody to talk to
    #[error("No peers configured")]
    NoPeers,

    /// Own host listed among the peers
    #[error("Host {host} is also listed as a peer")]
    SelfReferentialHost { host: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },
}

impl P2pError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Returns true if the error only concerns one package or one peer
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Frame(_)
                | Self::Network(_)
                | Self::Auth(AuthError::WrongKey { .. })
                | Self::Auth(AuthError::ChallengeMismatch { .. })
                | Self::Auth(AuthError::ChallengeOutOfRange { .. })
                | Self::Keyring(KeyringError::PeerUnknown { .. })
        )
    }

    /// Returns true if the error must end the whole run
    pub fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }

    /// Returns true if this error indicates a security violation
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Process exit code for a run that ended with this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Keyring(KeyringError::Incomplete { .. }) => 101,
            Self::Config(ConfigError::NoPeers) => 120,
            Self::Config(_) => 110,
            Self::Auth(AuthError::BadPadding { .. }) => 201,
            Self::Interrupted => 130,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for P2pError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for P2pError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for P2pError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for P2pError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = P2pError::Frame(FrameError::IdentifierMismatch { head: 7, tail: 9 });
        assert!(error.to_string().contains("head 7, tail 9"));

        assert_eq!(P2pError::Interrupted.to_string(), "Terminated manually");
    }

    #[test]
    fn test_error_recovery() {
        let refused = P2pError::Network(NetworkError::PeerUnreachable {
            peer: "127.0.0.1:5000".to_string(),
            attempts: 3,
        });
        assert!(refused.is_recoverable());

        let unknown = P2pError::Keyring(KeyringError::PeerUnknown {
            peer: "127.0.0.1:5001".to_string(),
        });
        assert!(unknown.is_recoverable());

        let incomplete = P2pError::Keyring(KeyringError::Incomplete {
            expected: 4,
            actual: 2,
        });
        assert!(incomplete.is_fatal());

        let password = P2pError::Auth(AuthError::BadPadding {
            reason: "bad padding".to_string(),
        });
        assert!(password.is_fatal());
        assert!(password.is_security_violation());
    }

    #[test]
    fn test_exit_codes() {
        let incomplete = P2pError::Keyring(KeyringError::Incomplete {
            expected: 4,
            actual: 2,
        });
        assert_eq!(incomplete.exit_code(), 101);
        assert_eq!(P2pError::Config(ConfigError::NoPeers).exit_code(), 120);
        assert_eq!(
            P2pError::Config(ConfigError::SelfReferentialHost {
                host: "a:1".to_string()
            })
            .exit_code(),
            110
        );
        assert_eq!(P2pError::Interrupted.exit_code(), 130);
        assert_eq!(P2pError::unexpected("boom").exit_code(), 1);
    }
}

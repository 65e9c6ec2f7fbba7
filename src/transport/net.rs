//! Socket plumbing shared by client and server.
//!
//! Every message travels on its own connection: the sender writes it and
//! half-closes, the receiver reads to EOF. Reads are bounded in size and
//! time so a stalled peer cannot pin a task forever.

use crate::utils::{FrameError, NetworkError, Result, TimingConfig};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};

/// Pending connection backlog of a listening socket
const LISTEN_BACKLOG: u32 = 1024;

/// Linear backoff for refused connections
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    step: Duration,
    max_attempts: Option<u32>,
    attempts: u32,
}

impl Backoff {
    /// Backoff configured from the timing section
    pub fn from_timing(timing: &TimingConfig) -> Self {
        Self {
            base: Duration::from_millis(timing.retry_base_ms),
            step: Duration::from_millis(timing.retry_step_ms),
            max_attempts: timing.max_retries,
            attempts: 0,
        }
    }

    /// Record a failure and return how long to wait, or `None` once exhausted
    pub fn next_wait(&mut self) -> Option<Duration> {
        if self.max_attempts.map_or(false, |max| self.attempts >= max) {
            return None;
        }
        let wait = self.base + self.step * self.attempts;
        self.attempts += 1;
        Some(wait)
    }

    /// Failures recorded so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Bind a listening socket that allows immediate address reuse
pub async fn bind_reusable(host: &str) -> Result<TcpListener> {
    let bind_failed = |reason: String| NetworkError::BindFailed {
        address: host.to_string(),
        reason,
    };

    let address = lookup_host(host)
        .await
        .map_err(|_| NetworkError::InvalidAddress {
            address: host.to_string(),
        })?
        .next()
        .ok_or_else(|| NetworkError::InvalidAddress {
            address: host.to_string(),
        })?;

    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| bind_failed(e.to_string()))?;

    socket
        .set_reuseaddr(true)
        .map_err(|e| bind_failed(e.to_string()))?;
    socket
        .bind(address)
        .map_err(|e| bind_failed(e.to_string()))?;

    let listener = socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| bind_failed(e.to_string()))?;
    log::info!("Listening on {address}");
    Ok(listener)
}

/// Connect to `peer`, waiting out refusals with linear backoff
///
/// # Errors
///
/// `NetworkError::PeerUnreachable` once the configured retry budget is
/// spent, `NetworkError::ConnectionFailed` on any other connect error
pub async fn connect_with_retry(peer: &str, timing: &TimingConfig) -> Result<TcpStream> {
    let mut backoff = Backoff::from_timing(timing);

    loop {
        match TcpStream::connect(peer).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                let Some(wait) = backoff.next_wait() else {
                    return Err(NetworkError::PeerUnreachable {
                        peer: peer.to_string(),
                        attempts: backoff.attempts(),
                    }
                    .into());
                };
                log::debug!(
                    "Connection to {peer} refused, retrying in {}ms (attempt {})",
                    wait.as_millis(),
                    backoff.attempts()
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                return Err(NetworkError::ConnectionFailed {
                    peer: peer.to_string(),
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }
}

/// Write one message and half-close the write side
pub async fn write_message<S>(stream: &mut S, message: &[u8], peer: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let failed = |e: std::io::Error| NetworkError::ConnectionFailed {
        peer: peer.to_string(),
        reason: e.to_string(),
    };

    stream.write_all(message).await.map_err(failed)?;
    stream.shutdown().await.map_err(failed)?;
    Ok(())
}

/// Read one message up to EOF
///
/// # Errors
///
/// `FrameError::Oversized` if more than `max_size` bytes arrive,
/// `NetworkError::Timeout` if EOF does not arrive within `timeout`
pub async fn read_message<S>(
    stream: &mut S,
    max_size: usize,
    timeout: Duration,
    peer: &str,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut message = Vec::new();
    let limit = max_size as u64 + 1;

    tokio::time::timeout(timeout, (&mut *stream).take(limit).read_to_end(&mut message))
        .await
        .map_err(|_| NetworkError::Timeout {
            operation: format!("read from {peer}"),
        })?
        .map_err(|e| NetworkError::ConnectionFailed {
            peer: peer.to_string(),
            reason: e.to_string(),
        })?;

    if message.len() > max_size {
        return Err(FrameError::Oversized {
            size: message.len(),
            max: max_size,
        }
        .into());
    }

    Ok(message)
}

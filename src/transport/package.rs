//! Package framing.
//!
//! A payload is cut into frames of at most `max_chunk_size` bytes:
//!
//! ```text
//! identifier(W) seq(W) payload ["END:"] identifier(W)
//! ```
//!
//! All integers are big-endian with a fixed width `W` per run. The
//! identifier is repeated at the tail; a frame whose head and tail
//! disagree is corrupt. Only the last frame of a payload carries the
//! `END:` tag.

use crate::utils::{FrameError, Result};

/// Tag in front of the trailing identifier of the last frame
pub const END_TAG: &[u8; 4] = b"END:";

/// Bytes a frame spends on anything but payload
pub fn header_overhead(width: usize) -> usize {
    3 * width + END_TAG.len()
}

/// Largest value that fits in `width` big-endian bytes
pub fn max_value(width: usize) -> u32 {
    if width >= 4 {
        u32::MAX
    } else {
        (1u32 << (8 * width)) - 1
    }
}

/// Encode `value` as `width` big-endian bytes
///
/// # Errors
///
/// Returns `FrameError::IdentifierOverflow` if the value does not fit
pub fn encode_uint(value: u32, width: usize) -> Result<Vec<u8>> {
    if value > max_value(width) {
        return Err(FrameError::IdentifierOverflow {
            identifier: value,
            width,
        }
        .into());
    }

    let bytes = value.to_be_bytes();
    Ok(bytes[bytes.len() - width.min(4)..].to_vec())
}

/// Decode big-endian bytes, at most four of them
pub fn decode_uint(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

/// One frame of a chunked payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    /// Sender identifier negotiated during the handshake
    pub identifier: u32,
    /// Position within the payload, starting at 1
    pub sequence: u32,
    /// Raw chunk bytes, usually ciphertext
    pub payload: Vec<u8>,
    /// Set on the final chunk
    pub is_last: bool,
    width: usize,
}

impl Package {
    /// Create a package encoded with `width`-byte integers
    pub fn new(identifier: u32, sequence: u32, payload: Vec<u8>, is_last: bool, width: usize) -> Self {
        Self {
            identifier,
            sequence,
            payload,
            is_last,
            width,
        }
    }

    /// Integer width used on the wire
    pub fn width(&self) -> usize {
        self.width
    }

    /// Encode as one wire frame
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let id = encode_uint(self.identifier, self.width)?;
        let mut frame = Vec::with_capacity(self.payload.len() + header_overhead(self.width));
        frame.extend_from_slice(&id);
        frame.extend_from_slice(&encode_uint(self.sequence, self.width)?);
        frame.extend_from_slice(&self.payload);
        if self.is_last {
            frame.extend_from_slice(END_TAG);
        }
        frame.extend_from_slice(&id);
        Ok(frame)
    }

    /// Parse one wire frame
    ///
    /// The identifier match is authoritative; the `END:` tag is only
    /// compared byte for byte and stripped when present.
    ///
    /// # Errors
    ///
    /// Returns a `FrameError` if the frame is truncated, the identifiers
    /// disagree, or either identifier is zero
    pub fn from_wire(frame: &[u8], width: usize) -> Result<Self> {
        let min = 3 * width;
        if frame.len() < min {
            return Err(FrameError::TooShort {
                len: frame.len(),
                min,
            }
            .into());
        }

        let head = decode_uint(&frame[..width]);
        let tail = decode_uint(&frame[frame.len() - width..]);
        if head != tail {
            return Err(FrameError::IdentifierMismatch { head, tail }.into());
        }
        if head == 0 {
            return Err(FrameError::ZeroIdentifier.into());
        }

        let sequence = decode_uint(&frame[width..2 * width]);
        let body = &frame[2 * width..frame.len() - width];
        let (payload, is_last) = match body.strip_suffix(&END_TAG[..]) {
            Some(payload) => (payload, true),
            None => (body, false),
        };

        Ok(Self::new(head, sequence, payload.to_vec(), is_last, width))
    }
}

/// Split `payload` into packages whose frames fit `max_chunk_size`
///
/// Sequence numbers start at 1 and are contiguous; the last package is
/// flagged. An empty payload still yields one (last) package so the
/// receiver can complete.
///
/// # Errors
///
/// Returns a `FrameError` if the identifier is zero or too wide, if the
/// chunk size leaves no room for payload, or if the payload needs more
/// sequence numbers than `width` bytes can hold
pub fn build_packages(
    width: usize,
    max_chunk_size: usize,
    identifier: u32,
    payload: &[u8],
    verbose: u8,
) -> Result<Vec<Package>> {
    if identifier == 0 {
        return Err(FrameError::ZeroIdentifier.into());
    }
    if identifier > max_value(width) {
        return Err(FrameError::IdentifierOverflow { identifier, width }.into());
    }

    let overhead = header_overhead(width);
    let capacity = max_chunk_size.saturating_sub(overhead);
    if capacity == 0 {
        return Err(FrameError::ChunkTooSmall {
            max_chunk_size,
            overhead,
        }
        .into());
    }

    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(capacity).collect()
    };
    if chunks.len() > max_value(width) as usize {
        return Err(FrameError::TooManyChunks {
            chunks: chunks.len(),
            width,
        }
        .into());
    }

    let total = chunks.len();
    let packages: Vec<Package> = chunks
        .into_iter()
        .zip(1u32..)
        .map(|(chunk, sequence)| {
            Package::new(
                identifier,
                sequence,
                chunk.to_vec(),
                sequence as usize == total,
                width,
            )
        })
        .collect();

    if verbose >= 3 {
        log::trace!(
            "Framed {} bytes for identifier {identifier} into {total} packages of up to {capacity} bytes",
            payload.len()
        );
    }

    Ok(packages)
}

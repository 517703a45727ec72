//! Length-prefixed JSON framing.
//!
//! # Wire Format
//!
//! ```text
//! <decimal length>:<JSON bytes>
//! ```
//!
//! The length counts only the payload bytes (not characters), e.g.
//! `13:[1,2,null,{}]` carries a 13-byte payload.
//!
//! # End of Stream
//!
//! | Where the stream ends | Result |
//! |-----------------------|--------|
//! | Before the first length digit | `Ok(None)`, no more frames |
//! | Inside the length header | [`Error::Protocol`] |
//! | Inside the payload | [`Error::Protocol`] |
//!
//! A payload that is shorter than its declared length is always a hard
//! error; it is never returned as a partial frame.

// ============================================================================
// Imports
// ============================================================================

use std::io::ErrorKind;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Separator between the length header and the payload.
const SEPARATOR: u8 = b':';

/// Longest accepted length header (digits of `u64::MAX`).
const MAX_HEADER_DIGITS: usize = 20;

// ============================================================================
// Encoding
// ============================================================================

/// Serializes `value` into a complete frame.
///
/// # Errors
///
/// Returns [`Error::Json`] if the value cannot be serialized.
pub fn encode_frame<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value)?;
    let header = payload.len().to_string();

    let mut frame = Vec::with_capacity(header.len() + 1 + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.push(SEPARATOR);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Writes `value` as one frame and flushes.
///
/// The frame is assembled before the write so it reaches the stream in a
/// single `write_all`.
///
/// # Errors
///
/// - [`Error::Json`] if the value cannot be serialized
/// - [`Error::Connection`] if the write or flush fails
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize + ?Sized,
{
    let frame = encode_frame(value)?;

    writer
        .write_all(&frame)
        .await
        .map_err(|e| Error::connection(format!("write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::connection(format!("flush failed: {e}")))?;

    trace!(len = frame.len(), "Frame written");
    Ok(())
}

// ============================================================================
// FrameReader
// ============================================================================

/// Buffered reader that yields one frame payload at a time.
///
/// `read_frame` is not cancellation safe: dropping its future mid-frame
/// loses the partially read frame. The receive loop only cancels it when
/// the connection is shutting down.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps `reader`, rejecting frames longer than `max_len` bytes.
    pub fn new(reader: R, max_len: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_len,
        }
    }

    /// Reads the next frame payload.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between frames.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] for a malformed header, an oversized frame, or
    ///   a stream that ends inside a frame
    /// - [`Error::Connection`] for any other I/O failure
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(len) = self.read_header().await? else {
            return Ok(None);
        };

        if len > self.max_len {
            return Err(Error::protocol(format!(
                "frame length {len} exceeds maximum {}",
                self.max_len
            )));
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                Error::protocol(format!("stream ended inside a {len}-byte payload"))
            } else {
                Error::connection(format!("read failed: {e}"))
            }
        })?;

        trace!(len, "Frame read");
        Ok(Some(payload))
    }

    /// Reads the next frame and deserializes its payload.
    ///
    /// # Errors
    ///
    /// As [`FrameReader::read_frame`], plus [`Error::Protocol`] if the
    /// payload is not valid JSON for `T`.
    pub async fn read_value<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.read_frame().await? {
            Some(payload) => serde_json::from_slice(&payload)
                .map(Some)
                .map_err(|e| Error::protocol(format!("invalid frame payload: {e}"))),
            None => Ok(None),
        }
    }

    /// Reads `<digits>:` and returns the declared length.
    async fn read_header(&mut self) -> Result<Option<usize>> {
        let mut digits = String::new();

        loop {
            let byte = match self.inner.read_u8().await {
                Ok(b) => b,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    if digits.is_empty() {
                        return Ok(None);
                    }
                    return Err(Error::protocol(format!(
                        "stream ended inside length header {digits:?}"
                    )));
                }
                Err(e) => return Err(Error::connection(format!("read failed: {e}"))),
            };

            match byte {
                SEPARATOR if digits.is_empty() => {
                    return Err(Error::protocol("empty length header"));
                }
                SEPARATOR => break,
                b'0'..=b'9' if digits.len() < MAX_HEADER_DIGITS => digits.push(byte as char),
                b'0'..=b'9' => return Err(Error::protocol("length header too long")),
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected byte {other:#04x} in length header"
                    )));
                }
            }
        }

        digits
            .parse::<usize>()
            .map(Some)
            .map_err(|e| Error::protocol(format!("invalid length {digits:?}: {e}")))
    }
}

// ============================================================================
// Tests
// ============================================================================

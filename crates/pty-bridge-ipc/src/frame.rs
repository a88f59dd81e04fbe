//! Native-messaging framing: a 4-byte little-endian length followed by that many bytes of JSON.
//!
//! Readers and writers are async so the host loop can share one runtime with the
//! transport server. A writer is cloneable; every clone serializes through the same lock,
//! and a frame is always written with a single `write_all`, so frames never interleave.

use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::FrameError;
use crate::message::Message;

pub const LENGTH_PREFIX_BYTES: usize = 4;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Encodes a message into one contiguous frame buffer.
pub fn encode(message: &Message) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(message)?;
    encode_payload(&payload)
}

pub fn encode_payload(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

pub struct FrameReader<R> {
    inner: R,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Returns the next payload, or `None` when the stream ends on a frame boundary.
    ///
    /// A stream that ends inside the length prefix is also treated as a clean shutdown:
    /// the browser closes the pipe without flushing partial frames.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        let mut filled = 0;
        while filled < LENGTH_PREFIX_BYTES {
            let n = self.inner.read(&mut prefix[filled..]).await?;
            if n == 0 {
                if filled > 0 {
                    tracing::debug!(bytes = filled, "Stream ended inside length prefix");
                }
                return Ok(None);
            }
            filled += n;
        }

        let len = u32::from_le_bytes(prefix) as usize;
        if len > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }

        let mut payload = vec![0u8; len];
        let mut received = 0;
        while received < len {
            let n = self.inner.read(&mut payload[received..]).await?;
            if n == 0 {
                return Err(FrameError::Truncated {
                    expected: len,
                    received,
                });
            }
            received += n;
        }
        Ok(Some(payload))
    }
}

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<BoxedWriter>>,
}

impl FrameWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::pin(writer))),
        }
    }

    pub async fn write_message(&self, message: &Message) -> Result<(), FrameError> {
        let frame = encode(message)?;
        self.write_frame(&frame).await
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), FrameError> {
        let mut writer = self.inner.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter").finish_non_exhaustive()
    }
}

//! Length-prefixed framing for TCP streams.
//!
//! Both the signaling channel and direct peer links carry enveloped messages
//! as length-prefixed frames:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length excludes the prefix itself. A zero-length frame is legal and
//! carries nothing.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messages::{self, MessageError, WireMessage};

/// Configuration for the framing layer.
#[derive(Debug, Clone, Copy)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MiB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// The stream ended before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// A complete frame held an undecodable message.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// `true` if the stream is still usable after this error (the bad frame
    /// was fully consumed).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Message(_))
    }
}

fn eof_as_closed(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read one frame and return its payload.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(eof_as_closed)?;

    let payload_len = u32::from_le_bytes(len_buf);
    if payload_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await.map_err(eof_as_closed)?;
    }
    Ok(payload)
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    if len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: config.max_payload_size,
        });
    }

    writer.write_all(&len.to_le_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode it as `M`.
///
/// Empty frames are skipped. A frame with an unknown or corrupt message is
/// consumed and reported as [`FrameError::Message`]; the stream stays usable.
pub async fn read_message<M, R>(reader: &mut R, config: &FrameConfig) -> Result<M, FrameError>
where
    M: WireMessage,
    R: AsyncRead + Unpin,
{
    loop {
        let payload = read_frame(reader, config).await?;
        if payload.is_empty() {
            continue;
        }
        return Ok(messages::decode(&payload)?);
    }
}

/// Encode `msg` and write it as one frame.
pub async fn write_message<M, W>(
    writer: &mut W,
    msg: &M,
    config: &FrameConfig,
) -> Result<(), FrameError>
where
    M: WireMessage,
    W: AsyncWrite + Unpin,
{
    let payload = messages::encode(msg)?;
    write_frame(writer, &payload, config).await
}

//! Length-prefixed frame codec.
//!
//! A frame is a 4-byte big-endian unsigned length N, 1 ≤ N ≤ 65 536,
//! followed by N payload bytes. Frames are the atomic unit of delivery:
//! the receive side yields whole payloads only.
//!
//! A payload larger than [`MAX_FRAME`] is split into multiple frames by
//! [`write_payload`]; each arrives at the receiver as an independent
//! message. Callers that need one-frame semantics (the JSON command
//! envelope) enforce the size bound before writing.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use basecamp_core::wire::MAX_FRAME;

/// Write a payload, splitting it into frames of at most [`MAX_FRAME`] bytes.
/// The empty payload is rejected — a zero-length frame is illegal on the wire.
pub async fn write_payload<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    if payload.is_empty() {
        return Err(FrameError::EmptyPayload);
    }
    for chunk in payload.chunks(MAX_FRAME) {
        write_frame(writer, chunk).await?;
    }
    Ok(())
}

/// Write exactly one frame. The payload must be 1..=[`MAX_FRAME`] bytes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    if payload.is_empty() {
        return Err(FrameError::EmptyPayload);
    }
    if payload.len() > MAX_FRAME {
        return Err(FrameError::InvalidLength(payload.len()));
    }
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly at a frame
/// boundary. A close mid-header or mid-payload, or an out-of-range length,
/// is a framing fault and the connection must be torn down.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated);
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > MAX_FRAME {
        return Err(FrameError::InvalidLength(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    })?;
    Ok(Some(payload))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {0} outside 1..={MAX_FRAME}")]
    InvalidLength(usize),
    #[error("cannot send an empty payload")]
    EmptyPayload,
    #[error("stream closed mid-frame")]
    Truncated,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

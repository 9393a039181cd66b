//! Length-delimited JSON framing.
//!
//! A frame is a 4-byte little-endian length prefix followed by that many
//! bytes of UTF-8 JSON. The length is checked against a caller-supplied
//! ceiling before the body is read. Writes emit the whole frame in one
//! `write_all`; a partial write therefore surfaces as an I/O error and the
//! exchange is aborted without reuse.

use serde::{de::DeserializeOwned, Serialize};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream cleanly before a frame began.
    #[error("stream closed before a frame began")]
    Closed,
    /// The stream ended partway through a length prefix or body.
    #[error("frame truncated mid-stream")]
    Truncated,
    #[error("declared frame length {length} exceeds the {limit} byte ceiling")]
    TooLarge { length: usize, limit: usize },
    #[error("malformed frame body: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read one frame and decode its body as `T`.
pub async fn read_frame<R, T>(stream: &mut R, limit: usize) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = stream.read(&mut prefix[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                FrameError::Closed
            } else {
                FrameError::Truncated
            });
        }
        filled += n;
    }

    let length = u32::from_le_bytes(prefix) as usize;
    if length > limit {
        return Err(FrameError::TooLarge { length, limit });
    }

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.map_err(|error| {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(error)
        }
    })?;

    Ok(serde_json::from_slice(&body)?)
}

/// Encode `message` and write it as one frame, flushing the stream.
pub async fn write_frame<W, T>(stream: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

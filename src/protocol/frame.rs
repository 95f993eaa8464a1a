//! Length-prefixed byte framing on a reliable stream.
//!
//! Wire format:
//!
//! ```text
//! [4 bytes big-endian length][payload]
//! ```
//!
//! There is no payload cap beyond what the 32-bit length can express; the
//! services built on top exchange small JSON documents.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Encode `payload` into a single self-contained frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Write one frame, repeating partial writes until the whole frame is
/// flushed.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload);
    writer
        .write_all(&frame)
        .await
        .map_err(|_| Error::CommunicationClosed)?;
    writer.flush().await.map_err(|_| Error::CommunicationClosed)
}

/// Read one frame: 4 bytes of length, then exactly that many payload bytes.
///
/// A short read on a closed stream fails with
/// [`Error::CommunicationClosed`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|_| Error::CommunicationClosed)?;
    let len = u32::from_be_bytes(len_buf);

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|_| Error::CommunicationClosed)?;
    Ok(payload)
}

//! Frame codec.
//!
//! Every message exchanged on a channel (and every packet exchanged by the
//! bundled transport) is a frame: a 4-byte big-endian length header followed
//! by exactly that many payload bytes. There is no terminator.
//!
//! The codec does not recover partial frames. A stream that ends inside the
//! header or inside the body surfaces as the same [`std::io::ErrorKind::UnexpectedEof`]
//! I/O error.

use crate::error::WireError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length header.
pub const HEADER_LEN: usize = 4;

/// Default maximum payload size of a single frame (16 MB).
///
/// Readers reject larger declared lengths before allocating, writers refuse
/// to emit them.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode a payload into its wire form (4-byte big-endian length + payload).
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; HEADER_LEN]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Write one frame to `writer` as a single `write_all` call, then flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max: usize) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > max || payload.len() > u32::MAX as usize {
        return Err(WireError::FrameTooLarge {
            size: payload.len(),
            max,
        });
    }
    let bytes = encode_frame(payload);
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from `reader`, blocking until the whole payload arrived.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let len = decode_length(&header) as usize;
    if len > max {
        return Err(WireError::FrameTooLarge { size: len, max });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

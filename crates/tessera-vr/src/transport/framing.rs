//! Length-prefixed message framing for the TCP transport.
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────┐
//! │   Length     │            Payload               │
//! │  (4 bytes)   │           (variable)             │
//! └──────────────┴──────────────────────────────────┘
//! ```
//!
//! - **Length**: big-endian u32 payload size (excludes the header)
//! - **Payload**: postcard-encoded request or reply

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Maximum frame payload (64 MiB). A full log transfer must fit.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Encodes `value` and writes it as one frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload =
        postcard::to_allocvec(value).map_err(|e| TransportError::Framing(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            TransportError::Framing(format!("frame too large: {} bytes", payload.len()))
        })?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame and decodes it.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::Framing(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    postcard::from_bytes(&payload).map_err(|e| TransportError::Framing(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Commit, Request};
    use crate::types::{CommitNumber, OpNumber, ViewNumber};

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let request = Request::Commit(Commit {
            view: ViewNumber::new(2),
            commit_number: CommitNumber::new(OpNumber::new(7)),
        });

        write_frame(&mut a, &request).await.expect("write");
        let decoded: Request = read_frame(&mut b).await.expect("read");
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn oversized_header_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.expect("write");

        let result: Result<Request, _> = read_frame(&mut b).await;
        assert!(matches!(result, Err(TransportError::Framing(_))));
    }

    #[tokio::test]
    async fn truncated_stream_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 9, 1, 2]).await.expect("write");
        drop(a);

        let result: Result<Request, _> = read_frame(&mut b).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }
}

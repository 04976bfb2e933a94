//! Length-prefixed framing for stream transports.
//!
//! Wire format: `[4-byte big-endian length][payload]`

use crate::error::{GatewayError, GatewayResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted in a single frame (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Prefix `payload` with its length. Payloads above [`MAX_FRAME_SIZE`] are
/// refused, so every encoded frame is one `read_frame` accepts.
pub fn frame_encode(payload: &[u8]) -> GatewayResult<Vec<u8>> {
    let len = check_len(payload.len())?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

fn check_len(len: usize) -> GatewayResult<u32> {
    if len > MAX_FRAME_SIZE {
        return Err(GatewayError::Transport(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }
    u32::try_from(len).map_err(|_| GatewayError::Transport(format!("frame too large: {len} bytes")))
}

/// Read one frame. Returns `None` on a clean EOF before the length prefix.
pub async fn read_frame<R>(reader: &mut R) -> GatewayResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    check_len(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one frame and flush. An oversized payload fails before any byte is
/// written.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> GatewayResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = frame_encode(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Streaming frame decoder: accumulates bytes and yields complete payloads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every complete payload now available.
    pub fn feed(&mut self, data: &[u8]) -> GatewayResult<Vec<Vec<u8>>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        while self.buffer.len() >= 4 {
            let len =
                u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                    as usize;
            check_len(len)?;
            if self.buffer.len() < 4 + len {
                break;
            }

            frames.push(self.buffer[4..4 + len].to_vec());
            self.buffer.drain(..4 + len);
        }

        Ok(frames)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes buffered but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

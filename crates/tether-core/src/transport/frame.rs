//! Length-prefixed JSON framing for stream transports.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::TransportConfig;
use crate::error::{Result, TetherError};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    check_size(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    check_size(payload.len())?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize a message into a frame payload.
pub fn encode_payload(message: &JsonValue) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(message)?;
    check_size(bytes.len())?;
    Ok(bytes)
}

/// Parse a frame payload.
pub fn decode_payload(payload: &[u8]) -> Result<JsonValue> {
    serde_json::from_slice(payload).map_err(|e| TetherError::Json {
        message: format!("Invalid JSON frame: {}", e),
        source: Some(std::sync::Arc::new(e)),
    })
}

fn check_size(len: usize) -> Result<()> {
    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(TetherError::protocol(format!(
            "frame size {} exceeds maximum {}",
            len,
            TransportConfig::MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

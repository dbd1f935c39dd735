//! Length-prefixed framing for stream transports.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON message of len bytes]
//! ```

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::ProtocolConfig;
use crate::error::{ChannelError, Result};

/// Read one frame. Returns `None` on clean EOF (peer closed the stream).
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

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    check_size(payload.len())?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

fn check_size(len: usize) -> Result<()> {
    if len > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(ChannelError::Validation {
            field: "frame".to_string(),
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                ProtocolConfig::MAX_FRAME_SIZE
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_read_write() {
        let payload = b"{\"hello\":\"world\"}";
        let mut buf = Vec::new();
        write_frame(&mut buf, payload).await.unwrap();
        assert_eq!(&buf[..4], &(payload.len() as u32).to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame, payload);
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let len = (ProtocolConfig::MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        let mut cursor = std::io::Cursor::new(len.to_vec());
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(ChannelError::Validation { .. })
        ));
    }
}

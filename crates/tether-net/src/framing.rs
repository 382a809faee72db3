//! Length-prefixed framing for the TCP transport.
//!
//! Each frame carries one text or binary message:
//!
//! ```text
//! +-------------------+-----------+--------------------+
//! | length (4 bytes)  | kind (1)  |   payload          |
//! | u32 little-endian | 1=text    |   (length - 1)     |
//! |                   | 2=binary  |                    |
//! +-------------------+-----------+--------------------+
//! ```
//!
//! The length counts the kind byte plus the payload and never the 4 prefix
//! bytes. A length of 0 is a keepalive no-op that readers skip.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::transport::RawFrame;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed frame body (kind byte plus payload). Default: 1 MB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

const KIND_TEXT: u8 = 1;
const KIND_BINARY: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: u32, max: u32 },

    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    #[error("text frame is not valid UTF-8")]
    InvalidText,

    /// The peer closed the stream before a complete frame arrived.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn map_eof(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read the next text or binary frame, skipping keepalive no-ops.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<RawFrame, FrameError> {
    loop {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(map_eof)?;

        let frame_len = u32::from_le_bytes(len_buf);
        if frame_len == 0 {
            continue;
        }
        if frame_len > config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame_len,
                max: config.max_payload_size,
            });
        }

        let mut body = vec![0u8; frame_len as usize];
        reader.read_exact(&mut body).await.map_err(map_eof)?;

        let payload = body.split_off(1);
        return match body[0] {
            KIND_TEXT => String::from_utf8(payload)
                .map(RawFrame::Text)
                .map_err(|_| FrameError::InvalidText),
            KIND_BINARY => Ok(RawFrame::Binary(payload)),
            other => Err(FrameError::UnknownKind(other)),
        };
    }
}

/// Write a single frame and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &RawFrame,
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let (kind, payload) = match frame {
        RawFrame::Text(text) => (KIND_TEXT, text.as_bytes()),
        RawFrame::Binary(bytes) => (KIND_BINARY, bytes.as_slice()),
    };

    let len = u32::try_from(payload.len() + 1).unwrap_or(u32::MAX);
    if len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: config.max_payload_size,
        });
    }

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&[kind]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn text(s: &str) -> RawFrame {
        RawFrame::Text(s.to_string())
    }

    #[tokio::test]
    async fn test_text_and_binary_frames_keep_their_kind() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::default();

        write_frame(&mut client, &text("hello"), &config).await.unwrap();
        write_frame(&mut client, &RawFrame::Binary(vec![1, 2, 3]), &config)
            .await
            .unwrap();

        assert_eq!(read_frame(&mut server, &config).await.unwrap(), text("hello"));
        assert_eq!(
            read_frame(&mut server, &config).await.unwrap(),
            RawFrame::Binary(vec![1, 2, 3])
        );
    }

    #[tokio::test]
    async fn test_partial_read_resumes_correctly() {
        // A tiny duplex buffer forces partial writes and reads
        let (mut client, mut server) = duplex(8);
        let config = FrameConfig::default();
        let frame = text("this message is larger than the buffer");

        let write_config = config.clone();
        let sent = frame.clone();
        let write_task = tokio::spawn(async move {
            write_frame(&mut client, &sent, &write_config).await.unwrap();
        });

        let received = read_frame(&mut server, &config).await.unwrap();
        write_task.await.unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig {
            max_payload_size: 16,
        };

        client.write_all(&1024u32.to_le_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let result = read_frame(&mut server, &config).await;
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_write() {
        let (mut client, _server) = duplex(8192);
        let config = FrameConfig {
            max_payload_size: 16,
        };

        let result = write_frame(&mut client, &RawFrame::Binary(vec![0u8; 1024]), &config).await;
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_keepalive_frames_are_skipped() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::default();

        client.write_all(&0u32.to_le_bytes()).await.unwrap();
        write_frame(&mut client, &text("after"), &config).await.unwrap();

        assert_eq!(read_frame(&mut server, &config).await.unwrap(), text("after"));
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::default();

        client.write_all(&2u32.to_le_bytes()).await.unwrap();
        client.write_all(&[9, b'x']).await.unwrap();
        client.flush().await.unwrap();

        let result = read_frame(&mut server, &config).await;
        assert!(matches!(result, Err(FrameError::UnknownKind(9))));
    }

    #[tokio::test]
    async fn test_connection_closed_during_length_read() {
        let (client, mut server) = duplex(8192);
        drop(client);

        let result = read_frame(&mut server, &FrameConfig::default()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_length_prefix_is_little_endian() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::default();

        // length 6 = kind byte + "hello"
        client.write_all(&6u32.to_le_bytes()).await.unwrap();
        client.write_all(&[KIND_TEXT]).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        assert_eq!(read_frame(&mut server, &config).await.unwrap(), text("hello"));
    }
}

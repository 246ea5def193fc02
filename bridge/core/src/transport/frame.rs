//! Frame Codec
//!
//! Socket frames are length-prefixed JSON with a CRC32 checksum:
//!
//! ```text
//! +----------------+----------------+---------------------------+
//! | Length (4)     | Checksum (4)   | JSON Payload (variable)   |
//! | big-endian u32 | CRC32, BE      | ClientFrame / ServerFrame |
//! +----------------+----------------+---------------------------+
//! ```
//!
//! Length counts the payload only. The length field is validated against
//! [`MAX_FRAME_SIZE`] before anything is buffered for the payload.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Maximum payload size (10 MiB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

const HEADER_SIZE: usize = 8;

const READ_CHUNK: usize = 8 * 1024;

fn be_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(raw)
}

/// Encode one message as a frame
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    let json =
        serde_json::to_vec(msg).map_err(|e| TransportError::SerializationError(e.to_string()))?;

    if json.len() > MAX_FRAME_SIZE {
        return Err(TransportError::SerializationError(format!(
            "Frame too large: {} bytes (max: {MAX_FRAME_SIZE})",
            json.len()
        )));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
    buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&crc32fast::hash(&json).to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Encode and write one frame
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = encode(msg)?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Incremental frame decoder
///
/// Bytes are pushed as they arrive; complete frames are popped one at a time.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame, `Ok(None)` if more bytes are needed
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let len = be_u32(&self.buffer[..4]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::SerializationError(format!(
                "Frame size {len} exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }
        if self.buffer.len() < HEADER_SIZE + len {
            return Ok(None);
        }

        let expected = be_u32(&self.buffer[4..8]);
        let frame: Vec<u8> = self.buffer.drain(..HEADER_SIZE + len).collect();
        let payload = &frame[HEADER_SIZE..];

        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(TransportError::ChecksumMismatch { expected, actual });
        }

        serde_json::from_slice(payload)
            .map(Some)
            .map_err(|e| TransportError::SerializationError(e.to_string()))
    }
}

/// Reads whole frames from a byte stream
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a read half
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
        }
    }

    /// Next frame, `Ok(None)` on a clean end of stream
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some(msg) = self.decoder.decode()? {
                return Ok(Some(msg));
            }
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                if self.decoder.available() > 0 {
                    return Err(TransportError::ConnectionClosed);
                }
                return Ok(None);
            }
            self.decoder.push(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_split_delivery() {
        let frame = encode(&json!({"type": "hello", "client": "editor"})).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&frame[..5]);
        assert!(decoder.decode::<Value>().unwrap().is_none());
        decoder.push(&frame[5..]);
        assert_eq!(
            decoder.decode::<Value>().unwrap(),
            Some(json!({"type": "hello", "client": "editor"}))
        );
        assert_eq!(decoder.available(), 0);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut bytes = encode(&json!(1)).unwrap();
        bytes.extend(encode(&json!(2)).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert_eq!(decoder.decode::<Value>().unwrap(), Some(json!(1)));
        assert_eq!(decoder.decode::<Value>().unwrap(), Some(json!(2)));
        assert_eq!(decoder.decode::<Value>().unwrap(), None);
    }

    #[test]
    fn test_corruption_detected() {
        let mut frame = encode(&json!({"id": 7})).unwrap();
        let last = frame.len() - 2;
        frame[last] ^= 0x01;

        let mut decoder = FrameDecoder::new();
        decoder.push(&frame);
        assert!(matches!(
            decoder.decode::<Value>(),
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes());
        decoder.push(&[0u8; 4]);
        assert!(matches!(
            decoder.decode::<Value>(),
            Err(TransportError::SerializationError(_))
        ));
    }

    #[test]
    fn test_encode_too_large() {
        let big = "x".repeat(MAX_FRAME_SIZE);
        assert!(matches!(encode(&big), Err(TransportError::SerializationError(_))));
    }

    #[tokio::test]
    async fn test_reader_over_stream() {
        let (mut client, server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            write_frame(&mut client, &json!({"n": 1})).await.unwrap();
            write_frame(&mut client, &json!({"n": "x".repeat(200)})).await.unwrap();
        });

        let mut reader = FrameReader::new(server);
        assert_eq!(reader.next::<Value>().await.unwrap(), Some(json!({"n": 1})));
        let second = reader.next::<Value>().await.unwrap().unwrap();
        assert_eq!(second["n"].as_str().map(str::len), Some(200));
        writer.await.unwrap();
        assert_eq!(reader.next::<Value>().await.unwrap(), None);
    }

    #[test]
    fn test_reader_truncated_stream() {
        let frame = encode(&json!({"id": 3})).unwrap();
        let mock = tokio_test::io::Builder::new()
            .read(&frame[..3])
            .read(&frame[3..frame.len() - 1])
            .build();

        let mut reader = FrameReader::new(mock);
        let result = tokio_test::block_on(reader.next::<Value>());
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }
}

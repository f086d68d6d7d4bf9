//! Length-prefixed bincode framing
//!
//! A frame is a 4-byte big-endian body length followed by the bincode
//! encoding of one message. The reader enforces a length cap before
//! allocating, so a corrupt or hostile peer cannot ask for an absurd
//! buffer.

use cascade_common::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default frame cap: the default blob size limit plus envelope slack
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024 * 1024 + 4096;

/// Encode a message into a framed buffer
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(msg).map_err(|e| Error::protocol(e.to_string()))?;
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode one frame body
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    bincode::deserialize(body).map_err(|e| Error::protocol(e.to_string()))
}

/// Read one frame, or `None` on clean end of stream
///
/// A stream that ends mid-frame is a protocol error, not a clean close.
pub async fn read_frame<R, T>(reader: &mut R, max_len: usize) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max_len {
        return Err(Error::protocol(format!(
            "frame length {len} exceeds limit {max_len}"
        )));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|_| Error::protocol("truncated frame"))?;
    decode(&body).map(Some)
}

/// Write one framed message
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = encode(msg)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Request, RequestFrame};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let frame = RequestFrame {
            seq: 7,
            body: Request::Store {
                data: Bytes::from_static(b"abc"),
            },
        };
        let mut buf = encode(&frame).unwrap();
        let mut reader = buf.as_slice();
        let decoded: RequestFrame = read_frame(&mut reader, DEFAULT_MAX_FRAME)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decoded.seq, 7);
        match decoded.body {
            Request::Store { data } => assert_eq!(&data[..], b"abc"),
            other => panic!("unexpected body: {other:?}"),
        }
        // Stream exhausted: clean EOF
        buf.clear();
        let mut reader = buf.as_slice();
        let next: Option<RequestFrame> = read_frame(&mut reader, DEFAULT_MAX_FRAME).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_frame_length_cap() {
        let frame = RequestFrame {
            seq: 1,
            body: Request::Flush,
        };
        let buf = encode(&frame).unwrap();
        let mut reader = buf.as_slice();
        let err = read_frame::<_, RequestFrame>(&mut reader, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let frame = RequestFrame {
            seq: 1,
            body: Request::Store {
                data: Bytes::from_static(b"hello world"),
            },
        };
        let buf = encode(&frame).unwrap();
        let mut reader = &buf[..buf.len() - 3];
        let err = read_frame::<_, RequestFrame>(&mut reader, DEFAULT_MAX_FRAME)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}

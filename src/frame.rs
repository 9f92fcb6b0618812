//! Length-prefixed framing over a byte stream.
//!
//! One frame carries one opaque payload:
//! ```text
//! ┌────────────────────┬──────────────────────────┐
//! │ Length             │ Payload                  │
//! │ 4 (or 8) bytes, BE │ exactly `Length` bytes   │
//! └────────────────────┴──────────────────────────┘
//! ```
//!
//! No magic number, version or checksum. Reads and writes loop over partial
//! I/O until the whole frame has moved or the stream fails; each individual
//! read or write call can be bounded by an I/O timeout.

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Phase, ProtocolError, Result};

/// Default cap on a decoded payload (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Width of the length prefix. Both ends of an exchange must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthPrefix {
    /// 4-byte unsigned, network byte order.
    #[default]
    U32,
    /// 8-byte unsigned, network byte order.
    U64,
}

impl LengthPrefix {
    /// Prefix size in bytes.
    #[inline]
    pub const fn width(self) -> usize {
        match self {
            LengthPrefix::U32 => 4,
            LengthPrefix::U64 => 8,
        }
    }

    /// Largest payload length the prefix can carry.
    #[inline]
    pub const fn max_len(self) -> u64 {
        match self {
            LengthPrefix::U32 => u32::MAX as u64,
            LengthPrefix::U64 => u64::MAX,
        }
    }

    fn put(self, len: u64, buf: &mut BytesMut) {
        match self {
            LengthPrefix::U32 => buf.put_u32(len as u32),
            LengthPrefix::U64 => buf.put_u64(len),
        }
    }

    fn decode(self, buf: &[u8]) -> u64 {
        match self {
            LengthPrefix::U32 => u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64,
            LengthPrefix::U64 => u64::from_be_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
        }
    }
}

/// Encode a payload as a frame with the default 4-byte prefix.
///
/// # Example
///
/// ```
/// let frame = tcpserv::frame::encode_frame(b"hi").unwrap();
/// assert_eq!(&frame[..], &[0, 0, 0, 2, b'h', b'i']);
/// ```
pub fn encode_frame(payload: &[u8]) -> std::result::Result<Bytes, ProtocolError> {
    FrameCodec::default().encode(payload)
}

/// Frame reader/writer. Stateless: one codec can serve any number of
/// streams and calls.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    prefix: LengthPrefix,
    max_payload_bytes: usize,
    io_timeout: Option<Duration>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(LengthPrefix::U32)
    }
}

impl FrameCodec {
    pub fn new(prefix: LengthPrefix) -> Self {
        Self {
            prefix,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            io_timeout: None,
        }
    }

    /// Cap applied to decoded lengths.
    pub fn with_max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = max;
        self
    }

    /// Bound on every individual read or write call.
    pub fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn prefix(&self) -> LengthPrefix {
        self.prefix
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    /// Build `prefix(len) ++ payload`.
    ///
    /// Only the prefix width bounds the payload here; callers impose their
    /// own cap if they want one.
    pub fn encode(&self, payload: &[u8]) -> std::result::Result<Bytes, ProtocolError> {
        let len = payload.len() as u64;
        if len > self.prefix.max_len() {
            return Err(ProtocolError::MalformedLength {
                declared: len,
                max: self.prefix.max_len(),
            });
        }
        let mut buf = BytesMut::with_capacity(self.prefix.width() + payload.len());
        self.prefix.put(len, &mut buf);
        buf.extend_from_slice(payload);
        Ok(buf.freeze())
    }

    /// Write one complete frame and flush.
    pub async fn write_frame<W>(&self, writer: &mut W, payload: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(payload)?;
        let mut written = 0;
        while written < frame.len() {
            let n = self
                .timed(Phase::Write, writer.write(&frame[written..]))
                .await?;
            if n == 0 {
                return Err(Error::Connection(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer stopped accepting frame bytes",
                )));
            }
            written += n;
        }
        self.timed(Phase::Write, writer.flush()).await
    }

    /// Read one complete frame and return its payload.
    ///
    /// The declared length is checked against the cap before any payload
    /// byte is read, and the payload buffer is allocated once at the exact
    /// declared size.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Bytes>
    where
        R: AsyncRead + Unpin,
    {
        let width = self.prefix.width();
        let mut header = [0u8; 8];
        let received = self.fill(reader, &mut header[..width]).await?;
        if received < width {
            return Err(ProtocolError::IncompleteHeader {
                received,
                expected: width,
            }
            .into());
        }

        let declared = self.prefix.decode(&header[..width]);
        let len = match usize::try_from(declared) {
            Ok(len) if len <= self.max_payload_bytes => len,
            _ => {
                return Err(ProtocolError::MalformedLength {
                    declared,
                    max: self.max_payload_bytes as u64,
                }
                .into())
            }
        };

        let mut payload = BytesMut::zeroed(len);
        let received = self.fill(reader, &mut payload).await?;
        if received < len {
            return Err(ProtocolError::IncompletePayload {
                received,
                expected: len,
            }
            .into());
        }
        Ok(payload.freeze())
    }

    /// Read until `buf` is full or the peer closes; returns bytes filled.
    async fn fill<R>(&self, reader: &mut R, buf: &mut [u8]) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.timed(Phase::Read, reader.read(&mut buf[filled..])).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn timed<T, F>(&self, phase: Phase, io: F) -> Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        match self.io_timeout {
            Some(after) => match tokio::time::timeout(after, io).await {
                Ok(res) => res.map_err(Error::Connection),
                Err(_) => Err(Error::Timeout { phase, after }),
            },
            None => io.await.map_err(Error::Connection),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    async fn roundtrip(codec: FrameCodec, payload: &[u8]) -> Bytes {
        let (mut a, mut b) = tokio::io::duplex(64);
        let owned = payload.to_vec();
        let writer = tokio::spawn(async move { codec.write_frame(&mut a, &owned).await });
        let out = codec.read_frame(&mut b).await.unwrap();
        writer.await.unwrap().unwrap();
        out
    }

    #[test]
    fn test_encode_layout_big_endian() {
        let frame = encode_frame(b"hello").unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 5]);
        assert_eq!(&frame[4..], b"hello");

        let frame = FrameCodec::new(LengthPrefix::U64)
            .encode(&[0xAB; 0x0102])
            .unwrap();
        assert_eq!(&frame[..8], &[0, 0, 0, 0, 0, 0, 0x01, 0x02]);
        assert_eq!(frame.len(), 8 + 0x0102);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let codec = FrameCodec::default();
        assert_eq!(codec.encode(b"same").unwrap(), codec.encode(b"same").unwrap());
        assert_eq!(encode_frame(b"").unwrap().as_ref(), &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_roundtrip_payloads() {
        let all_bytes: Vec<u8> = (0..=255u8).collect();
        let large = vec![7u8; 200_000];
        for prefix in [LengthPrefix::U32, LengthPrefix::U64] {
            let codec = FrameCodec::new(prefix);
            for payload in [&b""[..], &b"hello"[..], &all_bytes[..], &large[..]] {
                assert_eq!(roundtrip(codec, payload).await, payload);
            }
        }
    }

    #[tokio::test]
    async fn test_read_over_partial_reads() {
        let mut mock = Builder::new()
            .read(&[0, 0])
            .read(&[0, 5, b'h'])
            .read(b"el")
            .read(b"lo")
            .build();
        let payload = FrameCodec::default().read_frame(&mut mock).await.unwrap();
        assert_eq!(payload, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_zero_length_is_empty_payload() {
        let mut mock = Builder::new().read(&[0, 0, 0, 0]).build();
        let payload = FrameCodec::default().read_frame(&mut mock).await.unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_before_payload() {
        // Only the header is available: reaching the payload would report
        // IncompletePayload instead.
        let mut mock = Builder::new().read(&[0, 0, 0, 11]).build();
        let err = FrameCodec::default()
            .with_max_payload_bytes(10)
            .read_frame(&mut mock)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::MalformedLength {
                declared: 11,
                max: 10
            })
        ));
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let mut mock = Builder::new().read(&[0, 0]).build();
        let err = FrameCodec::default().read_frame(&mut mock).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::IncompleteHeader {
                received: 2,
                expected: 4
            })
        ));

        let mut mock = Builder::new().build();
        let err = FrameCodec::default().read_frame(&mut mock).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::IncompleteHeader { received: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let mut mock = Builder::new().read(&[0, 0, 0, 5]).read(b"hel").build();
        let err = FrameCodec::default().read_frame(&mut mock).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::IncompletePayload {
                received: 3,
                expected: 5
            })
        ));
    }

    #[tokio::test]
    async fn test_write_over_partial_writes() {
        let mut mock = Builder::new()
            .write(&[0, 0, 0, 5])
            .wait(Duration::from_millis(5))
            .write(b"he")
            .wait(Duration::from_millis(5))
            .write(b"llo")
            .build();
        FrameCodec::default()
            .write_frame(&mut mock, b"hello")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_write_error_is_connection_error() {
        let mut mock = Builder::new()
            .write(&[0, 0, 0, 3])
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))
            .build();
        let err = FrameCodec::default()
            .write_frame(&mut mock, b"abc")
            .await
            .unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_read_stall_times_out() {
        let mut mock = Builder::new()
            .read(&[0, 0])
            .wait(Duration::from_millis(500))
            .build();
        let err = FrameCodec::default()
            .with_io_timeout(Some(Duration::from_millis(20)))
            .read_frame(&mut mock)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                phase: Phase::Read,
                ..
            }
        ));
    }
}

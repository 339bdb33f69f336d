//! Binary wire framing primitives.
//!
//! All multi-byte integers travel big-endian. Variable-length elements
//! are length-prefixed: strings with a `u16` prefix and UTF-8 bytes,
//! blobs with a `u32` prefix. Length prefixes are validated against
//! the caps in [`super::error`] before any allocation, so a hostile
//! length field cannot drive memory exhaustion.
//!
//! Writes are buffered; callers must invoke [`WireWriter::flush`] at
//! message boundaries.

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};

use super::error::{ProtocolError, ProtocolResult, MAX_BLOB_SIZE, MAX_STRING_LEN};

/// Reply marker: the request succeeded; payload follows.
pub const MARKER_SUCCESS: u8 = 1;
/// Reply marker: I/O failure; a message string follows.
pub const MARKER_FAIL_IO: u8 = 2;
/// Reply marker: data failure; a message string follows.
pub const MARKER_FAIL_DATA: u8 = 3;

/// Marker trait for transports usable under the protocol.
///
/// Blanket-implemented for everything that is async-readable,
/// async-writable, and sendable across task boundaries; this is what
/// lets plain TCP and TLS streams flow through the same connection
/// driver.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A type-erased protocol transport.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Reader half handed to command handlers for argument decoding.
pub type RequestReader = WireReader<BufReader<ReadHalf<BoxedStream>>>;

/// Writer half used by the connection driver for replies.
pub type ResponseWriter = WireWriter<BufWriter<WriteHalf<BoxedStream>>>;

/// Decodes protocol primitives from an async byte stream.
#[derive(Debug)]
pub struct WireReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    /// Wrap a readable transport.
    pub const fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read a single byte.
    pub async fn read_u8(&mut self) -> ProtocolResult<u8> {
        Ok(self.inner.read_u8().await?)
    }

    /// Read a big-endian `u16`.
    pub async fn read_u16(&mut self) -> ProtocolResult<u16> {
        Ok(self.inner.read_u16().await?)
    }

    /// Read a big-endian `u32`.
    pub async fn read_u32(&mut self) -> ProtocolResult<u32> {
        Ok(self.inner.read_u32().await?)
    }

    /// Read a big-endian `u64`.
    pub async fn read_u64(&mut self) -> ProtocolResult<u64> {
        Ok(self.inner.read_u64().await?)
    }

    /// Read a big-endian `i64`.
    pub async fn read_i64(&mut self) -> ProtocolResult<i64> {
        Ok(self.inner.read_i64().await?)
    }

    /// Read a strict boolean: exactly `0` or `1`.
    ///
    /// # Errors
    ///
    /// Any other byte value is a framing error and fatal to the
    /// connection.
    pub async fn read_bool(&mut self) -> ProtocolResult<bool> {
        match self.inner.read_u8().await? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::invalid_frame(format!(
                "boolean byte must be 0 or 1, got {other}"
            ))),
        }
    }

    /// Read a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Fails if the length prefix exceeds [`MAX_STRING_LEN`] or the
    /// bytes are not valid UTF-8.
    pub async fn read_string(&mut self) -> ProtocolResult<String> {
        let len = usize::from(self.inner.read_u16().await?);
        if len > MAX_STRING_LEN {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_STRING_LEN,
            });
        }
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;
        String::from_utf8(buf)
            .map_err(|e| ProtocolError::invalid_frame(format!("string is not valid UTF-8: {e}")))
    }

    /// Read a length-prefixed byte blob. A zero-length blob is valid
    /// and returns an empty vector.
    ///
    /// # Errors
    ///
    /// Fails if the length prefix exceeds [`MAX_BLOB_SIZE`].
    pub async fn read_blob(&mut self) -> ProtocolResult<Vec<u8>> {
        let len = self.inner.read_u32().await? as usize;
        if len > MAX_BLOB_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_BLOB_SIZE,
            });
        }
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

/// Encodes protocol primitives onto an async byte stream.
#[derive(Debug)]
pub struct WireWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    /// Wrap a writable transport.
    pub const fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write a single byte.
    pub async fn write_u8(&mut self, value: u8) -> ProtocolResult<()> {
        Ok(self.inner.write_u8(value).await?)
    }

    /// Write a big-endian `u16`.
    pub async fn write_u16(&mut self, value: u16) -> ProtocolResult<()> {
        Ok(self.inner.write_u16(value).await?)
    }

    /// Write a big-endian `u64`.
    pub async fn write_u64(&mut self, value: u64) -> ProtocolResult<()> {
        Ok(self.inner.write_u64(value).await?)
    }

    /// Write a boolean as a single `0`/`1` byte.
    pub async fn write_bool(&mut self, value: bool) -> ProtocolResult<()> {
        Ok(self.inner.write_u8(u8::from(value)).await?)
    }

    /// Write a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Fails if the string exceeds [`MAX_STRING_LEN`] bytes; callers
    /// build messages locally so this indicates a local bug, but it is
    /// checked rather than truncated silently.
    pub async fn write_string(&mut self, value: &str) -> ProtocolResult<()> {
        if value.len() > MAX_STRING_LEN {
            return Err(ProtocolError::FrameTooLarge {
                size: value.len(),
                max: MAX_STRING_LEN,
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        self.inner.write_u16(value.len() as u16).await?;
        self.inner.write_all(value.as_bytes()).await?;
        Ok(())
    }

    /// Write a length-prefixed byte blob.
    pub async fn write_blob(&mut self, value: &[u8]) -> ProtocolResult<()> {
        if value.len() > MAX_BLOB_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: value.len(),
                max: MAX_BLOB_SIZE,
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        self.inner.write_u32(value.len() as u32).await?;
        self.inner.write_all(value).await?;
        Ok(())
    }

    /// Write pre-encoded bytes verbatim (handler reply payloads).
    pub async fn write_raw(&mut self, bytes: &[u8]) -> ProtocolResult<()> {
        self.inner.write_all(bytes).await?;
        Ok(())
    }

    /// Flush buffered output to the transport.
    pub async fn flush(&mut self) -> ProtocolResult<()> {
        Ok(self.inner.flush().await?)
    }
}

/// Append a length-prefixed string to a reply payload buffer.
///
/// Handlers build their success payloads in memory; the connection
/// driver writes them after the success marker.
pub fn put_string(buf: &mut Vec<u8>, value: &str) {
    debug_assert!(value.len() <= MAX_STRING_LEN);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

/// Append a length-prefixed blob to a reply payload buffer.
pub fn put_blob(buf: &mut Vec<u8>, value: &[u8]) {
    debug_assert!(value.len() <= MAX_BLOB_SIZE);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

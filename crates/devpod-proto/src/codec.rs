//! Frame codec for async streams

use crate::{Frame, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame codec for encoding/decoding frames over async streams
pub struct FrameCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum frame size allowed
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with default settings
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a new frame codec with custom max frame size
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_frame_size,
        }
    }

    /// Encode a frame to bytes with length prefix
    pub fn encode_frame(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let frame_bytes = frame.to_msgpack()?;

        if frame_bytes.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_bytes.len(),
                max: self.max_frame_size,
            });
        }

        let mut buf = BytesMut::with_capacity(4 + frame_bytes.len());
        buf.put_u32(frame_bytes.len() as u32);
        buf.put_slice(&frame_bytes);

        Ok(buf.freeze())
    }

    /// Write a frame to an async writer
    pub async fn write_frame<W>(&self, writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let encoded = self.encode_frame(frame)?;
        writer.write_all(&encoded).await.map_err(map_io)?;
        writer.flush().await.map_err(map_io)?;
        Ok(())
    }

    /// Read a frame from an async reader.
    ///
    /// Returns `Ok(None)` on a clean end of stream. A stream that ends in the
    /// middle of a frame is reported as [`ProtocolError::ConnectionClosed`].
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Frame>, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if let Some(frame) = self.try_decode_frame()? {
                return Ok(Some(frame));
            }

            let n = reader.read_buf(&mut self.read_buf).await.map_err(map_io)?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::ConnectionClosed);
            }
        }
    }

    /// Try to decode a frame from the internal buffer
    pub fn try_decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }

        // Peek the length prefix without consuming it
        let frame_len = (&self.read_buf[..4]).get_u32() as usize;

        if frame_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        if self.read_buf.len() < 4 + frame_len {
            return Ok(None);
        }

        self.read_buf.advance(4);
        let frame_data = self.read_buf.split_to(frame_len);

        let frame = Frame::from_msgpack(&frame_data)?;
        Ok(Some(frame))
    }

    /// Get the current buffer size
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }
}

fn map_io(error: std::io::Error) -> ProtocolError {
    match error.kind() {
        ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset => {
            ProtocolError::ConnectionClosed
        }
        _ => ProtocolError::Io(error),
    }
}

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Cloneable frame sink shared by every task writing to one connection.
///
/// Each frame is written under the lock, so frames from concurrent calls
/// interleave on the wire but never tear.
#[derive(Clone)]
pub struct FrameWriter {
    writer: SharedWriter,
    codec: Arc<FrameCodec>,
}

impl FrameWriter {
    /// Wrap a writer
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            codec: Arc::new(FrameCodec::new()),
        }
    }

    /// Write one frame
    pub async fn send(&self, frame: &Frame) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        self.codec.write_frame(&mut *writer, frame).await
    }

    /// Shut the underlying writer down
    pub async fn shutdown(&self) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(map_io)
    }
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter").finish_non_exhaustive()
    }
}

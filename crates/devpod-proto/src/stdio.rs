//! Stdio stream adapter
//!
//! [`StdioStream`] joins a reader and a writer (usually a process's stdin and
//! stdout, or the pipes of a spawned child) into one full-duplex byte stream.
//! It has no framing of its own.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Reader/writer pair exposed as a single connection
#[derive(Debug)]
pub struct StdioStream<R, W> {
    reader: R,
    writer: W,
    exit_on_close: bool,
}

impl<R, W> StdioStream<R, W> {
    /// Join `reader` and `writer`. When `exit_on_close` is set, shutting the
    /// stream down terminates the hosting process.
    pub fn new(reader: R, writer: W, exit_on_close: bool) -> Self {
        Self {
            reader,
            writer,
            exit_on_close,
        }
    }

    /// Split back into the underlying halves
    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

impl StdioStream<tokio::io::Stdin, tokio::io::Stdout> {
    /// The hosting process's own stdin and stdout
    pub fn from_stdio(exit_on_close: bool) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), exit_on_close)
    }
}

impl<R, W> AsyncRead for StdioStream<R, W>
where
    R: AsyncRead + Unpin,
    W: Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl<R, W> AsyncWrite for StdioStream<R, W>
where
    R: Unpin,
    W: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let writer = &mut self.get_mut().writer;
        let mut written = 0;

        while written < buf.len() {
            match Pin::new(&mut *writer).poll_write(cx, &buf[written..]) {
                Poll::Ready(Ok(0)) => {
                    if written > 0 {
                        break;
                    }
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => written += n,
                // report what already went out; the error resurfaces on the next call
                Poll::Ready(Err(_)) | Poll::Pending if written > 0 => break,
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Pending => return Poll::Pending,
            }
        }

        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = ready!(Pin::new(&mut this.writer).poll_shutdown(cx));

        if this.exit_on_close {
            debug!("stdio stream closed, exiting");
            std::process::exit(0);
        }
        Poll::Ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Writer that accepts at most `limit` bytes per call
    struct Trickle {
        inner: Vec<u8>,
        limit: usize,
        calls: usize,
    }

    impl AsyncWrite for Trickle {
        fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            let n = buf.len().min(self.limit);
            self.inner.extend_from_slice(&buf[..n]);
            self.calls += 1;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_partial_writes_are_looped() {
        let writer = Trickle {
            inner: Vec::new(),
            limit: 3,
            calls: 0,
        };
        let mut stream = StdioStream::new(tokio::io::empty(), writer, false);

        let n = stream.write(b"hello world").await.unwrap();
        assert_eq!(n, 11);

        let (_, writer) = stream.into_inner();
        assert_eq!(writer.inner, b"hello world");
        assert_eq!(writer.calls, 4);
    }

    #[tokio::test]
    async fn test_eof_is_orderly() {
        let mut stream = StdioStream::new(tokio::io::empty(), tokio::io::sink(), false);
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_writer() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut stream = StdioStream::new(tokio::io::empty(), local, false);

        stream.write_all(b"bye").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
    }

    proptest! {
        #[test]
        fn test_loopback_preserves_bytes(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..512), 1..16)
        ) {
            tokio_test::block_on(async {
                // a -> b through one adapter, b -> a through the other
                let (a_out, b_in) = tokio::io::duplex(256);
                let (b_out, a_in) = tokio::io::duplex(256);
                let mut a = StdioStream::new(a_in, a_out, false);
                let mut b = StdioStream::new(b_in, b_out, false);

                let expected: Vec<u8> = chunks.concat();
                let writer = async {
                    for chunk in &chunks {
                        a.write_all(chunk).await.unwrap();
                    }
                    a.shutdown().await.unwrap();
                };
                let reader = async {
                    let mut received = Vec::new();
                    b.read_to_end(&mut received).await.unwrap();
                    received
                };

                let ((), received) = tokio::join!(writer, reader);
                prop_assert_eq!(received, expected);
                Ok(())
            })?;
        }
    }
}

//! Agent-side control plane client
//!
//! The agent calls the operator through this client. Calls are multiplexed
//! over one connection: each call opens a stream, and a background task routes
//! reply frames to the waiting caller. Chunk streams hand credit back to the
//! server as the reader consumes them, so an idle reader stalls the sender
//! instead of queueing the whole archive.

use crate::workspace::WorkspaceInfo;
use crate::TunnelError;
use bytes::{Buf, Bytes};
use devpod_proto::message::{decode, encode};
use devpod_proto::{
    ErrorCode, ErrorDetails, Frame, FrameCodec, FrameWriter, LogLevel, ProtocolError, Request,
    Response, StdioStream, StreamHandle, StreamMultiplexer,
};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Client half of the control channel
#[derive(Clone)]
pub struct ControlPlaneClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    writer: FrameWriter,
    streams: Arc<StreamMultiplexer>,
    credits: mpsc::UnboundedSender<Frame>,
    reader_task: JoinHandle<()>,
    credit_task: JoinHandle<()>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.credit_task.abort();
    }
}

impl std::fmt::Debug for ControlPlaneClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneClient")
            .field("closed", &self.inner.streams.is_closed())
            .finish_non_exhaustive()
    }
}

impl ControlPlaneClient {
    /// Start a client on a connection without handshaking
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer = FrameWriter::new(writer);
        let streams = Arc::new(StreamMultiplexer::new());
        let reader_task = tokio::spawn(route_replies(reader, streams.clone(), writer.clone()));
        let (credits, pending) = mpsc::unbounded_channel();
        let credit_task = tokio::spawn(grant_credit(pending, writer.clone()));

        Self {
            inner: Arc::new(ClientInner {
                writer,
                streams,
                credits,
                reader_task,
                credit_task,
            }),
        }
    }

    /// Start a client and complete the ping round trip within `ping_timeout`
    pub async fn connect<R, W>(reader: R, writer: W, ping_timeout: Duration) -> Result<Self, TunnelError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let client = Self::new(reader, writer);
        match tokio::time::timeout(ping_timeout, client.ping()).await {
            Ok(Ok(())) => Ok(client),
            Ok(Err(e)) => Err(TunnelError::Handshake { source: Box::new(e) }),
            Err(_) => Err(TunnelError::HandshakeTimeout { timeout: ping_timeout }),
        }
    }

    /// Connect over the process's own stdin and stdout. With `exit_on_close`
    /// the process exits once the server closes the channel.
    pub async fn from_stdio(exit_on_close: bool, ping_timeout: Duration) -> Result<Self, TunnelError> {
        let (reader, writer) = tokio::io::split(StdioStream::from_stdio(exit_on_close));
        Self::connect(reader, writer, ping_timeout).await
    }

    /// Whether the connection is gone
    pub fn is_closed(&self) -> bool {
        self.inner.streams.is_closed()
    }

    /// Close the outgoing half of the connection
    pub async fn close(&self) -> Result<(), TunnelError> {
        self.inner.writer.shutdown().await?;
        Ok(())
    }

    /// Handshake call
    pub async fn ping(&self) -> Result<(), TunnelError> {
        expect_empty(self.unary(&Request::Ping).await?)
    }

    /// Push a log line to the operator
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> Result<(), TunnelError> {
        expect_empty(self.unary(&Request::log(level, message)).await?)
    }

    /// Fetch the workspace payload
    pub async fn workspace(&self) -> Result<WorkspaceInfo, TunnelError> {
        match self.unary(&Request::Workspace).await? {
            Response::WorkspaceInfo { json } => WorkspaceInfo::from_json(json),
            other => Err(unexpected(&other)),
        }
    }

    /// Deliver the JSON result of the operation. Accepted once per server.
    pub async fn send_result(&self, result: impl Into<String>) -> Result<(), TunnelError> {
        expect_empty(self.unary(&Request::SendResult { result: result.into() }).await?)
    }

    /// Stream the operator's local workspace folder
    pub async fn stream_workspace(&self) -> Result<ChunkReader, TunnelError> {
        self.streaming(&Request::StreamWorkspace).await
    }

    /// Clone the workspace repository on the operator host and stream it
    pub async fn stream_git_clone(&self) -> Result<ChunkReader, TunnelError> {
        self.streaming(&Request::StreamGitClone).await
    }

    /// Stream an allowed mount from the operator host
    pub async fn stream_mount(&self, mount: impl Into<String>) -> Result<ChunkReader, TunnelError> {
        self.streaming(&Request::StreamMount { mount: mount.into() }).await
    }

    async fn start(&self, request: &Request) -> Result<StreamHandle, TunnelError> {
        let handle = self.inner.streams.open_stream().await?;
        let frame = Frame::request(handle.stream_id(), encode(request)?);

        trace!(stream_id = handle.stream_id(), call = request.name(), "sending request");
        if let Err(e) = self.inner.writer.send(&frame).await {
            self.inner.streams.close_stream(handle.stream_id()).await;
            return Err(e.into());
        }
        Ok(handle)
    }

    async fn unary(&self, request: &Request) -> Result<Response, TunnelError> {
        let mut handle = self.start(request).await?;
        let frame = handle.next_frame().await?;

        if frame.is_error() {
            return Err(TunnelError::Remote(decode(&frame.payload)?));
        }
        if !frame.is_end_stream() {
            self.inner.streams.close_stream(handle.stream_id()).await;
            return Err(TunnelError::Protocol(ProtocolError::UnexpectedResponse(format!(
                "{} answered with a stream",
                request.name()
            ))));
        }
        Ok(decode(&frame.payload)?)
    }

    async fn streaming(&self, request: &Request) -> Result<ChunkReader, TunnelError> {
        let handle = self.start(request).await?;
        Ok(ChunkReader::new(handle, self.inner.credits.clone()))
    }
}

fn expect_empty(response: Response) -> Result<(), TunnelError> {
    match response {
        Response::Empty => Ok(()),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &Response) -> TunnelError {
    let kind = match response {
        Response::Empty => "empty",
        Response::WorkspaceInfo { .. } => "workspace info",
        Response::Chunk { .. } => "chunk",
    };
    TunnelError::Protocol(ProtocolError::UnexpectedResponse(format!("unexpected {} reply", kind)))
}

async fn route_replies<R>(mut reader: R, streams: Arc<StreamMultiplexer>, writer: FrameWriter)
where
    R: AsyncRead + Unpin,
{
    let mut codec = FrameCodec::new();
    loop {
        match codec.read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if let Err(e) = streams.route_frame(frame).await {
                    debug!("dropping reply frame: {}", e);
                }
            }
            Ok(None) => {
                debug!("server closed the control channel");
                break;
            }
            Err(e) => {
                warn!("control channel read failed: {}", e);
                break;
            }
        }
    }

    streams.close_all().await;
    if let Err(e) = writer.shutdown().await {
        trace!("control channel shutdown: {}", e);
    }
}

async fn grant_credit(mut pending: mpsc::UnboundedReceiver<Frame>, writer: FrameWriter) {
    while let Some(update) = pending.recv().await {
        if let Err(e) = writer.send(&update).await {
            trace!("window update not delivered: {}", e);
            break;
        }
    }
}

/// Error reported by the server in place of the end of a chunk stream
#[derive(Debug, Clone, Default)]
pub(crate) struct RemoteErrorSlot(Arc<Mutex<Option<ErrorDetails>>>);

impl RemoteErrorSlot {
    fn set(&self, details: ErrorDetails) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(details);
    }

    pub(crate) fn get(&self) -> Option<ErrorDetails> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

/// Byte stream over the chunks of a streaming call.
///
/// Reaches EOF when the server ends the stream. An error reported by the
/// server surfaces as an [`io::Error`] wrapping its [`ErrorDetails`].
pub struct ChunkReader {
    handle: StreamHandle,
    credits: mpsc::UnboundedSender<Frame>,
    current: Bytes,
    done: bool,
    remote_error: RemoteErrorSlot,
}

impl ChunkReader {
    fn new(handle: StreamHandle, credits: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            handle,
            credits,
            current: Bytes::new(),
            done: false,
            remote_error: RemoteErrorSlot::default(),
        }
    }

    /// Error the server reported for this stream, if any
    pub fn remote_error(&self) -> Option<ErrorDetails> {
        self.remote_error.get()
    }

    pub(crate) fn remote_error_slot(&self) -> RemoteErrorSlot {
        self.remote_error.clone()
    }
}

impl std::fmt::Debug for ChunkReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkReader")
            .field("stream_id", &self.handle.stream_id())
            .field("buffered", &self.current.len())
            .field("done", &self.done)
            .finish()
    }
}

impl AsyncRead for ChunkReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.current.is_empty() {
                let len = this.current.len().min(buf.remaining());
                buf.put_slice(&this.current[..len]);
                this.current.advance(len);
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }

            let frame = match ready!(this.handle.poll_frame(cx)) {
                Ok(frame) => frame,
                Err(e) => {
                    this.done = true;
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionAborted, e)));
                }
            };

            if frame.is_error() {
                this.done = true;
                let details = decode::<ErrorDetails>(&frame.payload)
                    .unwrap_or_else(|e| ErrorDetails::new(ErrorCode::Internal, e.to_string()));
                this.remote_error.set(details.clone());
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, details)));
            }
            if frame.is_end_stream() {
                this.done = true;
                continue;
            }
            if let Some(credit) = this.handle.take_credit() {
                // a closed channel means the connection is going away anyway
                let _ = this.credits.send(Frame::window_update(this.handle.stream_id(), credit));
            }

            match decode::<Response>(&frame.payload) {
                Ok(Response::Chunk { content }) => this.current = content,
                Ok(other) => {
                    this.done = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        unexpected(&other),
                    )));
                }
                Err(e) => {
                    this.done = true;
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, e)));
                }
            }
        }
    }
}

//! Operator-side control plane server
//!
//! The server runs in the operator CLI on top of the stdio of the agent
//! process it launched. Every call arrives as frame 0 of a fresh stream and is
//! handled in its own task, so a long transfer never blocks log lines or the
//! final result. Chunk streams only send as much as the agent has granted
//! through window updates.

use crate::transfer::{self, TransferStage};
use crate::workspace::{WorkspaceInfo, WorkspaceSource};
use crate::TunnelError;
use async_trait::async_trait;
use bytes::Bytes;
use devpod_proto::message::{decode, encode};
use devpod_proto::{
    ErrorCode, ErrorDetails, FlowControlConfig, Frame, FrameCodec, FrameWriter, LogLevel, ProtocolError,
    Request, Response, SendWindow,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Operations the agent can call on the operator.
///
/// Handlers return [`anyhow::Result`]; an [`ErrorDetails`] anywhere in the
/// chain keeps its code on the wire, anything else is reported as
/// [`ErrorCode::Internal`].
#[async_trait]
pub trait TunnelService: Send + Sync + 'static {
    /// Log line pushed by the agent
    async fn log(&self, level: LogLevel, message: String) -> anyhow::Result<()> {
        emit_agent_log(level, &message);
        Ok(())
    }

    /// Serialized workspace payload
    async fn workspace(&self) -> anyhow::Result<WorkspaceInfo> {
        Err(unsupported("workspace"))
    }

    /// Final result of the agent's operation
    async fn send_result(&self, _result: String) -> anyhow::Result<()> {
        Err(unsupported("send-result"))
    }

    /// Stream the local workspace folder
    async fn stream_workspace(&self, _sink: &mut ChunkSink<'_>) -> anyhow::Result<()> {
        Err(unsupported("stream-workspace"))
    }

    /// Clone the workspace repository locally and stream it
    async fn stream_git_clone(&self, _sink: &mut ChunkSink<'_>) -> anyhow::Result<()> {
        Err(unsupported("stream-git-clone"))
    }

    /// Stream a named local mount
    async fn stream_mount(&self, _mount: String, _sink: &mut ChunkSink<'_>) -> anyhow::Result<()> {
        Err(unsupported("stream-mount"))
    }
}

fn unsupported(operation: &str) -> anyhow::Error {
    ErrorDetails::new(
        ErrorCode::Unsupported,
        format!("{} is not offered by this server", operation),
    )
    .into()
}

/// Forward an agent log line to the local tracing output
pub fn emit_agent_log(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!(target: "devpod::agent", "{}", message),
        LogLevel::Info | LogLevel::Done => info!(target: "devpod::agent", "{}", message),
        LogLevel::Warning => warn!(target: "devpod::agent", "{}", message),
        LogLevel::Error => error!(target: "devpod::agent", "{}", message),
    }
}

fn error_details(error: &anyhow::Error) -> ErrorDetails {
    match error.downcast_ref::<ErrorDetails>() {
        Some(details) => details.clone(),
        None => ErrorDetails::new(ErrorCode::Internal, format!("{:#}", error)),
    }
}

/// Send windows of the chunk streams in flight on one connection
#[derive(Clone, Default)]
struct CallWindows(Arc<Mutex<HashMap<u32, SendWindow>>>);

impl CallWindows {
    fn open(&self, stream_id: u32, size: u32) -> SendWindow {
        let window = SendWindow::new(size);
        self.lock().insert(stream_id, window.clone());
        window
    }

    fn grant(&self, stream_id: u32, credit: u32) {
        match self.lock().get(&stream_id) {
            Some(window) => window.grant(credit),
            None => trace!(stream_id, "credit for a finished stream"),
        }
    }

    fn close(&self, stream_id: u32) {
        if let Some(window) = self.lock().remove(&stream_id) {
            window.close();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, SendWindow>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Replies for one call. Sequence numbers are local to the call's stream.
pub(crate) struct ResponseWriter {
    stream_id: u32,
    sequence: u32,
    writer: FrameWriter,
    window: Option<SendWindow>,
    max_chunk: usize,
}

impl ResponseWriter {
    fn new(stream_id: u32, writer: FrameWriter, max_chunk: usize) -> Self {
        Self {
            stream_id,
            sequence: 0,
            writer,
            window: None,
            max_chunk,
        }
    }

    fn next_sequence(&mut self) -> u32 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }

    async fn send(&mut self, response: &Response) -> Result<(), ProtocolError> {
        let payload = encode(response)?;
        if let Some(window) = &self.window {
            let size = u32::try_from(payload.len()).map_err(|_| ProtocolError::FlowControlViolation(self.stream_id))?;
            window.reserve(size, self.stream_id).await?;
        }
        let frame = Frame::data(self.stream_id, self.next_sequence(), payload);
        self.writer.send(&frame).await
    }

    /// Terminal frame carrying a unary reply
    async fn reply(mut self, response: &Response) -> Result<(), ProtocolError> {
        let frame = Frame::reply(self.stream_id, self.next_sequence(), encode(response)?);
        self.writer.send(&frame).await
    }

    /// Empty terminal frame closing a chunk stream
    async fn finish(mut self) -> Result<(), ProtocolError> {
        let frame = Frame::end_stream(self.stream_id, self.next_sequence());
        self.writer.send(&frame).await
    }

    async fn fail(mut self, details: &ErrorDetails) -> Result<(), ProtocolError> {
        let frame = Frame::error(self.stream_id, self.next_sequence(), encode(details)?);
        self.writer.send(&frame).await
    }
}

/// Outgoing side of a streaming call
pub struct ChunkSink<'a> {
    response: &'a mut ResponseWriter,
    bytes_sent: u64,
}

impl<'a> ChunkSink<'a> {
    fn new(response: &'a mut ResponseWriter) -> Self {
        Self {
            response,
            bytes_sent: 0,
        }
    }

    /// Send archive bytes, split into as many chunks as the window needs.
    /// Waits while the agent has not granted enough credit.
    pub async fn send(&mut self, mut content: Bytes) -> Result<(), ProtocolError> {
        while !content.is_empty() {
            let piece = content.split_to(content.len().min(self.response.max_chunk));
            let size = piece.len() as u64;
            self.response.send(&Response::Chunk { content: piece }).await?;
            self.bytes_sent += size;
        }
        Ok(())
    }

    /// Total payload bytes sent so far
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

/// Server half of the control channel
pub struct ControlPlaneServer<S> {
    service: Arc<S>,
    ready: watch::Sender<bool>,
    flow_control: FlowControlConfig,
}

impl<S: TunnelService> ControlPlaneServer<S> {
    /// Serve `service`
    pub fn new(service: S) -> Self {
        Self::from_arc(Arc::new(service))
    }

    /// Serve a shared `service`
    pub fn from_arc(service: Arc<S>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            service,
            ready,
            flow_control: FlowControlConfig::default(),
        }
    }

    /// Use non-default stream windows. The agent must use the same settings.
    pub fn with_flow_control(mut self, flow_control: FlowControlConfig) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// The service behind this server
    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    /// Whether the agent has completed the ping round trip
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Observe the handshake from another task
    pub fn handshake(&self) -> Handshake {
        Handshake {
            ready: self.ready.subscribe(),
        }
    }

    /// Serve one connection until the client closes it or `cancel` fires.
    ///
    /// Calls still running when the connection ends are aborted.
    pub async fn serve<R, W>(
        &self,
        mut reader: R,
        writer: W,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer = FrameWriter::new(writer);
        let mut codec = FrameCodec::new();
        let mut calls = JoinSet::new();
        let windows = CallWindows::default();

        debug!("control plane server started");

        let result = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("control plane server cancelled");
                    break Err(TunnelError::Cancelled);
                }

                Some(joined) = calls.join_next(), if !calls.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("call handler panicked: {}", e);
                        }
                    }
                }

                frame = codec.read_frame(&mut reader) => match frame {
                    Ok(Some(frame)) => {
                        if let Err(e) = self.dispatch(frame, &writer, &windows, &mut calls).await {
                            break Err(e.into());
                        }
                    }
                    Ok(None) => {
                        debug!("agent closed the control channel");
                        break Ok(());
                    }
                    Err(e) => break Err(e.into()),
                },
            }
        };

        calls.abort_all();
        if let Err(e) = writer.shutdown().await {
            trace!("control channel shutdown: {}", e);
        }
        result
    }

    async fn dispatch(
        &self,
        frame: Frame,
        writer: &FrameWriter,
        windows: &CallWindows,
        calls: &mut JoinSet<()>,
    ) -> Result<(), ProtocolError> {
        trace!(
            stream_id = frame.stream_id,
            sequence = frame.sequence,
            payload_size = frame.payload.len(),
            "request frame"
        );

        if frame.is_window_update() {
            match frame.window_credit() {
                Ok(credit) => windows.grant(frame.stream_id, credit),
                Err(e) => warn!(stream_id = frame.stream_id, "malformed window update: {}", e),
            }
            return Ok(());
        }

        if !frame.is_request() {
            warn!(stream_id = frame.stream_id, "ignoring unexpected frame from agent");
            return Ok(());
        }

        let mut response = ResponseWriter::new(
            frame.stream_id,
            writer.clone(),
            self.flow_control.max_frame_payload(),
        );
        let request = match decode::<Request>(&frame.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("undecodable request: {}", e);
                let details = ErrorDetails::new(ErrorCode::InvalidRequest, e.to_string());
                return response.fail(&details).await;
            }
        };

        if request == Request::Ping {
            if !self.ready.send_replace(true) {
                debug!("agent completed handshake");
            }
            return response.reply(&Response::Empty).await;
        }

        if !self.is_ready() {
            let details = ErrorDetails::new(
                ErrorCode::NotReady,
                format!("{} called before ping", request.name()),
            );
            return response.fail(&details).await;
        }

        if request.is_streaming() {
            response.window = Some(windows.open(frame.stream_id, self.flow_control.initial_window_size));
        }

        let service = self.service.clone();
        let windows = windows.clone();
        calls.spawn(async move {
            let stream_id = response.stream_id;
            handle_call(service, request, response).await;
            windows.close(stream_id);
        });
        Ok(())
    }
}

async fn handle_call<S: TunnelService>(service: Arc<S>, request: Request, mut response: ResponseWriter) {
    let name = request.name();
    let stream_id = response.stream_id;

    let outcome = match request {
        Request::Ping => Ok(Some(Response::Empty)),
        Request::Log { level, message } => service.log(level, message).await.map(|_| Some(Response::Empty)),
        Request::Workspace => service.workspace().await.map(|info| {
            Some(Response::WorkspaceInfo {
                json: info.as_json().to_string(),
            })
        }),
        Request::SendResult { result } => service.send_result(result).await.map(|_| Some(Response::Empty)),
        Request::StreamWorkspace => {
            let mut sink = ChunkSink::new(&mut response);
            service.stream_workspace(&mut sink).await.map(|_| None)
        }
        Request::StreamGitClone => {
            let mut sink = ChunkSink::new(&mut response);
            service.stream_git_clone(&mut sink).await.map(|_| None)
        }
        Request::StreamMount { mount } => {
            let mut sink = ChunkSink::new(&mut response);
            service.stream_mount(mount, &mut sink).await.map(|_| None)
        }
    };

    let sent = match outcome {
        Ok(Some(reply)) => response.reply(&reply).await,
        Ok(None) => response.finish().await,
        Err(e) => {
            debug!(call = name, stream_id, "call failed: {:#}", e);
            response.fail(&error_details(&e)).await
        }
    };

    if let Err(e) = sent {
        debug!(call = name, stream_id, "reply not delivered: {}", e);
    }
}

/// Waits for the agent's ping
#[derive(Debug, Clone)]
pub struct Handshake {
    ready: watch::Receiver<bool>,
}

impl Handshake {
    /// Whether the ping already arrived
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait up to `timeout` for the ping
    pub async fn wait(mut self, timeout: Duration) -> Result<(), TunnelError> {
        match tokio::time::timeout(timeout, self.ready.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TunnelError::Handshake {
                source: "server stopped before the agent called ping".into(),
            }),
            Err(_) => Err(TunnelError::HandshakeTimeout { timeout }),
        }
    }
}

/// Service backing `devpod up`: hands out the workspace, streams its content
/// and collects the agent's result.
#[derive(Debug, Default)]
pub struct WorkspaceTunnel {
    workspace: Option<WorkspaceInfo>,
    source: WorkspaceSource,
    mounts: HashMap<String, PathBuf>,
    result: Mutex<Option<String>>,
}

impl WorkspaceTunnel {
    /// Create a tunnel with nothing to offer
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload returned by the workspace call
    pub fn with_workspace(mut self, workspace: WorkspaceInfo) -> Self {
        self.workspace = Some(workspace);
        self
    }

    /// Where streamed content comes from
    pub fn with_source(mut self, source: WorkspaceSource) -> Self {
        self.source = source;
        self
    }

    /// Allow streaming `path` under `name`
    pub fn with_mount(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.mounts.insert(name.into(), path.into());
        self
    }

    /// Result delivered by the agent, if any
    pub fn result(&self) -> Option<String> {
        self.lock_result().clone()
    }

    /// Take the delivered result
    pub fn take_result(&self) -> Option<String> {
        self.lock_result().take()
    }

    fn lock_result(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.result.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TunnelService for WorkspaceTunnel {
    async fn workspace(&self) -> anyhow::Result<WorkspaceInfo> {
        self.workspace.clone().ok_or_else(|| {
            ErrorDetails::new(ErrorCode::NotFound, "no workspace information available").into()
        })
    }

    async fn send_result(&self, result: String) -> anyhow::Result<()> {
        if let Err(e) = serde_json::from_str::<serde::de::IgnoredAny>(&result) {
            return Err(ErrorDetails::new(
                ErrorCode::InvalidRequest,
                format!("result is not valid JSON: {}", e),
            )
            .into());
        }

        let mut slot = self.lock_result();
        if slot.is_some() {
            return Err(ErrorDetails::new(ErrorCode::AlreadyExists, "result was already sent").into());
        }
        *slot = Some(result);
        Ok(())
    }

    async fn stream_workspace(&self, sink: &mut ChunkSink<'_>) -> anyhow::Result<()> {
        let folder = self.source.local_folder.as_ref().ok_or_else(|| {
            ErrorDetails::new(ErrorCode::NotFound, "workspace has no local folder")
        })?;

        transfer::send_directory(folder, sink).await?;
        Ok(())
    }

    async fn stream_git_clone(&self, sink: &mut ChunkSink<'_>) -> anyhow::Result<()> {
        let repository = self.source.git_repository.as_ref().ok_or_else(|| {
            ErrorDetails::new(ErrorCode::NotFound, "workspace has no git repository")
        })?;

        let checkout = tempfile::Builder::new()
            .prefix("devpod-clone-")
            .tempdir()
            .map_err(|e| TunnelError::transfer(TransferStage::LocalCloning, e))?;

        clone_repository(repository, self.source.git_branch.as_deref(), checkout.path()).await?;
        transfer::send_directory(checkout.path(), sink).await?;
        Ok(())
    }

    async fn stream_mount(&self, mount: String, sink: &mut ChunkSink<'_>) -> anyhow::Result<()> {
        let path = self.mounts.get(&mount).ok_or_else(|| {
            ErrorDetails::new(ErrorCode::PermissionDenied, "mount is not allowed")
                .with_context("mount", mount.clone())
        })?;

        transfer::send_directory(path, sink).await?;
        Ok(())
    }
}

/// Shallow clone of `repository` into `target`
async fn clone_repository(repository: &str, branch: Option<&str>, target: &std::path::Path) -> Result<(), TunnelError> {
    let mut command = Command::new("git");
    command.args(["clone", "--depth", "1"]);
    if let Some(branch) = branch {
        command.args(["--branch", branch]);
    }
    command.arg(repository).arg(target);

    info!(%repository, "cloning repository locally");
    let output = command
        .output()
        .await
        .map_err(|e| TunnelError::transfer(TransferStage::LocalCloning, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TunnelError::transfer(
            TransferStage::LocalCloning,
            format!("git clone exited with {}: {}", output.status, stderr.trim()),
        ));
    }
    Ok(())
}

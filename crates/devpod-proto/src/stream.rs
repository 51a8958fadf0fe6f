//! Per-call stream multiplexing
//!
//! Every call on the control channel owns one stream id. The caller opens a
//! stream, writes its request frame and then reads the replies from the
//! [`StreamHandle`] while a single reader task feeds every inbound frame to
//! [`StreamMultiplexer::route_frame`].
//!
//! Replies are paced per stream. The receiving side starts every stream with
//! a window of [`FlowControlConfig::initial_window_size`] payload bytes and
//! hands credit back with window updates once the caller has taken frames off
//! the stream; the sending side waits on its [`SendWindow`] when it runs out.

use crate::{Frame, ProtocolError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::trace;

type FrameSender = mpsc::UnboundedSender<Result<Frame, ProtocolError>>;
type FrameReceiver = mpsc::UnboundedReceiver<Result<Frame, ProtocolError>>;

/// Stream multiplexer for the calls in flight on one connection
pub struct StreamMultiplexer {
    /// Next stream ID to assign
    next_stream_id: AtomicU32,
    /// Active streams
    streams: Mutex<HashMap<u32, StreamInfo>>,
    /// Set once the transport is gone
    closed: AtomicBool,
    /// Window settings for new streams
    flow_control: FlowControlConfig,
}

/// Flow control configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlConfig {
    /// Payload bytes a stream may have in flight before credit comes back
    pub initial_window_size: u32,
    /// Consumed bytes the receiver collects before granting them back
    pub update_threshold: u32,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            initial_window_size: 256 * 1024,
            update_threshold: 64 * 1024,
        }
    }
}

impl FlowControlConfig {
    /// Largest payload a sender should put in one frame. The sender always
    /// gets at least this much credit back once the receiver catches up.
    pub fn max_frame_payload(&self) -> usize {
        (self.initial_window_size.saturating_sub(self.update_threshold) / 2).max(1) as usize
    }
}

/// Information about an active stream
#[derive(Debug)]
struct StreamInfo {
    /// Sender for frames to this stream
    frame_sender: FrameSender,
    /// Next expected sequence number
    next_sequence: u32,
    /// Payload bytes the sender may still put on the stream
    recv_window: Arc<AtomicU32>,
}

/// Stream state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Replies may still arrive
    Open,
    /// A terminal frame was seen or the connection failed
    Closed,
}

/// Receiving end of one call
#[derive(Debug)]
pub struct StreamHandle {
    /// Stream ID
    stream_id: u32,
    /// Frame receiver for this stream
    frame_receiver: FrameReceiver,
    /// Stream state
    state: StreamState,
    /// Shared with the multiplexer's view of the stream
    recv_window: Arc<AtomicU32>,
    /// Bytes taken off the stream and not yet granted back
    unacknowledged: u32,
    /// Grant credit once this many bytes are unacknowledged
    update_threshold: u32,
}

/// Sending side of a stream's window
#[derive(Debug, Clone)]
pub struct SendWindow {
    credits: Arc<Semaphore>,
    size: u32,
}

impl SendWindow {
    /// Window starting with `size` bytes of credit
    pub fn new(size: u32) -> Self {
        Self {
            credits: Arc::new(Semaphore::new(size as usize)),
            size,
        }
    }

    /// Full window size
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Credit currently available
    pub fn available(&self) -> usize {
        self.credits.available_permits()
    }

    /// Wait until `bytes` of credit are available and spend them
    pub async fn reserve(&self, bytes: u32, stream_id: u32) -> Result<(), ProtocolError> {
        if bytes > self.size {
            return Err(ProtocolError::FlowControlViolation(stream_id));
        }
        let permits = self
            .credits
            .acquire_many(bytes)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        permits.forget();
        Ok(())
    }

    /// Add credit granted by the receiver, never beyond the full window
    pub fn grant(&self, credit: u32) {
        let room = (self.size as usize).saturating_sub(self.credits.available_permits());
        self.credits.add_permits((credit as usize).min(room));
    }

    /// Fail pending and future reservations
    pub fn close(&self) {
        self.credits.close();
    }
}

impl Default for StreamMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMultiplexer {
    /// Create a new stream multiplexer
    pub fn new() -> Self {
        Self::with_config(FlowControlConfig::default())
    }

    /// Create a new stream multiplexer with custom flow control config
    pub fn with_config(flow_control: FlowControlConfig) -> Self {
        Self {
            next_stream_id: AtomicU32::new(1),
            streams: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            flow_control,
        }
    }

    /// Window settings applied to new streams
    pub fn flow_control(&self) -> FlowControlConfig {
        self.flow_control
    }

    /// Open a stream for a new call. Fails fast once the connection is closed.
    pub async fn open_stream(&self) -> Result<StreamHandle, ProtocolError> {
        let mut streams = self.streams.lock().await;
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        // bounded in bytes by the window, not in frames
        let (frame_sender, frame_receiver) = mpsc::unbounded_channel();
        let recv_window = Arc::new(AtomicU32::new(self.flow_control.initial_window_size));
        streams.insert(
            stream_id,
            StreamInfo {
                frame_sender,
                next_sequence: 0,
                recv_window: recv_window.clone(),
            },
        );

        Ok(StreamHandle {
            stream_id,
            frame_receiver,
            state: StreamState::Open,
            recv_window,
            unacknowledged: 0,
            update_threshold: self.flow_control.update_threshold,
        })
    }

    /// Route an incoming frame to the stream it belongs to.
    ///
    /// The stream is dropped after a terminal frame. Frames for unknown
    /// streams, out-of-order frames and data beyond the stream's window are
    /// rejected.
    pub async fn route_frame(&self, frame: Frame) -> Result<(), ProtocolError> {
        let stream_id = frame.stream_id;
        let mut streams = self.streams.lock().await;

        let info = streams
            .get_mut(&stream_id)
            .ok_or(ProtocolError::InvalidStreamId(stream_id))?;

        if frame.sequence != info.next_sequence {
            let error = ProtocolError::OutOfOrder {
                stream_id,
                expected: info.next_sequence,
                actual: frame.sequence,
            };
            // the call cannot be trusted anymore
            if let Some(info) = streams.remove(&stream_id) {
                let _ = info.frame_sender.send(Err(ProtocolError::InvalidFrame));
            }
            return Err(error);
        }
        info.next_sequence = info.next_sequence.wrapping_add(1);

        if frame.is_flow_controlled() {
            let size = u32::try_from(frame.payload.len()).unwrap_or(u32::MAX);
            let within = info
                .recv_window
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |window| window.checked_sub(size))
                .is_ok();
            if !within {
                if let Some(info) = streams.remove(&stream_id) {
                    let _ = info.frame_sender.send(Err(ProtocolError::FlowControlViolation(stream_id)));
                }
                return Err(ProtocolError::FlowControlViolation(stream_id));
            }
        }

        let terminal = frame.is_terminal();
        let delivered = info.frame_sender.send(Ok(frame)).is_ok();

        if terminal || !delivered {
            trace!(stream_id, delivered, "stream finished");
            streams.remove(&stream_id);
        }
        Ok(())
    }

    /// Forget a stream whose caller gave up
    pub async fn close_stream(&self, stream_id: u32) {
        self.streams.lock().await.remove(&stream_id);
    }

    /// Abort every in-flight call with [`ProtocolError::ConnectionClosed`]
    /// and refuse new ones.
    pub async fn close_all(&self) {
        let mut streams = self.streams.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        for (stream_id, info) in streams.drain() {
            trace!(stream_id, "aborting stream");
            let _ = info.frame_sender.send(Err(ProtocolError::ConnectionClosed));
        }
    }

    /// Whether the connection has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of calls in flight
    pub async fn stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }
}

impl StreamHandle {
    /// Stream ID of this call
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Current state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Credit to grant back to the sender, once enough has been consumed.
    ///
    /// The returned amount is already available to the multiplexer; the
    /// caller owes the sender a [`Frame::window_update`] for it.
    pub fn take_credit(&mut self) -> Option<u32> {
        if self.unacknowledged == 0 || self.unacknowledged < self.update_threshold {
            return None;
        }
        let credit = std::mem::take(&mut self.unacknowledged);
        self.recv_window.fetch_add(credit, Ordering::SeqCst);
        Some(credit)
    }

    /// Wait for the next reply frame
    pub async fn next_frame(&mut self) -> Result<Frame, ProtocolError> {
        std::future::poll_fn(|cx| self.poll_frame(cx)).await
    }

    /// Poll for the next reply frame
    pub fn poll_frame(&mut self, cx: &mut Context<'_>) -> Poll<Result<Frame, ProtocolError>> {
        if self.state == StreamState::Closed {
            return Poll::Ready(Err(ProtocolError::ConnectionClosed));
        }

        match self.frame_receiver.poll_recv(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if frame.is_terminal() {
                    self.state = StreamState::Closed;
                } else if frame.is_flow_controlled() {
                    let size = u32::try_from(frame.payload.len()).unwrap_or(u32::MAX);
                    self.unacknowledged = self.unacknowledged.saturating_add(size);
                }
                Poll::Ready(Ok(frame))
            }
            Poll::Ready(Some(Err(error))) => {
                self.state = StreamState::Closed;
                Poll::Ready(Err(error))
            }
            Poll::Ready(None) => {
                self.state = StreamState::Closed;
                Poll::Ready(Err(ProtocolError::ConnectionClosed))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_stream_ids_are_unique() {
        let mux = StreamMultiplexer::new();
        let a = mux.open_stream().await.unwrap();
        let b = mux.open_stream().await.unwrap();

        assert_ne!(a.stream_id(), b.stream_id());
        assert_eq!(mux.stream_count().await, 2);
    }

    #[tokio::test]
    async fn test_frames_route_to_their_stream() {
        let mux = StreamMultiplexer::new();
        let mut a = mux.open_stream().await.unwrap();
        let mut b = mux.open_stream().await.unwrap();

        mux.route_frame(Frame::data(b.stream_id(), 0, Bytes::from("to b"))).await.unwrap();
        mux.route_frame(Frame::data(a.stream_id(), 0, Bytes::from("to a"))).await.unwrap();

        assert_eq!(a.next_frame().await.unwrap().payload, Bytes::from("to a"));
        assert_eq!(b.next_frame().await.unwrap().payload, Bytes::from("to b"));
    }

    #[tokio::test]
    async fn test_terminal_frame_removes_stream() {
        let mux = StreamMultiplexer::new();
        let mut handle = mux.open_stream().await.unwrap();
        let id = handle.stream_id();

        mux.route_frame(Frame::data(id, 0, Bytes::from("chunk"))).await.unwrap();
        mux.route_frame(Frame::end_stream(id, 1)).await.unwrap();
        assert_eq!(mux.stream_count().await, 0);

        assert!(!handle.next_frame().await.unwrap().is_terminal());
        assert!(handle.next_frame().await.unwrap().is_end_stream());
        assert_eq!(handle.state(), StreamState::Closed);

        let late = mux.route_frame(Frame::data(id, 2, Bytes::new())).await;
        assert!(matches!(late, Err(ProtocolError::InvalidStreamId(_))));
    }

    #[tokio::test]
    async fn test_out_of_order_frame_fails_the_call() {
        let mux = StreamMultiplexer::new();
        let mut handle = mux.open_stream().await.unwrap();
        let id = handle.stream_id();

        let result = mux.route_frame(Frame::data(id, 3, Bytes::new())).await;
        assert!(matches!(result, Err(ProtocolError::OutOfOrder { expected: 0, actual: 3, .. })));
        assert!(matches!(handle.next_frame().await, Err(ProtocolError::InvalidFrame)));
    }

    #[tokio::test]
    async fn test_close_all_aborts_every_call() {
        let mux = StreamMultiplexer::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(mux.open_stream().await.unwrap());
        }

        mux.close_all().await;

        for handle in handles.iter_mut() {
            assert!(matches!(handle.next_frame().await, Err(ProtocolError::ConnectionClosed)));
        }
        assert!(mux.is_closed());
        assert!(matches!(mux.open_stream().await, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_data_beyond_window_fails_the_call() {
        let mux = StreamMultiplexer::with_config(FlowControlConfig {
            initial_window_size: 8,
            update_threshold: 4,
        });
        let mut handle = mux.open_stream().await.unwrap();
        let id = handle.stream_id();

        mux.route_frame(Frame::data(id, 0, Bytes::from_static(b"12345"))).await.unwrap();
        let result = mux.route_frame(Frame::data(id, 1, Bytes::from_static(b"6789"))).await;
        assert!(matches!(result, Err(ProtocolError::FlowControlViolation(_))));

        assert!(handle.next_frame().await.is_ok());
        assert!(matches!(
            handle.next_frame().await,
            Err(ProtocolError::FlowControlViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_consumed_frames_reopen_the_window() {
        let mux = StreamMultiplexer::with_config(FlowControlConfig {
            initial_window_size: 8,
            update_threshold: 4,
        });
        let mut handle = mux.open_stream().await.unwrap();
        let id = handle.stream_id();

        mux.route_frame(Frame::data(id, 0, Bytes::from_static(b"abc"))).await.unwrap();
        handle.next_frame().await.unwrap();
        // below the threshold nothing is granted yet
        assert_eq!(handle.take_credit(), None);

        mux.route_frame(Frame::data(id, 1, Bytes::from_static(b"defgh"))).await.unwrap();
        handle.next_frame().await.unwrap();
        assert_eq!(handle.take_credit(), Some(8));
        assert_eq!(handle.take_credit(), None);

        // the whole window is usable again
        mux.route_frame(Frame::data(id, 2, Bytes::from_static(b"12345678"))).await.unwrap();
        mux.route_frame(Frame::end_stream(id, 3)).await.unwrap();
        assert_eq!(handle.next_frame().await.unwrap().payload, Bytes::from_static(b"12345678"));
    }

    #[tokio::test]
    async fn test_send_window_waits_for_credit() {
        let window = SendWindow::new(10);
        window.reserve(6, 1).await.unwrap();
        assert_eq!(window.available(), 4);

        let blocked = tokio::time::timeout(std::time::Duration::from_millis(50), window.reserve(6, 1)).await;
        assert!(blocked.is_err());

        let waiting = tokio::spawn({
            let window = window.clone();
            async move { window.reserve(6, 1).await }
        });
        window.grant(6);
        waiting.await.unwrap().unwrap();

        // grants never exceed the full window
        window.grant(100);
        assert_eq!(window.available(), 10);

        assert!(matches!(window.reserve(11, 1).await, Err(ProtocolError::FlowControlViolation(1))));
        window.close();
        assert!(matches!(window.reserve(1, 1).await, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_dropped_handle_is_forgotten() {
        let mux = StreamMultiplexer::new();
        let handle = mux.open_stream().await.unwrap();
        let id = handle.stream_id();
        drop(handle);

        mux.route_frame(Frame::data(id, 0, Bytes::from("nobody listens"))).await.unwrap();
        assert_eq!(mux.stream_count().await, 0);
    }
}

//! Frame structure and serialization
//!
//! A call's replies are data frames followed by exactly one terminal frame,
//! `END_STREAM` on success or `ERROR` with encoded `ErrorDetails`. The caller
//! paces data frames with `FLOW_CONTROL` frames that grant byte credit on the
//! same stream; those carry no sequence number of their own.

use crate::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Frame flags for protocol control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    /// No special flags
    pub const NONE: Self = Self(0);
    /// Last frame of a call
    pub const END_STREAM: Self = Self(1);
    /// Call failed, payload carries `ErrorDetails`
    pub const ERROR: Self = Self(2);
    /// Window update, payload carries the granted credit
    pub const FLOW_CONTROL: Self = Self(4);

    /// Check if a flag is set
    pub fn has_flag(self, flag: FrameFlags) -> bool {
        (self.0 & flag.0) != 0
    }
}

/// Protocol frame. Every RPC call owns one stream id; the request is frame 0
/// and the replies follow with increasing sequence numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Stream (call) identifier
    pub stream_id: u32,
    /// Sequence number within the stream
    pub sequence: u32,
    /// Frame flags
    pub flags: FrameFlags,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(stream_id: u32, sequence: u32, flags: FrameFlags, payload: Bytes) -> Self {
        Self {
            stream_id,
            sequence,
            flags,
            payload,
        }
    }

    /// First frame of a call, carrying the encoded request
    pub fn request(stream_id: u32, payload: Bytes) -> Self {
        Self::data(stream_id, 0, payload)
    }

    /// Terminal frame carrying a whole unary reply
    pub fn reply(stream_id: u32, sequence: u32, payload: Bytes) -> Self {
        Self::new(stream_id, sequence, FrameFlags::END_STREAM, payload)
    }

    /// Create a data frame
    pub fn data(stream_id: u32, sequence: u32, payload: Bytes) -> Self {
        Self::new(stream_id, sequence, FrameFlags::NONE, payload)
    }

    /// Create an end-of-stream frame
    pub fn end_stream(stream_id: u32, sequence: u32) -> Self {
        Self::new(stream_id, sequence, FrameFlags::END_STREAM, Bytes::new())
    }

    /// Create an error frame
    pub fn error(stream_id: u32, sequence: u32, payload: Bytes) -> Self {
        Self::new(stream_id, sequence, FrameFlags::ERROR, payload)
    }

    /// Grant `credit` more payload bytes on a stream
    pub fn window_update(stream_id: u32, credit: u32) -> Self {
        let payload = Bytes::copy_from_slice(&credit.to_be_bytes());
        Self::new(stream_id, 0, FrameFlags::FLOW_CONTROL, payload)
    }

    /// Serialize frame to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize frame from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Check if this is an end-of-stream frame
    pub fn is_end_stream(&self) -> bool {
        self.flags.has_flag(FrameFlags::END_STREAM)
    }

    /// Check if this is an error frame
    pub fn is_error(&self) -> bool {
        self.flags.has_flag(FrameFlags::ERROR)
    }

    /// Whether this frame opens a call
    pub fn is_request(&self) -> bool {
        self.sequence == 0 && self.flags == FrameFlags::NONE
    }

    /// Whether no more frames follow on this stream
    pub fn is_terminal(&self) -> bool {
        self.is_end_stream() || self.is_error()
    }

    /// Check if this frame grants credit
    pub fn is_window_update(&self) -> bool {
        self.flags.has_flag(FrameFlags::FLOW_CONTROL)
    }

    /// Credit granted by a window update
    pub fn window_credit(&self) -> Result<u32, ProtocolError> {
        let bytes: [u8; 4] = self.payload[..].try_into().map_err(|_| ProtocolError::InvalidFrame)?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Whether this frame is paced by the receiver's window
    pub fn is_flow_controlled(&self) -> bool {
        !self.is_terminal() && !self.is_window_update()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_frame_flags() {
        assert!(!FrameFlags::NONE.has_flag(FrameFlags::END_STREAM));

        let flags = FrameFlags(FrameFlags::END_STREAM.0 | FrameFlags::ERROR.0);
        assert!(flags.has_flag(FrameFlags::END_STREAM));
        assert!(flags.has_flag(FrameFlags::ERROR));
        assert!(!flags.has_flag(FrameFlags::FLOW_CONTROL));
    }

    #[test]
    fn test_call_frames() {
        // a unary call: request on 0, one terminal reply with a payload
        let request = Frame::request(5, Bytes::from("ping"));
        assert!(request.is_request());
        assert!(!request.is_terminal());

        let reply = Frame::reply(5, 0, Bytes::from("pong"));
        assert!(reply.is_end_stream());
        assert!(!reply.is_request());
        assert_eq!(reply.payload, "pong");

        // a streamed call: numbered data replies, then an empty terminal frame
        let chunks: Vec<Frame> = (0..3).map(|seq| Frame::data(6, seq, Bytes::from("chunk"))).collect();
        assert!(chunks.iter().all(|c| !c.is_terminal() && c.is_flow_controlled()));
        assert!(!chunks[1].is_request());
        let end = Frame::end_stream(6, 3);
        assert!(end.is_terminal() && end.payload.is_empty());

        // neither a terminal frame nor credit opens a call
        assert!(!Frame::end_stream(7, 0).is_request());
        assert!(!Frame::window_update(7, 1).is_request());
    }

    #[test]
    fn test_terminal_frames() {
        assert!(!Frame::data(1, 0, Bytes::from("chunk")).is_terminal());
        assert!(Frame::end_stream(1, 3).is_terminal());

        let error = Frame::error(1, 1, Bytes::from("boom"));
        assert!(error.is_error());
        assert!(!error.is_end_stream());
        assert!(error.is_terminal());
    }

    #[test]
    fn test_window_update_frames() {
        let update = Frame::window_update(9, 65_536);
        assert!(update.is_window_update());
        assert!(!update.is_terminal());
        assert!(!update.is_flow_controlled());
        assert_eq!(update.sequence, 0);

        let decoded = Frame::from_msgpack(&update.to_msgpack().unwrap()).unwrap();
        assert_eq!(decoded.window_credit().unwrap(), 65_536);

        // replies: data is paced, the terminal frame is not
        assert!(Frame::data(9, 0, Bytes::from("chunk")).is_flow_controlled());
        assert!(!Frame::end_stream(9, 1).is_flow_controlled());
        assert!(!Frame::error(9, 1, Bytes::new()).is_flow_controlled());

        let truncated = Frame::new(9, 0, FrameFlags::FLOW_CONTROL, Bytes::from_static(&[0, 1]));
        assert!(matches!(truncated.window_credit(), Err(ProtocolError::InvalidFrame)));
    }

    #[test]
    fn test_empty_payload_serialization() {
        let frame = Frame::end_stream(7, 2);
        let serialized = frame.to_msgpack().unwrap();
        let deserialized = Frame::from_msgpack(&serialized).unwrap();

        assert_eq!(deserialized.stream_id, 7);
        assert_eq!(deserialized.sequence, 2);
        assert!(deserialized.payload.is_empty());
        assert!(deserialized.is_end_stream());
    }

    proptest! {
        #[test]
        fn test_frame_roundtrip_properties(
            stream_id in any::<u32>(),
            sequence in any::<u32>(),
            flags in 0u8..8,
            payload in prop::collection::vec(any::<u8>(), 0..1024)
        ) {
            let frame = Frame::new(stream_id, sequence, FrameFlags(flags), Bytes::from(payload));

            let serialized = frame.to_msgpack().unwrap();
            let deserialized = Frame::from_msgpack(&serialized).unwrap();

            prop_assert_eq!(frame.stream_id, deserialized.stream_id);
            prop_assert_eq!(frame.sequence, deserialized.sequence);
            prop_assert_eq!(frame.flags, deserialized.flags);
            prop_assert_eq!(frame.payload, deserialized.payload);
        }
    }
}

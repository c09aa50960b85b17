//! Structured HTTP/2 frame values.
//!
//! These are the values an external frame parser hands to the connection
//! state machine (and that the caller builds when it is about to emit a
//! frame). Wire serialization, parsing, and HPACK coding live outside this
//! crate; header blocks arrive here already decoded.

use bytes::Bytes;

use crate::error::ErrorCode;

/// HTTP/2 connection preface sent by the client (RFC 7540 Section 3.5).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial flow control window size (RFC 7540 Section 6.9.2).
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Largest legal flow control window, `2^31 - 1`.
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// Default maximum frame size (RFC 7540 Section 6.5.2).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Largest value SETTINGS_MAX_FRAME_SIZE may take, `2^24 - 1`.
pub const MAX_FRAME_SIZE_UPPER_BOUND: u32 = (1 << 24) - 1;

/// HTTP/2 frame types (RFC 7540 Section 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    /// Try to convert a wire byte to a frame type.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::GoAway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }
}

/// Frame flags.
pub mod flags {
    /// DATA/HEADERS frame: last frame in this direction.
    pub const END_STREAM: u8 = 0x1;
    /// DATA/HEADERS frame: padding is present.
    pub const PADDED: u8 = 0x8;
    /// HEADERS/PUSH_PROMISE/CONTINUATION frame: header block is complete.
    pub const END_HEADERS: u8 = 0x4;
    /// HEADERS frame: priority information is present.
    pub const PRIORITY: u8 = 0x20;
    /// SETTINGS/PING frame: this is an acknowledgment.
    pub const ACK: u8 = 0x1;
}

/// Stream identifier (31 bits, high bit reserved).
///
/// Stream 0 is the root stream and addresses the connection itself. Odd
/// identifiers belong to client-initiated streams, even non-zero ones to
/// server-initiated streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId(u32);

impl StreamId {
    /// The root stream (stream 0, connection scope).
    pub const ROOT: StreamId = StreamId(0);

    /// Create a new stream ID, masking the reserved bit.
    #[inline]
    pub fn new(id: u32) -> Self {
        StreamId(id & 0x7fff_ffff)
    }

    /// Get the raw stream ID value.
    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    /// Whether this is the root (connection-scope) stream.
    #[inline]
    pub fn is_root(self) -> bool {
        self.0 == 0
    }

    /// Whether this stream was initiated by a client (odd IDs).
    #[inline]
    pub fn is_client_initiated(self) -> bool {
        self.0 % 2 == 1
    }

    /// Whether this stream was initiated by a server (even non-zero IDs).
    #[inline]
    pub fn is_server_initiated(self) -> bool {
        self.0 != 0 && self.0.is_multiple_of(2)
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        StreamId::new(id)
    }
}

/// A single decoded header field.
///
/// The HPACK decoder is an external collaborator; the state machine only
/// inspects `:status`, `:method`, and `content-length`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
}

impl HeaderField {
    /// Create a header field from anything byte-like.
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A structured HTTP/2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Priority(PriorityFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    PushPromise(PushPromiseFrame),
    Ping(PingFrame),
    GoAway(GoAwayFrame),
    WindowUpdate(WindowUpdateFrame),
    Continuation(ContinuationFrame),
    /// Unknown frame type (must be ignored, RFC 7540 Section 4.1).
    Unknown(UnknownFrame),
}

impl Frame {
    /// The stream this frame is scoped to (root for connection-scope frames).
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Data(f) => f.stream_id,
            Frame::Headers(f) => f.stream_id,
            Frame::Priority(f) => f.stream_id,
            Frame::RstStream(f) => f.stream_id,
            Frame::Settings(_) => StreamId::ROOT,
            Frame::PushPromise(f) => f.stream_id,
            Frame::Ping(_) => StreamId::ROOT,
            Frame::GoAway(_) => StreamId::ROOT,
            Frame::WindowUpdate(f) => f.stream_id,
            Frame::Continuation(f) => f.stream_id,
            Frame::Unknown(f) => f.stream_id,
        }
    }
}

/// DATA frame (type=0x0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: StreamId,
    pub end_stream: bool,
    /// Padding length when the PADDED flag was set.
    pub pad_length: Option<u8>,
    pub data: Bytes,
}

impl DataFrame {
    /// Bytes this frame consumes from flow control windows: payload plus
    /// padding plus the padding-length octet when padded (RFC 7540
    /// Section 6.9.1).
    pub fn flow_controlled_length(&self) -> u32 {
        let padding = match self.pad_length {
            Some(pad) => u32::from(pad) + 1,
            None => 0,
        };
        self.data.len() as u32 + padding
    }
}

/// HEADERS frame (type=0x1), carrying an already-decoded header list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    pub stream_id: StreamId,
    pub end_stream: bool,
    pub end_headers: bool,
    pub priority: Option<Priority>,
    pub headers: Vec<HeaderField>,
}

/// Stream priority information (accepted, never used for scheduling).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: StreamId,
    /// Weight (1-256, stored as 0-255).
    pub weight: u8,
}

/// PRIORITY frame (type=0x2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityFrame {
    pub stream_id: StreamId,
    pub priority: Priority,
}

/// RST_STREAM frame (type=0x3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: StreamId,
    pub error_code: ErrorCode,
}

/// SETTINGS frame (type=0x4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFrame {
    pub ack: bool,
    pub settings: Vec<Setting>,
}

impl SettingsFrame {
    /// An empty acknowledgment frame.
    pub fn ack() -> Self {
        Self {
            ack: true,
            settings: Vec::new(),
        }
    }
}

/// Individual setting in a SETTINGS frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub id: SettingId,
    pub value: u32,
}

/// Known setting identifiers (RFC 7540 Section 6.5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingId {
    HeaderTableSize,
    EnablePush,
    MaxConcurrentStreams,
    InitialWindowSize,
    MaxFrameSize,
    MaxHeaderListSize,
    /// Unknown setting identifier (must be ignored).
    Unknown(u16),
}

impl SettingId {
    pub fn from_u16(id: u16) -> Self {
        match id {
            0x1 => SettingId::HeaderTableSize,
            0x2 => SettingId::EnablePush,
            0x3 => SettingId::MaxConcurrentStreams,
            0x4 => SettingId::InitialWindowSize,
            0x5 => SettingId::MaxFrameSize,
            0x6 => SettingId::MaxHeaderListSize,
            _ => SettingId::Unknown(id),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            SettingId::HeaderTableSize => 0x1,
            SettingId::EnablePush => 0x2,
            SettingId::MaxConcurrentStreams => 0x3,
            SettingId::InitialWindowSize => 0x4,
            SettingId::MaxFrameSize => 0x5,
            SettingId::MaxHeaderListSize => 0x6,
            SettingId::Unknown(id) => id,
        }
    }
}

/// PUSH_PROMISE frame (type=0x5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPromiseFrame {
    /// The stream the promise rides on.
    pub stream_id: StreamId,
    pub end_headers: bool,
    /// The stream being reserved.
    pub promised_stream_id: StreamId,
    pub headers: Vec<HeaderField>,
}

/// PING frame (type=0x6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

/// GOAWAY frame (type=0x7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAwayFrame {
    /// Highest stream ID the sender will process.
    pub last_stream_id: StreamId,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

/// WINDOW_UPDATE frame (type=0x8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub stream_id: StreamId,
    pub increment: u32,
}

/// CONTINUATION frame (type=0x9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationFrame {
    pub stream_id: StreamId,
    pub end_headers: bool,
    pub headers: Vec<HeaderField>,
}

/// Unknown frame type, carried through for completeness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFrame {
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

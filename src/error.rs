//! HTTP/2 error codes and the stream/connection error split.

use std::fmt;

use crate::frame::StreamId;

/// HTTP/2 error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown.
    NoError = 0x0,
    /// Protocol error detected.
    ProtocolError = 0x1,
    /// Implementation fault.
    InternalError = 0x2,
    /// Flow control limits exceeded.
    FlowControlError = 0x3,
    /// Settings not acknowledged in time.
    SettingsTimeout = 0x4,
    /// Frame received for closed stream.
    StreamClosed = 0x5,
    /// Frame size incorrect.
    FrameSizeError = 0x6,
    /// Stream not processed.
    RefusedStream = 0x7,
    /// Stream cancelled.
    Cancel = 0x8,
    /// Compression state not updated.
    CompressionError = 0x9,
    /// TCP connection error.
    ConnectError = 0xa,
    /// Processing capacity exceeded.
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS requirements not met.
    InadequateSecurity = 0xc,
    /// HTTP/1.1 required.
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            // Unknown error codes are treated as INTERNAL_ERROR
            _ => ErrorCode::InternalError,
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::NoError => write!(f, "NO_ERROR"),
            ErrorCode::ProtocolError => write!(f, "PROTOCOL_ERROR"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
            ErrorCode::FlowControlError => write!(f, "FLOW_CONTROL_ERROR"),
            ErrorCode::SettingsTimeout => write!(f, "SETTINGS_TIMEOUT"),
            ErrorCode::StreamClosed => write!(f, "STREAM_CLOSED"),
            ErrorCode::FrameSizeError => write!(f, "FRAME_SIZE_ERROR"),
            ErrorCode::RefusedStream => write!(f, "REFUSED_STREAM"),
            ErrorCode::Cancel => write!(f, "CANCEL"),
            ErrorCode::CompressionError => write!(f, "COMPRESSION_ERROR"),
            ErrorCode::ConnectError => write!(f, "CONNECT_ERROR"),
            ErrorCode::EnhanceYourCalm => write!(f, "ENHANCE_YOUR_CALM"),
            ErrorCode::InadequateSecurity => write!(f, "INADEQUATE_SECURITY"),
            ErrorCode::Http11Required => write!(f, "HTTP_1_1_REQUIRED"),
        }
    }
}

/// A protocol violation, scoped to a single stream or to the connection.
///
/// A stream error terminates one stream: the caller should emit RST_STREAM
/// with the carried code. A connection error terminates the whole
/// connection: the caller should emit GOAWAY and close. The state machine
/// returns these without mutating any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http2Error {
    /// One stream must be reset.
    Stream {
        /// The offending stream.
        stream_id: StreamId,
        /// Code to carry in the RST_STREAM.
        code: ErrorCode,
    },
    /// The whole connection must be torn down.
    Connection {
        /// Code to carry in the GOAWAY.
        code: ErrorCode,
    },
}

impl Http2Error {
    /// Stream-scoped error.
    pub fn stream(stream_id: StreamId, code: ErrorCode) -> Self {
        Http2Error::Stream { stream_id, code }
    }

    /// Connection-scoped error.
    pub fn connection(code: ErrorCode) -> Self {
        Http2Error::Connection { code }
    }

    /// The HTTP/2 error code to put on the wire.
    pub fn code(&self) -> ErrorCode {
        match self {
            Http2Error::Stream { code, .. } => *code,
            Http2Error::Connection { code } => *code,
        }
    }

    /// Whether this error takes down the whole connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Http2Error::Connection { .. })
    }
}

impl fmt::Display for Http2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Http2Error::Stream { stream_id, code } => {
                write!(f, "stream {} error: {}", stream_id.value(), code)
            }
            Http2Error::Connection { code } => {
                write!(f, "connection error: {}", code)
            }
        }
    }
}

impl std::error::Error for Http2Error {}

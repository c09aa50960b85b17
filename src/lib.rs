//! http2-core - HTTP/2 connection state machine.
//!
//! This crate is the protocol brain of an HTTP/2 endpoint, with no I/O of
//! its own. An external frame parser hands it structured frames (and the
//! caller offers the frames it is about to emit); the machine validates
//! each one against RFC 7540, drives the stream and connection lifecycles,
//! keeps the flow control windows, and answers with a
//! [`ConnectionStateChange`] the layers above react to.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `frame`: structured frame values and wire constants
//! - `error`: HTTP/2 error codes and the stream/connection error split
//! - `connection`: the connection state machine, per-stream machines, the
//!   stream map, and flow control windows
//!
//! Frame serialization, HPACK, TLS, and the event loop are collaborators
//! that live outside this crate.

pub mod connection;
pub mod error;
pub mod frame;

// Re-export commonly used types
pub use connection::{
    ConnectionSettings, ConnectionState, ConnectionStateChange, ConnectionStateMachine,
    FlowControlWindow, GoAwayState, Preface, Role, Stream, StreamMap, StreamState,
    StreamWindowChange, WindowError, Windows,
};
pub use error::{ErrorCode, Http2Error};
pub use frame::{
    CONNECTION_PREFACE, ContinuationFrame, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE,
    DataFrame, Frame, FrameType, GoAwayFrame, HeaderField, HeadersFrame, PingFrame, Priority,
    PriorityFrame, PushPromiseFrame, RstStreamFrame, Setting, SettingId, SettingsFrame, StreamId,
    UnknownFrame, WindowUpdateFrame,
};

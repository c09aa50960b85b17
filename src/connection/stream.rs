//! Per-stream state tracking (RFC 7540 Section 5.1).

use crate::connection::flow_control::{FlowControlWindow, MIN_WINDOW_SIZE, WindowError};
use crate::error::{ErrorCode, Http2Error};
use crate::frame::{HeaderField, StreamId};

/// Stream lifecycle states (RFC 7540 Section 5.1).
///
/// The lifecycle is monotone: no transition moves a stream backward in
/// the diagram, and `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created but no frames exchanged yet.
    Idle,
    /// Promised by a locally-sent PUSH_PROMISE.
    ReservedLocal,
    /// Promised by a remotely-sent PUSH_PROMISE.
    ReservedRemote,
    /// Both directions open.
    Open,
    /// We sent END_STREAM; only the peer may still send.
    HalfClosedLocal,
    /// The peer sent END_STREAM; only we may still send.
    HalfClosedRemote,
    /// Both directions done, or the stream was reset.
    Closed,
}

/// Content-length accounting for one direction of a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BodyLength {
    /// Value declared in the header block, when policing applies.
    expected: Option<u64>,
    /// DATA payload bytes seen so far (padding excluded).
    seen: u64,
}

impl BodyLength {
    fn complete(&self) -> bool {
        match self.expected {
            Some(expected) => expected == self.seen,
            None => true,
        }
    }
}

/// What a header block means for the direction it travels in.
struct HeaderBlockInfo {
    /// Declared `content-length`, when policing applies.
    content_length: Option<u64>,
    /// 1xx response block; another header block will follow.
    informational: bool,
}

impl HeaderBlockInfo {
    /// Inspect a decoded header list. Conflicting or malformed
    /// `content-length` values are a stream-level PROTOCOL_ERROR.
    fn parse(stream_id: StreamId, headers: &[HeaderField]) -> Result<Self, Http2Error> {
        let mut content_length: Option<u64> = None;
        let mut informational = false;
        let mut connect = false;

        for field in headers {
            match &field.name[..] {
                b"content-length" => {
                    let parsed = std::str::from_utf8(&field.value)
                        .ok()
                        .and_then(|v| v.parse::<u64>().ok())
                        .ok_or(Http2Error::stream(stream_id, ErrorCode::ProtocolError))?;
                    if let Some(previous) = content_length
                        && previous != parsed
                    {
                        return Err(Http2Error::stream(stream_id, ErrorCode::ProtocolError));
                    }
                    content_length = Some(parsed);
                }
                b":status" => {
                    informational = field.value.first() == Some(&b'1') && field.value.len() == 3;
                }
                b":method" => {
                    connect = matches!(&field.value[..], b"CONNECT");
                }
                _ => {}
            }
        }

        // CONNECT carries a tunnel, not a sized body.
        if connect {
            content_length = None;
        }

        Ok(Self {
            content_length,
            informational,
        })
    }
}

/// State machine for a single HTTP/2 stream.
///
/// Every transition method validates the event completely before mutating,
/// so an `Err` return leaves the stream exactly as it was.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    state: StreamState,
    locally_initiated: bool,
    /// Credit the peer has left to send to us.
    inbound_window: FlowControlWindow,
    /// Credit we have left to send to the peer.
    outbound_window: FlowControlWindow,
    inbound_body: BodyLength,
    outbound_body: BodyLength,
    /// Final (non-1xx) header block seen; further inbound HEADERS are trailers.
    inbound_headers_done: bool,
    outbound_headers_done: bool,
    reset_reason: Option<ErrorCode>,
}

impl Stream {
    /// Create an idle stream about to be opened by a HEADERS frame.
    pub fn idle(
        id: StreamId,
        locally_initiated: bool,
        inbound_window: i64,
        outbound_window: i64,
    ) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            locally_initiated,
            inbound_window: FlowControlWindow::new(inbound_window),
            outbound_window: FlowControlWindow::new(outbound_window),
            inbound_body: BodyLength::default(),
            outbound_body: BodyLength::default(),
            inbound_headers_done: false,
            outbound_headers_done: false,
            reset_reason: None,
        }
    }

    /// Create a stream promised by a locally-sent PUSH_PROMISE.
    pub fn reserved_local(id: StreamId, inbound_window: i64, outbound_window: i64) -> Self {
        let mut stream = Self::idle(id, true, inbound_window, outbound_window);
        stream.state = StreamState::ReservedLocal;
        stream
    }

    /// Create a stream promised by a remotely-sent PUSH_PROMISE.
    pub fn reserved_remote(id: StreamId, inbound_window: i64, outbound_window: i64) -> Self {
        let mut stream = Self::idle(id, false, inbound_window, outbound_window);
        stream.state = StreamState::ReservedRemote;
        stream
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    pub fn locally_initiated(&self) -> bool {
        self.locally_initiated
    }

    /// Code the stream was reset with, if it closed via RST_STREAM.
    pub fn reset_reason(&self) -> Option<ErrorCode> {
        self.reset_reason
    }

    /// Credit the peer has left to send to us.
    pub fn inbound_window(&self) -> i64 {
        self.inbound_window.value()
    }

    /// Credit we have left to send to the peer.
    pub fn outbound_window(&self) -> i64 {
        self.outbound_window.value()
    }

    fn stream_error(&self, code: ErrorCode) -> Http2Error {
        Http2Error::stream(self.id, code)
    }

    fn close_outbound_side(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    fn close_inbound_side(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    /// We are sending a HEADERS frame on this stream.
    pub fn send_headers(
        &mut self,
        headers: &[HeaderField],
        end_stream: bool,
    ) -> Result<(), Http2Error> {
        match self.state {
            StreamState::Idle => {
                debug_assert!(self.locally_initiated);
                let info = HeaderBlockInfo::parse(self.id, headers)?;
                if end_stream && !matches!(info.content_length, None | Some(0)) {
                    return Err(self.stream_error(ErrorCode::ProtocolError));
                }
                if !info.informational {
                    self.outbound_body.expected = info.content_length;
                    self.outbound_headers_done = true;
                }
                self.state = if end_stream {
                    StreamState::HalfClosedLocal
                } else {
                    StreamState::Open
                };
                Ok(())
            }
            StreamState::ReservedLocal => {
                let info = HeaderBlockInfo::parse(self.id, headers)?;
                if end_stream && !matches!(info.content_length, None | Some(0)) {
                    return Err(self.stream_error(ErrorCode::ProtocolError));
                }
                if !info.informational {
                    self.outbound_body.expected = info.content_length;
                    self.outbound_headers_done = true;
                }
                self.state = if end_stream {
                    StreamState::Closed
                } else {
                    StreamState::HalfClosedRemote
                };
                Ok(())
            }
            StreamState::Open | StreamState::HalfClosedRemote => {
                if self.outbound_headers_done {
                    // Trailers must end the stream and the declared body
                    // must be complete.
                    if !end_stream {
                        return Err(self.stream_error(ErrorCode::ProtocolError));
                    }
                    if !self.outbound_body.complete() {
                        return Err(self.stream_error(ErrorCode::ProtocolError));
                    }
                    self.close_outbound_side();
                    Ok(())
                } else {
                    let info = HeaderBlockInfo::parse(self.id, headers)?;
                    if end_stream && !matches!(info.content_length, None | Some(0)) {
                        return Err(self.stream_error(ErrorCode::ProtocolError));
                    }
                    if !info.informational {
                        self.outbound_body.expected = info.content_length;
                        self.outbound_headers_done = true;
                    }
                    if end_stream {
                        self.close_outbound_side();
                    }
                    Ok(())
                }
            }
            StreamState::HalfClosedLocal | StreamState::Closed => {
                Err(self.stream_error(ErrorCode::StreamClosed))
            }
            StreamState::ReservedRemote => {
                Err(Http2Error::connection(ErrorCode::ProtocolError))
            }
        }
    }

    /// The peer sent a HEADERS frame on this stream.
    pub fn recv_headers(
        &mut self,
        headers: &[HeaderField],
        end_stream: bool,
    ) -> Result<(), Http2Error> {
        match self.state {
            StreamState::Idle => {
                debug_assert!(!self.locally_initiated);
                let info = HeaderBlockInfo::parse(self.id, headers)?;
                if end_stream && !matches!(info.content_length, None | Some(0)) {
                    return Err(self.stream_error(ErrorCode::ProtocolError));
                }
                if !info.informational {
                    self.inbound_body.expected = info.content_length;
                    self.inbound_headers_done = true;
                }
                self.state = if end_stream {
                    StreamState::HalfClosedRemote
                } else {
                    StreamState::Open
                };
                Ok(())
            }
            StreamState::ReservedRemote => {
                let info = HeaderBlockInfo::parse(self.id, headers)?;
                if end_stream && !matches!(info.content_length, None | Some(0)) {
                    return Err(self.stream_error(ErrorCode::ProtocolError));
                }
                if !info.informational {
                    self.inbound_body.expected = info.content_length;
                    self.inbound_headers_done = true;
                }
                self.state = if end_stream {
                    StreamState::Closed
                } else {
                    StreamState::HalfClosedLocal
                };
                Ok(())
            }
            StreamState::Open | StreamState::HalfClosedLocal => {
                if self.inbound_headers_done {
                    if !end_stream {
                        return Err(self.stream_error(ErrorCode::ProtocolError));
                    }
                    if !self.inbound_body.complete() {
                        return Err(self.stream_error(ErrorCode::ProtocolError));
                    }
                    self.close_inbound_side();
                    Ok(())
                } else {
                    let info = HeaderBlockInfo::parse(self.id, headers)?;
                    if end_stream && !matches!(info.content_length, None | Some(0)) {
                        return Err(self.stream_error(ErrorCode::ProtocolError));
                    }
                    if !info.informational {
                        self.inbound_body.expected = info.content_length;
                        self.inbound_headers_done = true;
                    }
                    if end_stream {
                        self.close_inbound_side();
                    }
                    Ok(())
                }
            }
            StreamState::HalfClosedRemote | StreamState::Closed => {
                Err(self.stream_error(ErrorCode::StreamClosed))
            }
            StreamState::ReservedLocal => {
                Err(Http2Error::connection(ErrorCode::ProtocolError))
            }
        }
    }

    /// We are sending a DATA frame. `flow_controlled_length` includes
    /// padding; `payload_length` is the body bytes alone.
    pub fn send_data(
        &mut self,
        flow_controlled_length: u32,
        payload_length: u64,
        end_stream: bool,
    ) -> Result<(), Http2Error> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedRemote => {}
            StreamState::HalfClosedLocal | StreamState::Closed => {
                return Err(self.stream_error(ErrorCode::StreamClosed));
            }
            _ => return Err(Http2Error::connection(ErrorCode::ProtocolError)),
        }

        // Sending into a depleted window is a local bug we catch here.
        if self.outbound_window.value() < i64::from(flow_controlled_length) {
            return Err(self.stream_error(ErrorCode::FlowControlError));
        }

        let seen = self.outbound_body.seen + payload_length;
        if let Some(expected) = self.outbound_body.expected {
            let overshoot = seen > expected;
            let short = end_stream && seen != expected;
            if overshoot || short {
                return Err(self.stream_error(ErrorCode::ProtocolError));
            }
        }

        self.outbound_window
            .decrement_by(flow_controlled_length)
            .map_err(|_| Http2Error::connection(ErrorCode::ProtocolError))?;
        self.outbound_body.seen = seen;
        if end_stream {
            self.close_outbound_side();
        }
        Ok(())
    }

    /// The peer sent a DATA frame.
    pub fn recv_data(
        &mut self,
        flow_controlled_length: u32,
        payload_length: u64,
        end_stream: bool,
    ) -> Result<(), Http2Error> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedLocal => {}
            StreamState::HalfClosedRemote | StreamState::Closed => {
                return Err(self.stream_error(ErrorCode::StreamClosed));
            }
            _ => return Err(Http2Error::connection(ErrorCode::ProtocolError)),
        }

        // The window may legally go negative (settings re-baseline races);
        // only arithmetic underflow is fatal.
        let candidate = self.inbound_window.value() - i64::from(flow_controlled_length);
        if candidate < MIN_WINDOW_SIZE {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }

        let seen = self.inbound_body.seen + payload_length;
        if let Some(expected) = self.inbound_body.expected {
            let overshoot = seen > expected;
            let short = end_stream && seen != expected;
            if overshoot || short {
                return Err(self.stream_error(ErrorCode::ProtocolError));
            }
        }

        self.inbound_window
            .decrement_by(flow_controlled_length)
            .map_err(|_| Http2Error::connection(ErrorCode::ProtocolError))?;
        self.inbound_body.seen = seen;
        if end_stream {
            self.close_inbound_side();
        }
        Ok(())
    }

    /// Close the stream via RST_STREAM, recording the reason.
    pub fn reset(&mut self, code: ErrorCode) -> Result<(), Http2Error> {
        if self.state == StreamState::Idle {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }
        self.state = StreamState::Closed;
        self.reset_reason = Some(code);
        Ok(())
    }

    /// We are granting the peer more credit on this stream.
    pub fn send_window_update(&mut self, increment: u32) -> Result<(), Http2Error> {
        self.inbound_window
            .increment_by(increment)
            .map_err(|e| self.window_error(e))
    }

    /// The peer granted us more credit on this stream.
    pub fn recv_window_update(&mut self, increment: u32) -> Result<(), Http2Error> {
        self.outbound_window
            .increment_by(increment)
            .map_err(|e| self.window_error(e))
    }

    fn window_error(&self, error: WindowError) -> Http2Error {
        match error {
            WindowError::ZeroIncrement => self.stream_error(ErrorCode::ProtocolError),
            WindowError::InvalidSize => self.stream_error(ErrorCode::FlowControlError),
        }
    }

    /// Whether an INITIAL_WINDOW_SIZE delta fits this stream's inbound
    /// window (pre-check for atomic settings application).
    pub fn inbound_delta_fits(&self, delta: i64) -> bool {
        self.inbound_window.delta_fits(delta)
    }

    /// Whether an INITIAL_WINDOW_SIZE delta fits this stream's outbound
    /// window.
    pub fn outbound_delta_fits(&self, delta: i64) -> bool {
        self.outbound_window.delta_fits(delta)
    }

    /// Re-baseline the inbound window after our INITIAL_WINDOW_SIZE
    /// change was acknowledged.
    pub fn apply_inbound_delta(&mut self, delta: i64) -> Result<(), Http2Error> {
        self.inbound_window
            .apply_delta(delta)
            .map_err(|_| Http2Error::connection(ErrorCode::FlowControlError))
    }

    /// Re-baseline the outbound window after the peer changed its
    /// INITIAL_WINDOW_SIZE.
    pub fn apply_outbound_delta(&mut self, delta: i64) -> Result<(), Http2Error> {
        self.outbound_window
            .apply_delta(delta)
            .map_err(|_| Http2Error::connection(ErrorCode::FlowControlError))
    }
}

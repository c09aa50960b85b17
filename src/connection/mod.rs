//! HTTP/2 connection state machine.
//!
//! This module implements the connection-level coordinator, handling:
//! - Settings exchange and apply-on-ACK negotiation
//! - Stream lifecycle management through the per-stream machines
//! - Flow control (connection and stream level)
//! - GOAWAY quiescence and teardown
//!
//! The machine is sans-io: an external parser hands it structured frames
//! (and the caller offers frames it is about to emit), and each frame
//! yields either a [`ConnectionStateChange`] or a typed error. Exactly one
//! frame is processed at a time; nothing here suspends or schedules.

pub mod flow_control;
pub mod settings;
pub mod stream;
pub mod stream_map;

pub use flow_control::{DEFAULT_WINDOW_SIZE, FlowControlWindow, MAX_WINDOW_SIZE, WindowError};
pub use settings::ConnectionSettings;
pub use stream::{Stream, StreamState};
pub use stream_map::StreamMap;

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::{ErrorCode, Http2Error};
use crate::frame::{
    DataFrame, Frame, GoAwayFrame, HeadersFrame, PushPromiseFrame, RstStreamFrame, SettingId,
    SettingsFrame, StreamId, WindowUpdateFrame,
};
use settings::{PendingLocalSettings, check_setting};

/// How many locally-reset streams are remembered so late peer frames can
/// be discarded instead of flagged. Entries expire by capacity, in FIFO
/// order, never by time.
const RECENTLY_RESET_CAPACITY: usize = 32;

/// Which side of the connection this machine speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates odd-numbered streams.
    Client,
    /// Initiates even-numbered streams.
    Server,
}

/// Progress through the initial SETTINGS exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Preface {
    /// We sent our initial SETTINGS.
    pub local_settings_sent: bool,
    /// The peer acknowledged our SETTINGS.
    pub local_settings_acked: bool,
    /// We received the peer's SETTINGS.
    pub remote_settings_received: bool,
    /// We acknowledged the peer's SETTINGS.
    pub remote_settings_acked: bool,
}

impl Preface {
    fn complete(self) -> bool {
        self.local_settings_sent
            && self.local_settings_acked
            && self.remote_settings_received
            && self.remote_settings_acked
    }
}

/// Top-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Both sides are exchanging their initial SETTINGS. Only SETTINGS,
    /// WINDOW_UPDATE and PING are legal here.
    PrefaceExchange(Preface),
    /// Streams flow freely.
    Active,
    /// GOAWAY was sent or received; existing streams drain, creation is
    /// restricted.
    Quiescing,
    /// Terminal.
    Closed,
}

/// GOAWAY bookkeeping for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoAwayState {
    NotSent,
    Sent {
        /// Highest stream the sender promised to process.
        last_stream_id: StreamId,
        error_code: ErrorCode,
    },
}

/// A local/remote pair of flow control window values. `local` is credit we
/// may spend sending; `remote` is credit the peer may spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Windows {
    pub local: i64,
    pub remote: i64,
}

/// Per-stream window values attached to a flow control event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamWindowChange {
    pub stream_id: StreamId,
    pub local_window: i64,
    pub remote_window: i64,
}

/// The observable effect of one accepted frame.
///
/// External layers react to these: open a child channel on
/// `StreamCreated`, drop a batch on `BulkStreamClosure`, adjust
/// writability on `FlowControlChange`. Two identical frame sequences
/// always produce identical event sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStateChange {
    /// A stream entered the map.
    StreamCreated {
        stream_id: StreamId,
        /// Credit we may spend on the new stream.
        local_window: i64,
        /// Credit the peer may spend on it.
        remote_window: i64,
    },
    /// A stream left the map.
    StreamClosed {
        stream_id: StreamId,
        local_connection_window: i64,
        remote_connection_window: i64,
        /// The RST_STREAM code, when the stream was reset rather than
        /// finished.
        reason: Option<ErrorCode>,
    },
    /// A pushed stream whose responding HEADERS carried END_STREAM: it
    /// came and went within a single frame.
    StreamCreatedAndClosed { stream_id: StreamId },
    /// A window moved.
    FlowControlChange {
        local_connection_window: i64,
        remote_connection_window: i64,
        stream_window: Option<StreamWindowChange>,
    },
    /// GOAWAY (or teardown) dropped these streams, IDs strictly
    /// increasing.
    BulkStreamClosure { closed_streams: Vec<StreamId> },
    /// A SETTINGS frame took effect; `stream_window_delta` is the
    /// INITIAL_WINDOW_SIZE change applied to every live stream.
    SettingsChanged { stream_window_delta: i32 },
}

/// Streams recently closed by a local RST_STREAM or a GOAWAY tail drop.
/// Late frames from the peer for these IDs are discarded silently.
#[derive(Debug, Default)]
struct RecentlyReset {
    ids: VecDeque<u32>,
}

impl RecentlyReset {
    fn remember(&mut self, id: StreamId) {
        if self.ids.len() == RECENTLY_RESET_CAPACITY {
            self.ids.pop_front();
        }
        self.ids.push_back(id.value());
    }

    fn contains(&self, id: StreamId) -> bool {
        self.ids.contains(&id.value())
    }
}

/// The HTTP/2 connection state machine.
///
/// Single-threaded and non-reentrant: one frame event at a time, each
/// fully validated before any state moves, so an error return leaves every
/// invariant intact.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    role: Role,
    state: ConnectionState,
    /// Our settings as the peer has acknowledged them.
    local_settings: ConnectionSettings,
    /// The peer's settings, applied on receipt.
    remote_settings: ConnectionSettings,
    pending_local: PendingLocalSettings,
    /// Peer SETTINGS received and not yet acknowledged by us.
    remote_settings_unacked: u32,
    /// Connection-level credit the peer may spend.
    inbound_window: FlowControlWindow,
    /// Connection-level credit we may spend.
    outbound_window: FlowControlWindow,
    streams: StreamMap,
    next_local_stream_id: u32,
    /// Highest locally-initiated stream ID created (0 for none).
    last_local_stream_id: u32,
    /// Highest remote-initiated stream ID seen (0 for none). Strictly
    /// increasing.
    last_remote_stream_id: u32,
    local_goaway: GoAwayState,
    remote_goaway: GoAwayState,
    recently_reset: RecentlyReset,
    /// Stream with an unterminated inbound header block; only its
    /// CONTINUATION may arrive next.
    recv_continuation: Option<StreamId>,
    /// Stream with an unterminated outbound header block.
    send_continuation: Option<StreamId>,
}

impl ConnectionStateMachine {
    /// Create a machine for the given role.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: ConnectionState::PrefaceExchange(Preface::default()),
            local_settings: ConnectionSettings::default(),
            remote_settings: ConnectionSettings::default(),
            pending_local: PendingLocalSettings::default(),
            remote_settings_unacked: 0,
            inbound_window: FlowControlWindow::default(),
            outbound_window: FlowControlWindow::default(),
            streams: StreamMap::new(),
            next_local_stream_id: match role {
                Role::Client => 1,
                Role::Server => 2,
            },
            last_local_stream_id: 0,
            last_remote_stream_id: 0,
            local_goaway: GoAwayState::NotSent,
            remote_goaway: GoAwayState::NotSent,
            recently_reset: RecentlyReset::default(),
            recv_continuation: None,
            send_continuation: None,
        }
    }

    /// Client-side machine (initiates odd streams).
    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    /// Server-side machine (initiates even streams).
    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether GOAWAY has been sent or received.
    pub fn is_quiescing(&self) -> bool {
        self.state == ConnectionState::Quiescing
    }

    /// Connection-level window values.
    pub fn connection_windows(&self) -> Windows {
        Windows {
            local: self.outbound_window.value(),
            remote: self.inbound_window.value(),
        }
    }

    /// Window values for one stream, if it is live.
    pub fn stream_windows(&self, stream_id: StreamId) -> Option<Windows> {
        self.streams.get(stream_id).map(|s| Windows {
            local: s.outbound_window(),
            remote: s.inbound_window(),
        })
    }

    /// The ID the next locally-created stream will get.
    pub fn next_outbound_stream_id(&self) -> StreamId {
        StreamId::new(self.next_local_stream_id)
    }

    /// Number of live streams.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Process a frame received from the peer.
    pub fn receive_frame(
        &mut self,
        frame: &Frame,
    ) -> Result<Option<ConnectionStateChange>, Http2Error> {
        self.check_not_closed()?;

        // An unterminated header block admits only its own CONTINUATION,
        // on any stream.
        if let Some(expected) = self.recv_continuation {
            return match frame {
                Frame::Continuation(f) if f.stream_id == expected => {
                    if f.end_headers {
                        self.recv_continuation = None;
                    }
                    Ok(None)
                }
                _ => Err(Http2Error::connection(ErrorCode::ProtocolError)),
            };
        }

        if self.in_preface() && !legal_during_preface(frame) {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }

        match frame {
            Frame::Settings(f) => self.recv_settings(f),
            Frame::Ping(_) => Ok(None),
            Frame::GoAway(f) => self.recv_goaway(f),
            Frame::WindowUpdate(f) => self.recv_window_update(f),
            Frame::Headers(f) => self.recv_headers(f),
            Frame::Data(f) => self.recv_data(f),
            Frame::RstStream(f) => self.recv_rst_stream(f),
            Frame::PushPromise(f) => self.recv_push_promise(f),
            Frame::Priority(f) => {
                if f.stream_id.is_root() {
                    Err(Http2Error::connection(ErrorCode::ProtocolError))
                } else {
                    Ok(None)
                }
            }
            Frame::Continuation(_) => Err(Http2Error::connection(ErrorCode::ProtocolError)),
            Frame::Unknown(_) => Ok(None),
        }
    }

    /// Validate and apply a frame we are about to emit. Catching a local
    /// bug here is cheaper than catching the peer's GOAWAY later.
    pub fn send_frame(
        &mut self,
        frame: &Frame,
    ) -> Result<Option<ConnectionStateChange>, Http2Error> {
        self.check_not_closed()?;

        if let Some(expected) = self.send_continuation {
            return match frame {
                Frame::Continuation(f) if f.stream_id == expected => {
                    if f.end_headers {
                        self.send_continuation = None;
                    }
                    Ok(None)
                }
                _ => Err(Http2Error::connection(ErrorCode::ProtocolError)),
            };
        }

        if self.in_preface() && !legal_during_preface(frame) {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }

        match frame {
            Frame::Settings(f) => self.send_settings(f),
            Frame::Ping(_) => Ok(None),
            Frame::GoAway(f) => self.send_goaway(f),
            Frame::WindowUpdate(f) => self.send_window_update(f),
            Frame::Headers(f) => self.send_headers(f),
            Frame::Data(f) => self.send_data(f),
            Frame::RstStream(f) => self.send_rst_stream(f),
            Frame::PushPromise(f) => self.send_push_promise(f),
            Frame::Priority(f) => {
                if f.stream_id.is_root() {
                    Err(Http2Error::connection(ErrorCode::ProtocolError))
                } else {
                    Ok(None)
                }
            }
            Frame::Continuation(_) => Err(Http2Error::connection(ErrorCode::ProtocolError)),
            Frame::Unknown(_) => Ok(None),
        }
    }

    /// Initiate graceful shutdown. Builds the GOAWAY frame (committing to
    /// the highest remote stream seen), applies it, and returns it for the
    /// caller to put on the wire.
    pub fn go_away(
        &mut self,
        error_code: ErrorCode,
        debug_data: Bytes,
    ) -> Result<(GoAwayFrame, Option<ConnectionStateChange>), Http2Error> {
        let frame = GoAwayFrame {
            last_stream_id: StreamId::new(self.last_remote_stream_id),
            error_code,
            debug_data,
        };
        let change = self.send_goaway(&frame)?;
        Ok((frame, change))
    }

    /// Drop everything: transition to `Closed` and close every remaining
    /// stream in one bulk event.
    pub fn teardown(&mut self) -> ConnectionStateChange {
        self.state = ConnectionState::Closed;
        let closed_streams = self.streams.drain_all().iter().map(Stream::id).collect();
        ConnectionStateChange::BulkStreamClosure { closed_streams }
    }

    // ---- receive handlers ----

    fn recv_settings(
        &mut self,
        frame: &SettingsFrame,
    ) -> Result<Option<ConnectionStateChange>, Http2Error> {
        if frame.ack {
            // The peer acknowledged our oldest outstanding SETTINGS;
            // that is the moment it takes effect on our side.
            let Some(batch) = self.pending_local.pop() else {
                return Err(Http2Error::connection(ErrorCode::ProtocolError));
            };
            let delta = initial_window_delta(self.local_settings.initial_window_size, &batch);
            if delta != 0 {
                for stream in self.streams.iter() {
                    if !stream.inbound_delta_fits(delta) {
                        // Put the batch back: nothing was applied.
                        self.pending_local.push_front(batch);
                        return Err(Http2Error::connection(ErrorCode::FlowControlError));
                    }
                }
            }
            for setting in &batch {
                self.local_settings.apply(setting);
            }
            if delta != 0 {
                for stream in self.streams.iter_mut() {
                    stream.apply_inbound_delta(delta)?;
                }
            }
            self.advance_preface(|p| p.local_settings_acked = true);
            Ok(Some(ConnectionStateChange::SettingsChanged {
                stream_window_delta: delta as i32,
            }))
        } else {
            for setting in &frame.settings {
                check_setting(setting)?;
            }
            let delta =
                initial_window_delta(self.remote_settings.initial_window_size, &frame.settings);
            if delta != 0 {
                for stream in self.streams.iter() {
                    if !stream.outbound_delta_fits(delta) {
                        return Err(Http2Error::connection(ErrorCode::FlowControlError));
                    }
                }
            }
            for setting in &frame.settings {
                self.remote_settings.apply(setting);
            }
            if delta != 0 {
                for stream in self.streams.iter_mut() {
                    stream.apply_outbound_delta(delta)?;
                }
            }
            self.remote_settings_unacked += 1;
            self.advance_preface(|p| p.remote_settings_received = true);
            Ok(Some(ConnectionStateChange::SettingsChanged {
                stream_window_delta: delta as i32,
            }))
        }
    }

    fn recv_goaway(
        &mut self,
        frame: &GoAwayFrame,
    ) -> Result<Option<ConnectionStateChange>, Http2Error> {
        if let GoAwayState::Sent { last_stream_id, .. } = self.remote_goaway
            && frame.last_stream_id > last_stream_id
        {
            // A follow-up GOAWAY may only lower the horizon.
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }

        // Streams we initiated above the horizon were never processed.
        let dropped = self
            .streams
            .drain_above(frame.last_stream_id, self.role == Role::Client);
        for stream in &dropped {
            self.recently_reset.remember(stream.id());
        }
        self.remote_goaway = GoAwayState::Sent {
            last_stream_id: frame.last_stream_id,
            error_code: frame.error_code,
        };
        self.state = ConnectionState::Quiescing;
        Ok(Some(ConnectionStateChange::BulkStreamClosure {
            closed_streams: dropped.iter().map(Stream::id).collect(),
        }))
    }

    fn recv_window_update(
        &mut self,
        frame: &WindowUpdateFrame,
    ) -> Result<Option<ConnectionStateChange>, Http2Error> {
        if frame.stream_id.is_root() {
            self.outbound_window
                .increment_by(frame.increment)
                .map_err(connection_window_error)?;
            return Ok(Some(self.flow_control_event(None)));
        }

        if self.streams.get(frame.stream_id).is_none() {
            self.check_absent_stream_recv(frame.stream_id)?;
            return Ok(None);
        }
        self.streams
            .modify(frame.stream_id, |s| s.recv_window_update(frame.increment))
            .transpose()?;
        Ok(Some(self.flow_control_event(Some(frame.stream_id))))
    }

    fn recv_headers(
        &mut self,
        frame: &HeadersFrame,
    ) -> Result<Option<ConnectionStateChange>, Http2Error> {
        let id = frame.stream_id;
        if id.is_root() {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }

        if let Some((transition, reaped)) = self.streams.modify_and_reap(id, |s| {
            let prior = s.state();
            s.recv_headers(&frame.headers, frame.end_stream).map(|()| prior)
        }) {
            let prior = transition?;
            if !frame.end_headers {
                self.recv_continuation = Some(id);
            }
            return Ok(reaped.map(|_| {
                if prior == StreamState::ReservedRemote {
                    ConnectionStateChange::StreamCreatedAndClosed { stream_id: id }
                } else {
                    self.stream_closed_event(id, None)
                }
            }));
        }

        // No live stream: late frame, creation, or violation.
        if self.recently_reset.contains(id) {
            if !frame.end_headers {
                self.recv_continuation = Some(id);
            }
            return Ok(None);
        }
        if !self.remote_initiated_class(id) {
            return if id.value() > self.last_local_stream_id {
                // The peer is speaking on an ID only we may create.
                Err(Http2Error::connection(ErrorCode::ProtocolError))
            } else {
                Err(Http2Error::stream(id, ErrorCode::StreamClosed))
            };
        }
        if id.value() <= self.last_remote_stream_id {
            return Err(Http2Error::stream(id, ErrorCode::StreamClosed));
        }

        // Creation of a new remote-initiated stream.
        if let GoAwayState::Sent { last_stream_id, .. } = self.local_goaway
            && id > last_stream_id
        {
            self.last_remote_stream_id = id.value();
            self.recently_reset.remember(id);
            return Err(Http2Error::stream(id, ErrorCode::RefusedStream));
        }
        if self.remote_stream_count() as u32 >= self.local_settings.max_concurrent_streams {
            self.last_remote_stream_id = id.value();
            self.recently_reset.remember(id);
            return Err(Http2Error::stream(id, ErrorCode::RefusedStream));
        }

        let mut stream = Stream::idle(
            id,
            false,
            i64::from(self.local_settings.initial_window_size),
            i64::from(self.remote_settings.initial_window_size),
        );
        stream.recv_headers(&frame.headers, frame.end_stream)?;
        let local_window = stream.outbound_window();
        let remote_window = stream.inbound_window();
        self.last_remote_stream_id = id.value();
        self.streams.insert(stream);
        if !frame.end_headers {
            self.recv_continuation = Some(id);
        }
        Ok(Some(ConnectionStateChange::StreamCreated {
            stream_id: id,
            local_window,
            remote_window,
        }))
    }

    fn recv_data(
        &mut self,
        frame: &DataFrame,
    ) -> Result<Option<ConnectionStateChange>, Http2Error> {
        let id = frame.stream_id;
        if id.is_root() {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }
        let flow_len = frame.flow_controlled_length();
        let payload_len = frame.data.len() as u64;

        // The connection window is never re-baselined, so the peer has no
        // excuse for overrunning it.
        if self.inbound_window.value() < i64::from(flow_len) {
            return Err(Http2Error::connection(ErrorCode::FlowControlError));
        }

        match self.streams.modify_and_reap(id, |s| {
            s.recv_data(flow_len, payload_len, frame.end_stream)
        }) {
            None => {
                self.check_absent_stream_recv(id)?;
                // A discarded frame still spent connection-level credit.
                self.inbound_window
                    .decrement_by(flow_len)
                    .map_err(|_| Http2Error::connection(ErrorCode::FlowControlError))?;
                Ok(None)
            }
            Some((Err(e), _)) => Err(e),
            Some((Ok(()), reaped)) => {
                self.inbound_window
                    .decrement_by(flow_len)
                    .map_err(|_| Http2Error::connection(ErrorCode::FlowControlError))?;
                match reaped {
                    Some(_) => Ok(Some(self.stream_closed_event(id, None))),
                    None => Ok(Some(self.flow_control_event(Some(id)))),
                }
            }
        }
    }

    fn recv_rst_stream(
        &mut self,
        frame: &RstStreamFrame,
    ) -> Result<Option<ConnectionStateChange>, Http2Error> {
        let id = frame.stream_id;
        if id.is_root() {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }

        match self
            .streams
            .modify_and_reap(id, |s| s.reset(frame.error_code))
        {
            Some((result, reaped)) => {
                result?;
                Ok(reaped.map(|s| self.stream_closed_event(id, s.reset_reason())))
            }
            None => {
                if self.recently_reset.contains(id) {
                    return Ok(None);
                }
                if self.is_idle(id) {
                    return Err(Http2Error::connection(ErrorCode::ProtocolError));
                }
                // RST_STREAM for a stream that already finished: tolerated.
                Ok(None)
            }
        }
    }

    fn recv_push_promise(
        &mut self,
        frame: &PushPromiseFrame,
    ) -> Result<Option<ConnectionStateChange>, Http2Error> {
        if self.role == Role::Server {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }
        if !self.local_settings.enable_push {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }
        let parent = frame.stream_id;
        let promised = frame.promised_stream_id;
        if parent.is_root() || promised.is_root() {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }

        match self.streams.get(parent) {
            None => {
                if self.recently_reset.contains(parent) {
                    if !frame.end_headers {
                        self.recv_continuation = Some(parent);
                    }
                    return Ok(None);
                }
                return Err(Http2Error::connection(ErrorCode::ProtocolError));
            }
            Some(p) => match p.state() {
                StreamState::Open | StreamState::HalfClosedLocal => {}
                _ => return Err(Http2Error::connection(ErrorCode::ProtocolError)),
            },
        }

        if !self.remote_initiated_class(promised) || promised.value() <= self.last_remote_stream_id
        {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }
        if let GoAwayState::Sent { last_stream_id, .. } = self.local_goaway
            && promised > last_stream_id
        {
            self.last_remote_stream_id = promised.value();
            self.recently_reset.remember(promised);
            return Err(Http2Error::stream(promised, ErrorCode::RefusedStream));
        }

        let stream = Stream::reserved_remote(
            promised,
            i64::from(self.local_settings.initial_window_size),
            i64::from(self.remote_settings.initial_window_size),
        );
        let local_window = stream.outbound_window();
        let remote_window = stream.inbound_window();
        self.last_remote_stream_id = promised.value();
        self.streams.insert(stream);
        if !frame.end_headers {
            self.recv_continuation = Some(parent);
        }
        Ok(Some(ConnectionStateChange::StreamCreated {
            stream_id: promised,
            local_window,
            remote_window,
        }))
    }

    // ---- send handlers ----

    fn send_settings(
        &mut self,
        frame: &SettingsFrame,
    ) -> Result<Option<ConnectionStateChange>, Http2Error> {
        if frame.ack {
            if self.remote_settings_unacked == 0 {
                return Err(Http2Error::connection(ErrorCode::ProtocolError));
            }
            self.remote_settings_unacked -= 1;
            self.advance_preface(|p| p.remote_settings_acked = true);
            Ok(None)
        } else {
            for setting in &frame.settings {
                check_setting(setting)?;
            }
            // Takes effect only once the peer acknowledges.
            self.pending_local.push(frame.settings.clone());
            self.advance_preface(|p| p.local_settings_sent = true);
            Ok(None)
        }
    }

    fn send_goaway(
        &mut self,
        frame: &GoAwayFrame,
    ) -> Result<Option<ConnectionStateChange>, Http2Error> {
        if let GoAwayState::Sent { last_stream_id, .. } = self.local_goaway
            && frame.last_stream_id > last_stream_id
        {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }

        // Peer-initiated streams above the horizon will not be processed.
        let dropped = self
            .streams
            .drain_above(frame.last_stream_id, self.role == Role::Server);
        for stream in &dropped {
            self.recently_reset.remember(stream.id());
        }
        self.local_goaway = GoAwayState::Sent {
            last_stream_id: frame.last_stream_id,
            error_code: frame.error_code,
        };
        self.state = ConnectionState::Quiescing;
        Ok(Some(ConnectionStateChange::BulkStreamClosure {
            closed_streams: dropped.iter().map(Stream::id).collect(),
        }))
    }

    fn send_window_update(
        &mut self,
        frame: &WindowUpdateFrame,
    ) -> Result<Option<ConnectionStateChange>, Http2Error> {
        if frame.stream_id.is_root() {
            self.inbound_window
                .increment_by(frame.increment)
                .map_err(connection_window_error)?;
            return Ok(Some(self.flow_control_event(None)));
        }

        if self.streams.get(frame.stream_id).is_none() {
            return Err(self.absent_stream_send_error(frame.stream_id));
        }
        self.streams
            .modify(frame.stream_id, |s| s.send_window_update(frame.increment))
            .transpose()?;
        Ok(Some(self.flow_control_event(Some(frame.stream_id))))
    }

    fn send_headers(
        &mut self,
        frame: &HeadersFrame,
    ) -> Result<Option<ConnectionStateChange>, Http2Error> {
        let id = frame.stream_id;
        if id.is_root() {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }

        if let Some((transition, reaped)) = self.streams.modify_and_reap(id, |s| {
            let prior = s.state();
            s.send_headers(&frame.headers, frame.end_stream).map(|()| prior)
        }) {
            let prior = transition?;
            if !frame.end_headers {
                self.send_continuation = Some(id);
            }
            return Ok(reaped.map(|_| {
                if prior == StreamState::ReservedLocal {
                    ConnectionStateChange::StreamCreatedAndClosed { stream_id: id }
                } else {
                    self.stream_closed_event(id, None)
                }
            }));
        }

        if self.remote_initiated_class(id) {
            return if id.value() > self.last_remote_stream_id {
                Err(Http2Error::connection(ErrorCode::ProtocolError))
            } else {
                Err(Http2Error::stream(id, ErrorCode::StreamClosed))
            };
        }
        if id.value() <= self.last_local_stream_id {
            return Err(Http2Error::stream(id, ErrorCode::StreamClosed));
        }

        // Creating a new local stream.
        if matches!(self.remote_goaway, GoAwayState::Sent { .. }) {
            return Err(Http2Error::stream(id, ErrorCode::RefusedStream));
        }
        if self.local_stream_count() as u32 >= self.remote_settings.max_concurrent_streams {
            return Err(Http2Error::stream(id, ErrorCode::RefusedStream));
        }

        let mut stream = Stream::idle(
            id,
            true,
            i64::from(self.local_settings.initial_window_size),
            i64::from(self.remote_settings.initial_window_size),
        );
        stream.send_headers(&frame.headers, frame.end_stream)?;
        let local_window = stream.outbound_window();
        let remote_window = stream.inbound_window();
        self.last_local_stream_id = id.value();
        self.next_local_stream_id = id.value() + 2;
        self.streams.insert(stream);
        if !frame.end_headers {
            self.send_continuation = Some(id);
        }
        Ok(Some(ConnectionStateChange::StreamCreated {
            stream_id: id,
            local_window,
            remote_window,
        }))
    }

    fn send_data(
        &mut self,
        frame: &DataFrame,
    ) -> Result<Option<ConnectionStateChange>, Http2Error> {
        let id = frame.stream_id;
        if id.is_root() {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }
        let flow_len = frame.flow_controlled_length();
        let payload_len = frame.data.len() as u64;

        if self.outbound_window.value() < i64::from(flow_len) {
            return Err(Http2Error::connection(ErrorCode::FlowControlError));
        }

        match self.streams.modify_and_reap(id, |s| {
            s.send_data(flow_len, payload_len, frame.end_stream)
        }) {
            None => Err(self.absent_stream_send_error(id)),
            Some((Err(e), _)) => Err(e),
            Some((Ok(()), reaped)) => {
                self.outbound_window
                    .decrement_by(flow_len)
                    .map_err(|_| Http2Error::connection(ErrorCode::FlowControlError))?;
                match reaped {
                    Some(_) => Ok(Some(self.stream_closed_event(id, None))),
                    None => Ok(Some(self.flow_control_event(Some(id)))),
                }
            }
        }
    }

    fn send_rst_stream(
        &mut self,
        frame: &RstStreamFrame,
    ) -> Result<Option<ConnectionStateChange>, Http2Error> {
        let id = frame.stream_id;
        if id.is_root() {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }

        match self
            .streams
            .modify_and_reap(id, |s| s.reset(frame.error_code))
        {
            Some((result, reaped)) => {
                result?;
                // Late peer frames for this stream get discarded from now on.
                self.recently_reset.remember(id);
                Ok(reaped.map(|s| self.stream_closed_event(id, s.reset_reason())))
            }
            None => {
                if self.is_idle(id) {
                    return Err(Http2Error::connection(ErrorCode::ProtocolError));
                }
                // Resetting an already-dead stream is a no-op.
                Ok(None)
            }
        }
    }

    fn send_push_promise(
        &mut self,
        frame: &PushPromiseFrame,
    ) -> Result<Option<ConnectionStateChange>, Http2Error> {
        if self.role == Role::Client {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }
        if !self.remote_settings.enable_push {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }
        let parent = frame.stream_id;
        let promised = frame.promised_stream_id;
        if parent.is_root() || promised.is_root() {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }

        match self.streams.get(parent) {
            Some(p) => match p.state() {
                StreamState::Open | StreamState::HalfClosedRemote => {}
                _ => return Err(Http2Error::connection(ErrorCode::ProtocolError)),
            },
            None => return Err(Http2Error::connection(ErrorCode::ProtocolError)),
        }

        if self.remote_initiated_class(promised) || promised.value() <= self.last_local_stream_id {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }
        if matches!(self.remote_goaway, GoAwayState::Sent { .. }) {
            return Err(Http2Error::stream(promised, ErrorCode::RefusedStream));
        }

        let stream = Stream::reserved_local(
            promised,
            i64::from(self.local_settings.initial_window_size),
            i64::from(self.remote_settings.initial_window_size),
        );
        let local_window = stream.outbound_window();
        let remote_window = stream.inbound_window();
        self.last_local_stream_id = promised.value();
        self.next_local_stream_id = promised.value() + 2;
        self.streams.insert(stream);
        if !frame.end_headers {
            self.send_continuation = Some(parent);
        }
        Ok(Some(ConnectionStateChange::StreamCreated {
            stream_id: promised,
            local_window,
            remote_window,
        }))
    }

    // ---- shared helpers ----

    fn check_not_closed(&self) -> Result<(), Http2Error> {
        if self.state == ConnectionState::Closed {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }
        Ok(())
    }

    fn in_preface(&self) -> bool {
        matches!(self.state, ConnectionState::PrefaceExchange(_))
    }

    fn advance_preface(&mut self, update: impl FnOnce(&mut Preface)) {
        if let ConnectionState::PrefaceExchange(mut preface) = self.state {
            update(&mut preface);
            self.state = if preface.complete() {
                ConnectionState::Active
            } else {
                ConnectionState::PrefaceExchange(preface)
            };
        }
    }

    /// Whether the given stream ID belongs to the peer's initiator class.
    fn remote_initiated_class(&self, id: StreamId) -> bool {
        match self.role {
            Role::Client => id.is_server_initiated(),
            Role::Server => id.is_client_initiated(),
        }
    }

    /// Whether this ID has never carried a frame in either direction.
    fn is_idle(&self, id: StreamId) -> bool {
        if self.remote_initiated_class(id) {
            id.value() > self.last_remote_stream_id
        } else {
            id.value() > self.last_local_stream_id
        }
    }

    fn remote_stream_count(&self) -> usize {
        match self.role {
            Role::Client => self.streams.server_count(),
            Role::Server => self.streams.client_count(),
        }
    }

    fn local_stream_count(&self) -> usize {
        match self.role {
            Role::Client => self.streams.client_count(),
            Role::Server => self.streams.server_count(),
        }
    }

    /// Classify a peer frame for a stream not in the map. `Ok(())` means
    /// discard silently (recently reset); otherwise the appropriate error.
    fn check_absent_stream_recv(&self, id: StreamId) -> Result<(), Http2Error> {
        if self.recently_reset.contains(id) {
            return Ok(());
        }
        if self.is_idle(id) {
            return Err(Http2Error::connection(ErrorCode::ProtocolError));
        }
        Err(Http2Error::stream(id, ErrorCode::StreamClosed))
    }

    /// A frame we want to emit names a stream not in the map: a local bug,
    /// scoped by whether the stream ever existed.
    fn absent_stream_send_error(&self, id: StreamId) -> Http2Error {
        if self.is_idle(id) {
            Http2Error::connection(ErrorCode::ProtocolError)
        } else {
            Http2Error::stream(id, ErrorCode::StreamClosed)
        }
    }

    fn stream_closed_event(
        &self,
        stream_id: StreamId,
        reason: Option<ErrorCode>,
    ) -> ConnectionStateChange {
        ConnectionStateChange::StreamClosed {
            stream_id,
            local_connection_window: self.outbound_window.value(),
            remote_connection_window: self.inbound_window.value(),
            reason,
        }
    }

    fn flow_control_event(&self, stream_id: Option<StreamId>) -> ConnectionStateChange {
        let stream_window = stream_id.and_then(|id| {
            self.streams.get(id).map(|s| StreamWindowChange {
                stream_id: id,
                local_window: s.outbound_window(),
                remote_window: s.inbound_window(),
            })
        });
        ConnectionStateChange::FlowControlChange {
            local_connection_window: self.outbound_window.value(),
            remote_connection_window: self.inbound_window.value(),
            stream_window,
        }
    }
}

/// Net INITIAL_WINDOW_SIZE change across one SETTINGS batch.
fn initial_window_delta(current: u32, batch: &[crate::frame::Setting]) -> i64 {
    let mut new = current;
    for setting in batch {
        if setting.id == SettingId::InitialWindowSize {
            new = setting.value;
        }
    }
    i64::from(new) - i64::from(current)
}

/// Frame types legal while the initial SETTINGS exchange is incomplete.
/// Unknown frames are ignored in every state.
fn legal_during_preface(frame: &Frame) -> bool {
    matches!(
        frame,
        Frame::Settings(_) | Frame::WindowUpdate(_) | Frame::Ping(_) | Frame::Unknown(_)
    )
}

fn connection_window_error(error: WindowError) -> Http2Error {
    match error {
        WindowError::ZeroIncrement => Http2Error::connection(ErrorCode::ProtocolError),
        WindowError::InvalidSize => Http2Error::connection(ErrorCode::FlowControlError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{
        ContinuationFrame, PingFrame, Priority, PriorityFrame, Setting, UnknownFrame,
    };

    fn headers(id: u32, end_stream: bool) -> Frame {
        Frame::Headers(HeadersFrame {
            stream_id: StreamId::new(id),
            end_stream,
            end_headers: true,
            priority: None,
            headers: Vec::new(),
        })
    }

    fn headers_unterminated(id: u32) -> Frame {
        Frame::Headers(HeadersFrame {
            stream_id: StreamId::new(id),
            end_stream: false,
            end_headers: false,
            priority: None,
            headers: Vec::new(),
        })
    }

    fn continuation(id: u32, end_headers: bool) -> Frame {
        Frame::Continuation(ContinuationFrame {
            stream_id: StreamId::new(id),
            end_headers,
            headers: Vec::new(),
        })
    }

    fn data(id: u32, len: usize, end_stream: bool) -> Frame {
        Frame::Data(DataFrame {
            stream_id: StreamId::new(id),
            end_stream,
            pad_length: None,
            data: Bytes::from(vec![0u8; len]),
        })
    }

    fn settings(list: Vec<Setting>) -> Frame {
        Frame::Settings(SettingsFrame {
            ack: false,
            settings: list,
        })
    }

    fn settings_ack() -> Frame {
        Frame::Settings(SettingsFrame::ack())
    }

    fn setting(id: SettingId, value: u32) -> Setting {
        Setting { id, value }
    }

    fn window_update(id: u32, increment: u32) -> Frame {
        Frame::WindowUpdate(WindowUpdateFrame {
            stream_id: StreamId::new(id),
            increment,
        })
    }

    fn rst(id: u32, code: ErrorCode) -> Frame {
        Frame::RstStream(RstStreamFrame {
            stream_id: StreamId::new(id),
            error_code: code,
        })
    }

    fn goaway(last: u32, code: ErrorCode) -> Frame {
        Frame::GoAway(GoAwayFrame {
            last_stream_id: StreamId::new(last),
            error_code: code,
            debug_data: Bytes::new(),
        })
    }

    fn push_promise(parent: u32, promised: u32) -> Frame {
        Frame::PushPromise(PushPromiseFrame {
            stream_id: StreamId::new(parent),
            end_headers: true,
            promised_stream_id: StreamId::new(promised),
            headers: Vec::new(),
        })
    }

    /// Run the full preface dance on a fresh machine of the given role.
    fn activated(role: Role) -> ConnectionStateMachine {
        let mut conn = ConnectionStateMachine::new(role);
        conn.send_frame(&settings(vec![])).unwrap();
        conn.receive_frame(&settings(vec![])).unwrap();
        conn.send_frame(&settings_ack()).unwrap();
        conn.receive_frame(&settings_ack()).unwrap();
        assert_eq!(conn.state(), ConnectionState::Active);
        conn
    }

    fn active_client() -> ConnectionStateMachine {
        activated(Role::Client)
    }

    fn active_server() -> ConnectionStateMachine {
        activated(Role::Server)
    }

    /// Apply a fresh local SETTINGS batch and the peer's ACK for it.
    fn apply_local_settings(conn: &mut ConnectionStateMachine, list: Vec<Setting>) {
        conn.send_frame(&settings(list)).unwrap();
        conn.receive_frame(&settings_ack()).unwrap();
    }

    // ---- preface exchange ----

    #[test]
    fn test_preface_exchange_reaches_active() {
        let mut conn = ConnectionStateMachine::client();
        assert!(matches!(conn.state(), ConnectionState::PrefaceExchange(_)));

        conn.send_frame(&settings(vec![])).unwrap();
        conn.receive_frame(&settings(vec![])).unwrap();
        assert!(matches!(conn.state(), ConnectionState::PrefaceExchange(_)));

        conn.send_frame(&settings_ack()).unwrap();
        assert!(matches!(conn.state(), ConnectionState::PrefaceExchange(_)));

        conn.receive_frame(&settings_ack()).unwrap();
        assert_eq!(conn.state(), ConnectionState::Active);
    }

    #[test]
    fn test_preface_rejects_stream_frames() {
        let mut conn = ConnectionStateMachine::client();
        conn.send_frame(&settings(vec![])).unwrap();

        let err = conn.receive_frame(&headers(1, false)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));

        let err = conn.send_frame(&headers(1, false)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));

        let err = conn.receive_frame(&goaway(0, ErrorCode::NoError)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_preface_allows_ping_and_window_update() {
        let mut conn = ConnectionStateMachine::client();
        conn.send_frame(&settings(vec![])).unwrap();

        let ping = Frame::Ping(PingFrame {
            ack: false,
            data: [0; 8],
        });
        assert_eq!(conn.receive_frame(&ping).unwrap(), None);
        assert!(conn.receive_frame(&window_update(0, 100)).unwrap().is_some());
    }

    #[test]
    fn test_settings_ack_without_pending_is_protocol_error() {
        let mut conn = ConnectionStateMachine::client();
        let err = conn.receive_frame(&settings_ack()).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_send_ack_without_received_settings_is_protocol_error() {
        let mut conn = ConnectionStateMachine::client();
        let err = conn.send_frame(&settings_ack()).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));
    }

    // ---- request/response lifecycle ----

    #[test]
    fn test_request_response_lifecycle() {
        let mut conn = active_client();

        // Request headers with END_STREAM open the stream half-closed.
        let change = conn.send_frame(&headers(1, true)).unwrap();
        assert_eq!(
            change,
            Some(ConnectionStateChange::StreamCreated {
                stream_id: StreamId::new(1),
                local_window: 65535,
                remote_window: 65535,
            })
        );

        // Response headers keep the stream alive.
        assert_eq!(conn.receive_frame(&headers(1, false)).unwrap(), None);

        // Response body with END_STREAM finishes it.
        let change = conn.receive_frame(&data(1, 2, true)).unwrap();
        assert_eq!(
            change,
            Some(ConnectionStateChange::StreamClosed {
                stream_id: StreamId::new(1),
                local_connection_window: 65535,
                remote_connection_window: 65533,
                reason: None,
            })
        );
        assert_eq!(conn.active_streams(), 0);
    }

    #[test]
    fn test_flow_control_accounting() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();

        let change = conn.receive_frame(&data(1, 100, false)).unwrap();
        assert_eq!(
            change,
            Some(ConnectionStateChange::FlowControlChange {
                local_connection_window: 65535,
                remote_connection_window: 65435,
                stream_window: Some(StreamWindowChange {
                    stream_id: StreamId::new(1),
                    local_window: 65535,
                    remote_window: 65435,
                }),
            })
        );
    }

    #[test]
    fn test_send_data_consumes_windows() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();

        let change = conn.send_frame(&data(1, 100, false)).unwrap();
        assert_eq!(
            change,
            Some(ConnectionStateChange::FlowControlChange {
                local_connection_window: 65435,
                remote_connection_window: 65535,
                stream_window: Some(StreamWindowChange {
                    stream_id: StreamId::new(1),
                    local_window: 65435,
                    remote_window: 65535,
                }),
            })
        );
    }

    #[test]
    fn test_padded_data_counts_padding() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();

        let frame = Frame::Data(DataFrame {
            stream_id: StreamId::new(1),
            end_stream: false,
            pad_length: Some(9),
            data: Bytes::from_static(b"hello"),
        });
        conn.receive_frame(&frame).unwrap();
        // 5 payload + 9 padding + 1 length octet
        assert_eq!(conn.connection_windows().remote, 65535 - 15);
    }

    #[test]
    fn test_zero_length_data_with_end_stream_closes() {
        let mut conn = active_server();
        conn.receive_frame(&headers(1, false)).unwrap();

        let change = conn.receive_frame(&data(1, 0, true)).unwrap();
        assert!(matches!(
            change,
            Some(ConnectionStateChange::StreamClosed { reason: None, .. })
        ));
    }

    #[test]
    fn test_stream_id_not_reusable_after_close() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, true)).unwrap();
        conn.receive_frame(&headers(1, true)).unwrap();
        assert_eq!(conn.active_streams(), 0);

        let err = conn.send_frame(&headers(1, false)).unwrap_err();
        assert_eq!(
            err,
            Http2Error::stream(StreamId::new(1), ErrorCode::StreamClosed)
        );
    }

    #[test]
    fn test_next_outbound_stream_id_advances() {
        let mut conn = active_client();
        assert_eq!(conn.next_outbound_stream_id(), StreamId::new(1));
        conn.send_frame(&headers(1, false)).unwrap();
        assert_eq!(conn.next_outbound_stream_id(), StreamId::new(3));
        conn.send_frame(&headers(3, false)).unwrap();
        assert_eq!(conn.next_outbound_stream_id(), StreamId::new(5));
    }

    // ---- boundary behaviors ----

    #[test]
    fn test_window_update_zero_increment_on_root() {
        let mut conn = active_client();
        let err = conn.receive_frame(&window_update(0, 0)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_window_update_overflow_on_root() {
        let mut conn = active_client();
        let err = conn
            .receive_frame(&window_update(0, MAX_WINDOW_SIZE as u32))
            .unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::FlowControlError));
    }

    #[test]
    fn test_window_update_overflow_on_stream() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();

        let err = conn
            .receive_frame(&window_update(1, MAX_WINDOW_SIZE as u32))
            .unwrap_err();
        assert_eq!(
            err,
            Http2Error::stream(StreamId::new(1), ErrorCode::FlowControlError)
        );
    }

    #[test]
    fn test_window_update_zero_increment_on_stream() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();

        let err = conn.receive_frame(&window_update(1, 0)).unwrap_err();
        assert_eq!(
            err,
            Http2Error::stream(StreamId::new(1), ErrorCode::ProtocolError)
        );
    }

    #[test]
    fn test_data_on_root_stream() {
        let mut conn = active_client();
        let err = conn.receive_frame(&data(0, 1, false)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_server_rejects_even_stream_headers() {
        let mut conn = active_server();
        let err = conn.receive_frame(&headers(2, false)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_rst_on_idle_stream() {
        let mut conn = active_client();
        let err = conn
            .receive_frame(&rst(1, ErrorCode::Cancel))
            .unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_headers_after_end_stream_same_direction() {
        let mut conn = active_server();
        conn.receive_frame(&headers(1, true)).unwrap();

        let err = conn.receive_frame(&headers(1, true)).unwrap_err();
        assert_eq!(
            err,
            Http2Error::stream(StreamId::new(1), ErrorCode::StreamClosed)
        );
    }

    #[test]
    fn test_remote_stream_ids_must_increase() {
        let mut conn = active_server();
        conn.receive_frame(&headers(5, false)).unwrap();

        let err = conn.receive_frame(&headers(3, false)).unwrap_err();
        assert_eq!(
            err,
            Http2Error::stream(StreamId::new(3), ErrorCode::StreamClosed)
        );
    }

    #[test]
    fn test_recv_data_beyond_connection_window() {
        let mut conn = active_server();
        conn.receive_frame(&headers(1, false)).unwrap();

        let err = conn.receive_frame(&data(1, 70000, false)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::FlowControlError));
        // nothing was consumed
        assert_eq!(conn.connection_windows().remote, 65535);
    }

    #[test]
    fn test_send_data_beyond_connection_window() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();

        let err = conn.send_frame(&data(1, 70000, false)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::FlowControlError));
        assert_eq!(conn.connection_windows().local, 65535);
    }

    #[test]
    fn test_priority_accepted_and_ignored() {
        let mut conn = active_client();
        let frame = Frame::Priority(PriorityFrame {
            stream_id: StreamId::new(1),
            priority: Priority {
                exclusive: false,
                dependency: StreamId::new(0),
                weight: 16,
            },
        });
        assert_eq!(conn.receive_frame(&frame).unwrap(), None);

        let on_root = Frame::Priority(PriorityFrame {
            stream_id: StreamId::ROOT,
            priority: Priority {
                exclusive: false,
                dependency: StreamId::new(0),
                weight: 16,
            },
        });
        assert!(conn.receive_frame(&on_root).is_err());
    }

    #[test]
    fn test_unknown_frame_ignored() {
        let mut conn = ConnectionStateMachine::client();
        let frame = Frame::Unknown(UnknownFrame {
            frame_type: 0xbe,
            flags: 0,
            stream_id: StreamId::new(1),
            payload: Bytes::new(),
        });
        // even during the preface exchange
        assert_eq!(conn.receive_frame(&frame).unwrap(), None);
    }

    // ---- RST_STREAM and the recently-reset grace ----

    #[test]
    fn test_rst_stream_closes_with_reason() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();

        let change = conn.receive_frame(&rst(1, ErrorCode::Cancel)).unwrap();
        assert_eq!(
            change,
            Some(ConnectionStateChange::StreamClosed {
                stream_id: StreamId::new(1),
                local_connection_window: 65535,
                remote_connection_window: 65535,
                reason: Some(ErrorCode::Cancel),
            })
        );
        assert_eq!(conn.active_streams(), 0);
    }

    #[test]
    fn test_recently_reset_grace() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();
        conn.send_frame(&headers(3, false)).unwrap();

        conn.send_frame(&rst(3, ErrorCode::Cancel)).unwrap();

        // Late frames from the peer are discarded without error or event.
        assert_eq!(conn.receive_frame(&data(3, 10, false)).unwrap(), None);
        assert_eq!(conn.receive_frame(&headers(3, true)).unwrap(), None);
        assert_eq!(conn.receive_frame(&rst(3, ErrorCode::Cancel)).unwrap(), None);
    }

    #[test]
    fn test_discarded_data_still_consumes_connection_credit() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();
        conn.send_frame(&rst(1, ErrorCode::Cancel)).unwrap();

        conn.receive_frame(&data(1, 100, false)).unwrap();
        assert_eq!(conn.connection_windows().remote, 65435);
    }

    #[test]
    fn test_data_on_finished_stream_is_stream_closed() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, true)).unwrap();
        conn.receive_frame(&headers(1, true)).unwrap();

        // Closed normally, not reset: no grace applies.
        let err = conn.receive_frame(&data(1, 1, false)).unwrap_err();
        assert_eq!(
            err,
            Http2Error::stream(StreamId::new(1), ErrorCode::StreamClosed)
        );
    }

    #[test]
    fn test_reset_capacity_is_bounded() {
        let mut reset = RecentlyReset::default();
        for id in 0..(RECENTLY_RESET_CAPACITY as u32 + 8) {
            reset.remember(StreamId::new(2 * id + 1));
        }
        assert!(!reset.contains(StreamId::new(1)));
        assert!(reset.contains(StreamId::new(2 * RECENTLY_RESET_CAPACITY as u32 + 15)));
        assert_eq!(reset.ids.len(), RECENTLY_RESET_CAPACITY);
    }

    // ---- settings negotiation ----

    #[test]
    fn test_initial_window_size_rebaseline() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();
        conn.send_frame(&headers(3, false)).unwrap();

        let change = conn
            .receive_frame(&settings(vec![setting(SettingId::InitialWindowSize, 131070)]))
            .unwrap();
        assert_eq!(
            change,
            Some(ConnectionStateChange::SettingsChanged {
                stream_window_delta: 65535,
            })
        );
        conn.send_frame(&settings_ack()).unwrap();

        assert_eq!(conn.stream_windows(StreamId::new(1)).unwrap().local, 131070);
        assert_eq!(conn.stream_windows(StreamId::new(3)).unwrap().local, 131070);
        // the connection window is not re-baselined
        assert_eq!(conn.connection_windows().local, 65535);
    }

    #[test]
    fn test_settings_overflow_is_atomic() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();
        conn.send_frame(&headers(3, false)).unwrap();

        // Pump stream 1 close to the limit so the delta overflows it (and
        // only it).
        let increment = MAX_WINDOW_SIZE as u32 - 65535 - 1000;
        conn.receive_frame(&window_update(1, increment)).unwrap();

        let err = conn
            .receive_frame(&settings(vec![setting(
                SettingId::InitialWindowSize,
                MAX_WINDOW_SIZE as u32,
            )]))
            .unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::FlowControlError));

        // No window moved, not even stream 3's.
        assert_eq!(
            conn.stream_windows(StreamId::new(1)).unwrap().local,
            MAX_WINDOW_SIZE - 1000
        );
        assert_eq!(conn.stream_windows(StreamId::new(3)).unwrap().local, 65535);
    }

    #[test]
    fn test_local_settings_apply_on_ack() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();

        conn.send_frame(&settings(vec![setting(SettingId::InitialWindowSize, 70000)]))
            .unwrap();
        // Not applied yet: the peer may still be operating on the old value.
        assert_eq!(conn.stream_windows(StreamId::new(1)).unwrap().remote, 65535);

        let change = conn.receive_frame(&settings_ack()).unwrap();
        assert_eq!(
            change,
            Some(ConnectionStateChange::SettingsChanged {
                stream_window_delta: 70000 - 65535,
            })
        );
        assert_eq!(conn.stream_windows(StreamId::new(1)).unwrap().remote, 70000);
    }

    #[test]
    fn test_settings_value_validation() {
        let mut conn = active_client();

        let err = conn
            .receive_frame(&settings(vec![setting(SettingId::EnablePush, 2)]))
            .unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));

        let err = conn
            .receive_frame(&settings(vec![setting(
                SettingId::InitialWindowSize,
                MAX_WINDOW_SIZE as u32 + 1,
            )]))
            .unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::FlowControlError));

        let err = conn
            .receive_frame(&settings(vec![setting(SettingId::MaxFrameSize, 1)]))
            .unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_unknown_setting_ignored() {
        let mut conn = active_client();
        let change = conn
            .receive_frame(&settings(vec![Setting {
                id: SettingId::Unknown(0x99),
                value: 42,
            }]))
            .unwrap();
        assert_eq!(
            change,
            Some(ConnectionStateChange::SettingsChanged {
                stream_window_delta: 0,
            })
        );
    }

    #[test]
    fn test_max_concurrent_streams_refusal() {
        let mut conn = active_server();
        apply_local_settings(
            &mut conn,
            vec![setting(SettingId::MaxConcurrentStreams, 1)],
        );

        conn.receive_frame(&headers(1, false)).unwrap();
        let err = conn.receive_frame(&headers(3, false)).unwrap_err();
        assert_eq!(
            err,
            Http2Error::stream(StreamId::new(3), ErrorCode::RefusedStream)
        );

        // The refused stream's trailing frames are discarded.
        assert_eq!(conn.receive_frame(&data(3, 5, false)).unwrap(), None);
    }

    // ---- GOAWAY and quiescence ----

    #[test]
    fn test_goaway_closes_tail() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();
        conn.send_frame(&headers(3, false)).unwrap();
        conn.send_frame(&headers(7, false)).unwrap();

        let change = conn
            .receive_frame(&goaway(5, ErrorCode::NoError))
            .unwrap();
        assert_eq!(
            change,
            Some(ConnectionStateChange::BulkStreamClosure {
                closed_streams: vec![StreamId::new(7)],
            })
        );
        assert!(conn.is_quiescing());
        assert!(conn.stream_windows(StreamId::new(1)).is_some());
        assert!(conn.stream_windows(StreamId::new(3)).is_some());
        assert!(conn.stream_windows(StreamId::new(7)).is_none());
    }

    #[test]
    fn test_goaway_recv_blocks_new_local_streams() {
        let mut conn = active_client();
        conn.receive_frame(&goaway(0, ErrorCode::NoError)).unwrap();

        let err = conn.send_frame(&headers(1, false)).unwrap_err();
        assert_eq!(
            err,
            Http2Error::stream(StreamId::new(1), ErrorCode::RefusedStream)
        );
    }

    #[test]
    fn test_goaway_send_refuses_newer_remote_streams() {
        let mut conn = active_server();
        conn.receive_frame(&headers(1, false)).unwrap();

        conn.send_frame(&goaway(1, ErrorCode::NoError)).unwrap();
        assert!(conn.is_quiescing());

        // Stream 1 is below the horizon and keeps working.
        conn.receive_frame(&data(1, 5, false)).unwrap();

        let err = conn.receive_frame(&headers(3, false)).unwrap_err();
        assert_eq!(
            err,
            Http2Error::stream(StreamId::new(3), ErrorCode::RefusedStream)
        );
        // and its stragglers are discarded
        assert_eq!(conn.receive_frame(&data(3, 5, true)).unwrap(), None);
    }

    #[test]
    fn test_second_goaway_must_not_raise_horizon() {
        let mut conn = active_client();
        conn.receive_frame(&goaway(5, ErrorCode::NoError)).unwrap();

        let err = conn
            .receive_frame(&goaway(7, ErrorCode::NoError))
            .unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));

        // Lowering is fine.
        conn.receive_frame(&goaway(3, ErrorCode::NoError)).unwrap();
    }

    #[test]
    fn test_goaway_convenience_commits_to_last_seen() {
        let mut conn = active_server();
        conn.receive_frame(&headers(1, false)).unwrap();
        conn.receive_frame(&headers(3, false)).unwrap();

        let (frame, change) = conn
            .go_away(ErrorCode::NoError, Bytes::from_static(b"shutting down"))
            .unwrap();
        assert_eq!(frame.last_stream_id, StreamId::new(3));
        assert_eq!(
            change,
            Some(ConnectionStateChange::BulkStreamClosure {
                closed_streams: vec![],
            })
        );
        assert!(conn.is_quiescing());
    }

    #[test]
    fn test_teardown_closes_everything() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();
        conn.send_frame(&headers(3, false)).unwrap();

        let change = conn.teardown();
        assert_eq!(
            change,
            ConnectionStateChange::BulkStreamClosure {
                closed_streams: vec![StreamId::new(1), StreamId::new(3)],
            }
        );
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.active_streams(), 0);

        let err = conn.receive_frame(&data(1, 1, false)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));
    }

    // ---- CONTINUATION sequencing ----

    #[test]
    fn test_continuation_blocks_other_frames() {
        let mut conn = active_server();
        conn.receive_frame(&headers_unterminated(1)).unwrap();

        // Anything but the matching CONTINUATION is fatal.
        let err = conn.receive_frame(&data(1, 5, false)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));
        let err = conn.receive_frame(&continuation(3, true)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));

        assert_eq!(conn.receive_frame(&continuation(1, false)).unwrap(), None);
        assert_eq!(conn.receive_frame(&continuation(1, true)).unwrap(), None);

        // Block finished: normal dispatch resumes.
        conn.receive_frame(&data(1, 5, false)).unwrap();
    }

    #[test]
    fn test_orphan_continuation() {
        let mut conn = active_client();
        let err = conn.receive_frame(&continuation(1, true)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_send_side_continuation_tracking() {
        let mut conn = active_client();
        conn.send_frame(&headers_unterminated(1)).unwrap();

        let err = conn.send_frame(&data(1, 5, false)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));

        conn.send_frame(&continuation(1, true)).unwrap();
        conn.send_frame(&data(1, 5, false)).unwrap();
    }

    // ---- server push ----

    #[test]
    fn test_push_promise_reserves_stream() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();

        let change = conn.receive_frame(&push_promise(1, 2)).unwrap();
        assert_eq!(
            change,
            Some(ConnectionStateChange::StreamCreated {
                stream_id: StreamId::new(2),
                local_window: 65535,
                remote_window: 65535,
            })
        );

        // The pushed response flows like any other stream.
        assert_eq!(conn.receive_frame(&headers(2, false)).unwrap(), None);
        let change = conn.receive_frame(&data(2, 4, true)).unwrap();
        assert!(matches!(
            change,
            Some(ConnectionStateChange::StreamClosed { reason: None, .. })
        ));
    }

    #[test]
    fn test_pushed_stream_closed_by_responding_headers() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();
        conn.receive_frame(&push_promise(1, 2)).unwrap();

        let change = conn.receive_frame(&headers(2, true)).unwrap();
        assert_eq!(
            change,
            Some(ConnectionStateChange::StreamCreatedAndClosed {
                stream_id: StreamId::new(2),
            })
        );
        assert!(conn.stream_windows(StreamId::new(2)).is_none());
    }

    #[test]
    fn test_push_promise_with_push_disabled() {
        let mut conn = active_client();
        apply_local_settings(&mut conn, vec![setting(SettingId::EnablePush, 0)]);
        conn.send_frame(&headers(1, false)).unwrap();

        let err = conn.receive_frame(&push_promise(1, 2)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_push_promise_wrong_direction() {
        // A server never receives pushes, a client never sends them.
        let mut server = active_server();
        server.receive_frame(&headers(1, false)).unwrap();
        let err = server.receive_frame(&push_promise(1, 2)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));

        let mut client = active_client();
        client.send_frame(&headers(1, false)).unwrap();
        let err = client.send_frame(&push_promise(1, 2)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_push_promise_requires_live_parent() {
        let mut conn = active_client();
        let err = conn.receive_frame(&push_promise(1, 2)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_server_push_send_path() {
        let mut conn = active_server();
        conn.receive_frame(&headers(1, false)).unwrap();

        let change = conn.send_frame(&push_promise(1, 2)).unwrap();
        assert_eq!(
            change,
            Some(ConnectionStateChange::StreamCreated {
                stream_id: StreamId::new(2),
                local_window: 65535,
                remote_window: 65535,
            })
        );

        let change = conn.send_frame(&headers(2, true)).unwrap();
        assert_eq!(
            change,
            Some(ConnectionStateChange::StreamCreatedAndClosed {
                stream_id: StreamId::new(2),
            })
        );
    }

    #[test]
    fn test_server_push_respects_peer_enable_push() {
        let mut conn = active_server();
        conn.receive_frame(&settings(vec![setting(SettingId::EnablePush, 0)]))
            .unwrap();
        conn.send_frame(&settings_ack()).unwrap();
        conn.receive_frame(&headers(1, false)).unwrap();

        let err = conn.send_frame(&push_promise(1, 2)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_promised_ids_must_increase() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();
        conn.receive_frame(&push_promise(1, 4)).unwrap();

        let err = conn.receive_frame(&push_promise(1, 2)).unwrap_err();
        assert_eq!(err, Http2Error::connection(ErrorCode::ProtocolError));
    }

    // ---- queries ----

    #[test]
    fn test_window_queries() {
        let mut conn = active_client();
        assert_eq!(
            conn.connection_windows(),
            Windows {
                local: 65535,
                remote: 65535,
            }
        );
        assert_eq!(conn.stream_windows(StreamId::new(1)), None);

        conn.send_frame(&headers(1, false)).unwrap();
        conn.send_frame(&data(1, 10, false)).unwrap();
        assert_eq!(
            conn.stream_windows(StreamId::new(1)),
            Some(Windows {
                local: 65525,
                remote: 65535,
            })
        );
        assert_eq!(conn.connection_windows().local, 65525);
    }

    #[test]
    fn test_window_update_replenishes_credit() {
        let mut conn = active_client();
        conn.send_frame(&headers(1, false)).unwrap();
        conn.send_frame(&data(1, 100, false)).unwrap();

        let change = conn.receive_frame(&window_update(1, 100)).unwrap();
        assert_eq!(
            change,
            Some(ConnectionStateChange::FlowControlChange {
                local_connection_window: 65435,
                remote_connection_window: 65535,
                stream_window: Some(StreamWindowChange {
                    stream_id: StreamId::new(1),
                    local_window: 65535,
                    remote_window: 65535,
                }),
            })
        );

        conn.receive_frame(&window_update(0, 100)).unwrap();
        assert_eq!(conn.connection_windows().local, 65535);
    }

    // ---- determinism ----

    #[test]
    fn test_equal_frame_sequences_produce_equal_events() {
        let script: Vec<Frame> = vec![
            settings(vec![setting(SettingId::InitialWindowSize, 70000)]),
            headers(1, false),
            data(1, 42, false),
            window_update(0, 500),
            rst(1, ErrorCode::Cancel),
            goaway(0, ErrorCode::NoError),
        ];

        let run = || {
            let mut conn = active_server();
            let mut events = Vec::new();
            for frame in &script {
                events.push(conn.receive_frame(frame));
            }
            events
        };

        assert_eq!(run(), run());
    }
}

//! Connection settings values and the pending-settings queue.

use std::collections::VecDeque;

use crate::error::{ErrorCode, Http2Error};
use crate::frame::{
    DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, MAX_FRAME_SIZE_UPPER_BOUND,
    MAX_WINDOW_SIZE, Setting, SettingId,
};

/// One side's HTTP/2 settings.
///
/// Two instances live on each connection: the local settings (what we
/// advertise, applied once the peer acknowledges them) and the remote
/// settings (what the peer advertises, applied on receipt).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// HPACK header table size.
    pub header_table_size: u32,
    /// Whether server push is permitted.
    pub enable_push: bool,
    /// Maximum number of concurrent streams the peer may open.
    /// `u32::MAX` until a value is advertised (RFC leaves it unlimited).
    pub max_concurrent_streams: u32,
    /// Initial per-stream window size.
    pub initial_window_size: u32,
    /// Maximum frame size.
    pub max_frame_size: u32,
    /// Maximum header list size.
    pub max_header_list_size: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: u32::MAX,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: u32::MAX,
        }
    }
}

impl ConnectionSettings {
    /// Create settings with RFC 7540 defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the HPACK header table size.
    pub fn header_table_size(mut self, value: u32) -> Self {
        self.header_table_size = value;
        self
    }

    /// Enable or disable server push.
    pub fn enable_push(mut self, value: bool) -> Self {
        self.enable_push = value;
        self
    }

    /// Set the maximum number of concurrent streams.
    pub fn max_concurrent_streams(mut self, value: u32) -> Self {
        self.max_concurrent_streams = value;
        self
    }

    /// Set the initial per-stream window size.
    pub fn initial_window_size(mut self, value: u32) -> Self {
        self.initial_window_size = value;
        self
    }

    /// Set the maximum frame size.
    pub fn max_frame_size(mut self, value: u32) -> Self {
        self.max_frame_size = value;
        self
    }

    /// Set the maximum header list size.
    pub fn max_header_list_size(mut self, value: u32) -> Self {
        self.max_header_list_size = value;
        self
    }

    /// Store one received/acknowledged setting. The value must already
    /// have passed [`check_setting`]. Unknown identifiers are ignored.
    pub(crate) fn apply(&mut self, setting: &Setting) {
        match setting.id {
            SettingId::HeaderTableSize => self.header_table_size = setting.value,
            SettingId::EnablePush => self.enable_push = setting.value == 1,
            SettingId::MaxConcurrentStreams => self.max_concurrent_streams = setting.value,
            SettingId::InitialWindowSize => self.initial_window_size = setting.value,
            SettingId::MaxFrameSize => self.max_frame_size = setting.value,
            SettingId::MaxHeaderListSize => self.max_header_list_size = setting.value,
            SettingId::Unknown(_) => {}
        }
    }
}

/// Validate a single setting value (RFC 7540 Section 6.5.2).
pub(crate) fn check_setting(setting: &Setting) -> Result<(), Http2Error> {
    match setting.id {
        SettingId::EnablePush if setting.value > 1 => {
            Err(Http2Error::connection(ErrorCode::ProtocolError))
        }
        SettingId::InitialWindowSize if setting.value > MAX_WINDOW_SIZE => {
            Err(Http2Error::connection(ErrorCode::FlowControlError))
        }
        SettingId::MaxFrameSize
            if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE_UPPER_BOUND).contains(&setting.value) =>
        {
            Err(Http2Error::connection(ErrorCode::ProtocolError))
        }
        _ => Ok(()),
    }
}

/// Locally-sent SETTINGS awaiting the peer's ACK, applied in send order.
#[derive(Debug, Default)]
pub(crate) struct PendingLocalSettings {
    queue: VecDeque<Vec<Setting>>,
}

impl PendingLocalSettings {
    /// Record a SETTINGS frame we sent.
    pub(crate) fn push(&mut self, settings: Vec<Setting>) {
        self.queue.push_back(settings);
    }

    /// Take the oldest unacknowledged SETTINGS frame, if any.
    pub(crate) fn pop(&mut self) -> Option<Vec<Setting>> {
        self.queue.pop_front()
    }

    /// Put a popped batch back at the head, restoring the original order.
    /// Used when applying the batch turns out to be illegal.
    pub(crate) fn push_front(&mut self, settings: Vec<Setting>) {
        self.queue.push_front(settings);
    }
}

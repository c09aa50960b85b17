#![no_main]

use bytes::Bytes;
use http2_core::{
    ConnectionStateMachine, DataFrame, ErrorCode, Frame, GoAwayFrame, HeadersFrame, PingFrame,
    RstStreamFrame, Setting, SettingId, SettingsFrame, StreamId, WindowUpdateFrame,
};
use libfuzzer_sys::fuzz_target;

const MAX_WINDOW: i64 = (1 << 31) - 1;

/// Decode one 9-byte record into a frame and a direction (receive/send).
fn decode_step(chunk: &[u8]) -> (Frame, bool) {
    let op = chunk[0];
    let stream_id = u32::from_be_bytes([chunk[1] & 0x7f, chunk[2], chunk[3], chunk[4]]);
    let arg = u32::from_be_bytes([chunk[5], chunk[6], chunk[7], chunk[8]]);
    let receive = op & 0x80 == 0;

    let frame = match op & 0x7 {
        0 => Frame::Data(DataFrame {
            stream_id: StreamId::new(stream_id),
            end_stream: op & 0x8 != 0,
            pad_length: if op & 0x10 != 0 {
                Some(chunk[5])
            } else {
                None
            },
            data: Bytes::from(vec![0u8; (arg % 4096) as usize]),
        }),
        1 => Frame::Headers(HeadersFrame {
            stream_id: StreamId::new(stream_id),
            end_stream: op & 0x8 != 0,
            end_headers: true,
            priority: None,
            headers: Vec::new(),
        }),
        2 => Frame::RstStream(RstStreamFrame {
            stream_id: StreamId::new(stream_id),
            error_code: ErrorCode::from_u32(arg),
        }),
        3 => Frame::Settings(SettingsFrame {
            ack: op & 0x8 != 0,
            settings: vec![Setting {
                id: SettingId::from_u16((arg >> 16) as u16),
                value: arg & 0xffff,
            }],
        }),
        4 => Frame::Ping(PingFrame {
            ack: op & 0x8 != 0,
            data: [chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7], chunk[8]],
        }),
        5 => Frame::GoAway(GoAwayFrame {
            last_stream_id: StreamId::new(stream_id),
            error_code: ErrorCode::from_u32(arg & 0xf),
            debug_data: Bytes::new(),
        }),
        _ => Frame::WindowUpdate(WindowUpdateFrame {
            stream_id: StreamId::new(stream_id),
            increment: arg,
        }),
    };
    (frame, receive)
}

fuzz_target!(|data: &[u8]| {
    let mut conn = ConnectionStateMachine::server();

    // Run the preface so the interesting states are reachable.
    let empty = Frame::Settings(SettingsFrame {
        ack: false,
        settings: Vec::new(),
    });
    let ack = Frame::Settings(SettingsFrame::ack());
    let _ = conn.send_frame(&empty);
    let _ = conn.receive_frame(&empty);
    let _ = conn.send_frame(&ack);
    let _ = conn.receive_frame(&ack);

    for chunk in data.chunks_exact(9) {
        let (frame, receive) = decode_step(chunk);
        let result = if receive {
            conn.receive_frame(&frame)
        } else {
            conn.send_frame(&frame)
        };

        // Accepted or rejected, the machine must stay inside its
        // invariants.
        let windows = conn.connection_windows();
        assert!(windows.local <= MAX_WINDOW && windows.local >= -MAX_WINDOW);
        assert!(windows.remote <= MAX_WINDOW && windows.remote >= -MAX_WINDOW);

        if let Ok(Some(change)) = result {
            // Bulk closures report strictly increasing stream IDs.
            if let http2_core::ConnectionStateChange::BulkStreamClosure { closed_streams } = change
            {
                for pair in closed_streams.windows(2) {
                    assert!(pair[0] < pair[1]);
                }
            }
        }
    }
});

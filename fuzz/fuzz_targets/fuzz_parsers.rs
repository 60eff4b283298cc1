//! Fuzz target for every protocol handler.
//!
//! The first byte selects the protocol and direction; the rest is fed to
//! `parse_frame` until it stops making progress, with `find_frame_boundary`
//! used to skip invalid bytes. Queued frames are stitched at the end.
//!
//! Checks:
//! - No panics on arbitrary input
//! - `bytes_consumed` never exceeds the input
//! - Boundaries are at or after the requested start and inside the buffer

#![no_main]

use libfuzzer_sys::fuzz_target;
use wirestitch_core::stream::parsers::{
    Amqp, Cql, Dns, Http, Http2, Kafka, Mux, Mysql, Nats, Pgsql, Redis,
};
use wirestitch_core::stream::{FrameParseResult, MessageType, ProtocolHandler, ProtocolStream};

fn drive<P: ProtocolHandler>(message_type: MessageType, data: &[u8]) {
    let mut stream = ProtocolStream::<P>::new();
    let mut state = P::State::default();
    let mut pos = 0;

    while pos < data.len() {
        let buf = &data[pos..];
        match P::parse_frame(message_type, buf, &mut state) {
            FrameParseResult::Complete {
                frame,
                bytes_consumed,
            } => {
                assert!(bytes_consumed > 0 && bytes_consumed <= buf.len());
                stream.push(message_type, frame);
                pos += bytes_consumed;
            }
            FrameParseResult::NeedMore { .. } => break,
            FrameParseResult::Invalid { .. } => {
                match P::find_frame_boundary(message_type, buf, 1, &state) {
                    Some(boundary) => {
                        assert!(boundary >= 1 && boundary < buf.len());
                        pos += boundary;
                    }
                    None => break,
                }
            }
        }
    }

    let _ = stream.stitch();
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

    let message_type = if data[0] & 0x80 == 0 {
        MessageType::Request
    } else {
        MessageType::Response
    };
    let payload = &data[1..];

    match (data[0] & 0x7f) % 11 {
        0 => drive::<Pgsql>(message_type, payload),
        1 => drive::<Cql>(message_type, payload),
        2 => drive::<Amqp>(message_type, payload),
        3 => drive::<Nats>(message_type, payload),
        4 => drive::<Mysql>(message_type, payload),
        5 => drive::<Kafka>(message_type, payload),
        6 => drive::<Redis>(message_type, payload),
        7 => drive::<Dns>(message_type, payload),
        8 => drive::<Http>(message_type, payload),
        9 => drive::<Http2>(message_type, payload),
        _ => drive::<Mux>(message_type, payload),
    }
});

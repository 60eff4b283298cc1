//! Finagle mux.
//!
//! Frames are a signed 32-bit size, a signed message type and a 24-bit tag.
//! T-messages (positive types) are requests, R-messages (negative) replies;
//! either side may originate some control messages.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::trace;

use crate::stream::parser::scan_boundary;
use crate::stream::{
    Exchange, FrameBase, FrameParseResult, MessageType, Protocol, ProtocolHandler,
    RecordsWithErrorCount,
};

const PROTOCOL: &str = "mux";

const SIZE_LEN: usize = 4;
const MIN_FRAME_SIZE: i32 = 4;
const MAX_FRAME_SIZE: i32 = 16 * 1024 * 1024;

pub mod msg_type {
    pub const TREQ: i8 = 1;
    pub const RREQ: i8 = -1;
    pub const TDISPATCH: i8 = 2;
    pub const RDISPATCH: i8 = -2;
    pub const TDRAIN: i8 = 64;
    pub const RDRAIN: i8 = -64;
    pub const TPING: i8 = 65;
    pub const RPING: i8 = -65;
    pub const TDISCARDED: i8 = 66;
    pub const RDISCARDED: i8 = -66;
    pub const TLEASE: i8 = 67;
    pub const TINIT: i8 = 68;
    pub const RINIT: i8 = -68;
    pub const RERR: i8 = -128;
    /// Pre-standard encodings still seen on the wire.
    pub const RERR_OLD: i8 = 127;
    pub const TDISCARDED_OLD: i8 = -62;

    pub fn name(t: i8) -> &'static str {
        match t {
            TREQ => "Treq",
            RREQ => "Rreq",
            TDISPATCH => "Tdispatch",
            RDISPATCH => "Rdispatch",
            TDRAIN => "Tdrain",
            RDRAIN => "Rdrain",
            TPING => "Tping",
            RPING => "Rping",
            TDISCARDED | TDISCARDED_OLD => "Tdiscarded",
            RDISCARDED => "Rdiscarded",
            TLEASE => "Tlease",
            TINIT => "Tinit",
            RINIT => "Rinit",
            RERR | RERR_OLD => "Rerr",
            _ => "Unknown",
        }
    }

    pub fn is_known(t: i8) -> bool {
        name(t) != "Unknown"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub timestamp_ns: u64,
    pub msg_type: i8,
    pub tag: u32,
    pub body: Bytes,
    pub size: usize,
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        msg_type::name(self.msg_type)
    }

    fn is_rerr(&self) -> bool {
        matches!(self.msg_type, msg_type::RERR | msg_type::RERR_OLD)
    }

    /// R-message or Rerr, excluding the legacy Tdiscarded code.
    fn is_reply(&self) -> bool {
        self.is_rerr() || (self.msg_type < 0 && self.msg_type != msg_type::TDISCARDED_OLD)
    }
}

impl FrameBase for Message {
    fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    fn set_timestamp_ns(&mut self, timestamp_ns: u64) {
        self.timestamp_ns = timestamp_ns;
    }

    fn byte_size(&self) -> usize {
        self.size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub req: Message,
    pub resp: Message,
}

impl Exchange for Record {
    fn req_timestamp_ns(&self) -> Option<u64> {
        Some(self.req.timestamp_ns)
    }

    fn resp_timestamp_ns(&self) -> Option<u64> {
        Some(self.resp.timestamp_ns)
    }

    fn req_payload(&self) -> Bytes {
        self.req.body.clone()
    }

    fn resp_payload(&self) -> Bytes {
        self.resp.body.clone()
    }
}

/// Size, type and tag of the frame at the head of `buf`.
fn frame_header(buf: &[u8]) -> Option<(usize, i8, u32)> {
    let header = buf.get(..SIZE_LEN + 4)?;
    let size = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&size) {
        return None;
    }
    let t = header[4] as i8;
    if !msg_type::is_known(t) {
        return None;
    }
    let tag = u32::from_be_bytes([0, header[5], header[6], header[7]]);
    Some((SIZE_LEN + size as usize, t, tag))
}

/// Zero-sized handler for mux.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mux;

impl ProtocolHandler for Mux {
    const PROTOCOL: Protocol = Protocol::Mux;

    type Frame = Message;
    type Key = u32;
    type State = ();
    type Record = Record;

    fn parse_frame(
        _message_type: MessageType,
        buf: &[u8],
        _state: &mut (),
    ) -> FrameParseResult<Message> {
        if buf.len() < SIZE_LEN + 4 {
            return FrameParseResult::need(SIZE_LEN + 4);
        }
        let Some((total, msg_type, tag)) = frame_header(buf) else {
            return FrameParseResult::invalid("implausible frame header");
        };
        if buf.len() < total {
            return FrameParseResult::need(total);
        }
        FrameParseResult::Complete {
            frame: Message {
                timestamp_ns: 0,
                msg_type,
                tag,
                body: Bytes::copy_from_slice(&buf[SIZE_LEN + 4..total]),
                size: total,
            },
            bytes_consumed: total,
        }
    }

    fn find_frame_boundary(
        _message_type: MessageType,
        buf: &[u8],
        start_pos: usize,
        _state: &(),
    ) -> Option<usize> {
        scan_boundary(buf, start_pos, |candidate| match frame_header(candidate) {
            // The frame must fit; the next frame, when present, must also look valid
            Some((end, _, _)) if end <= candidate.len() => {
                candidate.len() - end < SIZE_LEN + 4 || frame_header(&candidate[end..]).is_some()
            }
            _ => false,
        })
    }

    fn stream_key(frame: &Message) -> u32 {
        frame.tag
    }

    fn stitch_frames(
        requests: &mut VecDeque<Message>,
        responses: &mut VecDeque<Message>,
        _state: &mut (),
    ) -> RecordsWithErrorCount<Record> {
        let mut result = RecordsWithErrorCount::new();

        while let Some(resp) = responses.pop_front() {
            // Server-initiated Tdrain, Tlease and Tping carry no reply for us
            if !resp.is_reply() {
                continue;
            }

            loop {
                // Client replies to server-initiated messages, and Tlease
                while requests
                    .front()
                    .is_some_and(|r| r.is_reply() || r.msg_type == msg_type::TLEASE)
                {
                    requests.pop_front();
                }

                let Some(req) = requests.front() else {
                    trace!(protocol = PROTOCOL, tag = resp.tag, "unmatched response dropped");
                    result.error_count += 1;
                    break;
                };
                if req.timestamp_ns > resp.timestamp_ns {
                    trace!(protocol = PROTOCOL, tag = resp.tag, "response precedes request");
                    result.error_count += 1;
                    break;
                }
                if resp.is_rerr() || resp.msg_type == req.msg_type.wrapping_neg() {
                    if let Some(req) = requests.pop_front() {
                        result.records.push(Record { req, resp });
                    }
                    break;
                }
                trace!(
                    protocol = PROTOCOL,
                    req_type = req.type_name(),
                    resp_type = resp.type_name(),
                    "mismatched reply type; request dropped"
                );
                requests.pop_front();
                result.error_count += 1;
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(t: i8, tag: u32, body: &[u8]) -> Vec<u8> {
        let mut out = ((body.len() + 4) as i32).to_be_bytes().to_vec();
        out.push(t as u8);
        out.extend_from_slice(&tag.to_be_bytes()[1..]);
        out.extend_from_slice(body);
        out
    }

    fn message(t: i8, tag: u32, ts: u64) -> Message {
        let data = frame_bytes(t, tag, b"");
        let (mut frame, _) = Mux::parse_frame(MessageType::Request, &data, &mut ())
            .into_frame()
            .unwrap();
        frame.timestamp_ns = ts;
        frame
    }

    #[test]
    fn test_parse_dispatch() {
        let data = frame_bytes(msg_type::TDISPATCH, 0x000102, b"\x00\x00payload");
        match Mux::parse_frame(MessageType::Request, &data, &mut ()) {
            FrameParseResult::Complete {
                frame,
                bytes_consumed,
            } => {
                assert_eq!(bytes_consumed, data.len());
                assert_eq!(frame.type_name(), "Tdispatch");
                assert_eq!(frame.tag, 0x102);
                assert_eq!(&frame.body[..], b"\x00\x00payload");
            }
            _ => panic!("Expected Complete"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let data = frame_bytes(99, 1, b"");
        let result = Mux::parse_frame(MessageType::Request, &data, &mut ());
        assert!(matches!(result, FrameParseResult::Invalid { .. }));

        let mut short = frame_bytes(msg_type::TREQ, 1, b"");
        short[3] = 2;
        let result = Mux::parse_frame(MessageType::Request, &short, &mut ());
        assert!(matches!(result, FrameParseResult::Invalid { .. }));
    }

    #[test]
    fn test_parse_need_more() {
        let data = frame_bytes(msg_type::RDISPATCH, 1, b"0123456789");
        match Mux::parse_frame(MessageType::Response, &data[..12], &mut ()) {
            FrameParseResult::NeedMore { minimum_bytes } => {
                assert_eq!(minimum_bytes, Some(data.len()))
            }
            _ => panic!("Expected NeedMore"),
        }
    }

    #[test]
    fn test_find_frame_boundary() {
        let mut data = vec![0xff, 0xee];
        data.extend(frame_bytes(msg_type::TPING, 3, b""));
        data.extend(frame_bytes(msg_type::TDISPATCH, 4, b"x"));
        assert_eq!(
            Mux::find_frame_boundary(MessageType::Request, &data, 0, &()),
            Some(2)
        );
    }

    #[test]
    fn test_find_frame_boundary_rejects_oversize_header() {
        let mut data = vec![0xff; 5];
        data.extend_from_slice(&1000i32.to_be_bytes());
        data.extend_from_slice(&[msg_type::TDISPATCH as u8, 0, 0, 1]);
        assert_eq!(
            Mux::find_frame_boundary(MessageType::Request, &data, 0, &()),
            None
        );
    }

    // Test 1: Matching reply types pair; Rerr answers anything
    #[test]
    fn test_stitch_pairs_by_type() {
        let mut reqs = VecDeque::from([
            message(msg_type::TDISPATCH, 1, 1),
            message(msg_type::TPING, 1, 3),
        ]);
        let mut resps = VecDeque::from([
            message(msg_type::RDISPATCH, 1, 2),
            message(msg_type::RERR, 1, 4),
        ]);

        let result = Mux::stitch_frames(&mut reqs, &mut resps, &mut ());

        assert_eq!(result.error_count, 0);
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[1].resp.type_name(), "Rerr");
    }

    // Test 2: Control traffic is ignored
    #[test]
    fn test_stitch_ignores_server_initiated() {
        let mut reqs = VecDeque::from([
            message(msg_type::RDRAIN, 7, 2),
            message(msg_type::TREQ, 7, 3),
        ]);
        let mut resps = VecDeque::from([
            message(msg_type::TDRAIN, 7, 1),
            message(msg_type::TLEASE, 7, 1),
            message(msg_type::RREQ, 7, 4),
        ]);

        let result = Mux::stitch_frames(&mut reqs, &mut resps, &mut ());

        assert_eq!(result.error_count, 0);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].req.type_name(), "Treq");
        assert!(reqs.is_empty());
    }

    // Test 3: A mismatched reply drops the request
    #[test]
    fn test_stitch_mismatched_type() {
        let mut reqs = VecDeque::from([
            message(msg_type::TPING, 2, 1),
            message(msg_type::TDISPATCH, 2, 2),
        ]);
        let mut resps = VecDeque::from([message(msg_type::RDISPATCH, 2, 3)]);

        let result = Mux::stitch_frames(&mut reqs, &mut resps, &mut ());

        assert_eq!(result.error_count, 1);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].req.type_name(), "Tdispatch");
    }

    #[test]
    fn test_stitch_orphan_reply() {
        let mut reqs = VecDeque::new();
        let mut resps = VecDeque::from([message(msg_type::RDISPATCH, 5, 1)]);

        let result = Mux::stitch_frames(&mut reqs, &mut resps, &mut ());

        assert!(result.records.is_empty());
        assert_eq!(result.error_count, 1);
    }
}

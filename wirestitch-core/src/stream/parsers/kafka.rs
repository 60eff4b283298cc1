//! Kafka wire protocol.
//!
//! Requests and responses are size-prefixed. Responses carry only the
//! correlation id, so the parser remembers the ids of recent requests to
//! recognise response headers when resynchronising.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::stream::decode::Decoder;
use crate::stream::parser::{scan_boundary, stitch_in_order};
use crate::stream::{
    Exchange, FrameBase, FrameParseResult, MessageType, Protocol, ProtocolHandler,
    RecordsWithErrorCount,
};

const PROTOCOL: &str = "kafka";

const LENGTH_LEN: usize = 4;
const MIN_REQUEST_LEN: usize = 10;
const MIN_RESPONSE_LEN: usize = 4;
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;
const MAX_API_KEY: i16 = 74;
const MAX_API_VERSION: i16 = 20;
const SEEN_IDS_CAPACITY: usize = 1024;

pub fn api_name(api_key: i16) -> &'static str {
    match api_key {
        0 => "Produce",
        1 => "Fetch",
        2 => "ListOffsets",
        3 => "Metadata",
        8 => "OffsetCommit",
        9 => "OffsetFetch",
        10 => "FindCoordinator",
        11 => "JoinGroup",
        12 => "Heartbeat",
        13 => "LeaveGroup",
        14 => "SyncGroup",
        15 => "DescribeGroups",
        16 => "ListGroups",
        17 => "SaslHandshake",
        18 => "ApiVersions",
        19 => "CreateTopics",
        20 => "DeleteTopics",
        22 => "InitProducerId",
        36 => "SaslAuthenticate",
        _ => "Unknown",
    }
}

/// Request header fields; absent on responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub client_id: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub timestamp_ns: u64,
    pub correlation_id: i32,
    pub header: Option<RequestHeader>,
    /// Message body following the header.
    pub body: Bytes,
    pub size: usize,
}

impl FrameBase for Packet {
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
    pub req: Packet,
    pub resp: Packet,
}

impl Record {
    pub fn api_key(&self) -> Option<i16> {
        self.req.header.as_ref().map(|h| h.api_key)
    }
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

/// Correlation ids of recently parsed requests, oldest first.
#[derive(Debug, Default)]
pub struct KafkaState {
    seen_correlation_ids: VecDeque<i32>,
}

impl KafkaState {
    fn remember(&mut self, correlation_id: i32) {
        if self.seen_correlation_ids.len() >= SEEN_IDS_CAPACITY {
            self.seen_correlation_ids.pop_front();
        }
        self.seen_correlation_ids.push_back(correlation_id);
    }

    pub fn has_seen(&self, correlation_id: i32) -> bool {
        self.seen_correlation_ids.contains(&correlation_id)
    }
}

fn message_len(buf: &[u8], min: usize) -> Option<usize> {
    let len = i32::from_be_bytes(buf.get(..LENGTH_LEN)?.try_into().ok()?);
    let len = usize::try_from(len).ok()?;
    (min..=MAX_MESSAGE_LEN).contains(&len).then_some(len)
}

/// Header fields at the head of a request, without the length prefix.
fn plausible_request_header(buf: &[u8]) -> Option<(i16, i16, i32)> {
    let mut dec = Decoder::new(PROTOCOL, buf);
    let api_key = dec.i16_be().ok()?;
    let api_version = dec.i16_be().ok()?;
    let correlation_id = dec.i32_be().ok()?;
    ((0..=MAX_API_KEY).contains(&api_key)
        && (0..=MAX_API_VERSION).contains(&api_version)
        && correlation_id >= 0)
        .then_some((api_key, api_version, correlation_id))
}

fn parse_request(buf: &[u8], size: usize) -> Result<Packet, &'static str> {
    let (api_key, api_version, correlation_id) =
        plausible_request_header(buf).ok_or("implausible request header")?;
    let mut dec = Decoder::new(PROTOCOL, buf);
    dec.skip(8).map_err(|_| "truncated request header")?;
    let client_id_len = dec.i16_be().map_err(|_| "truncated client id")?;
    let client_id = match client_id_len {
        -1 => None,
        n if n >= 0 => Some(Bytes::copy_from_slice(
            dec.bytes(n as usize).map_err(|_| "client id overruns message")?,
        )),
        _ => return Err("negative client id length"),
    };
    Ok(Packet {
        timestamp_ns: 0,
        correlation_id,
        header: Some(RequestHeader {
            api_key,
            api_version,
            client_id,
        }),
        body: Bytes::copy_from_slice(dec.rest()),
        size,
    })
}

/// Zero-sized handler for Kafka.
#[derive(Debug, Clone, Copy, Default)]
pub struct Kafka;

impl ProtocolHandler for Kafka {
    const PROTOCOL: Protocol = Protocol::Kafka;

    type Frame = Packet;
    type Key = i32;
    type State = KafkaState;
    type Record = Record;

    fn parse_frame(
        message_type: MessageType,
        buf: &[u8],
        state: &mut KafkaState,
    ) -> FrameParseResult<Packet> {
        if buf.len() < LENGTH_LEN {
            return FrameParseResult::need(LENGTH_LEN);
        }
        let min = match message_type {
            MessageType::Request => MIN_REQUEST_LEN,
            MessageType::Response => MIN_RESPONSE_LEN,
        };
        let Some(len) = message_len(buf, min) else {
            return FrameParseResult::invalid("implausible message length");
        };
        let total = LENGTH_LEN + len;
        if buf.len() < total {
            return FrameParseResult::need(total);
        }
        let message = &buf[LENGTH_LEN..total];

        match message_type {
            MessageType::Request => match parse_request(message, total) {
                Ok(packet) => {
                    state.remember(packet.correlation_id);
                    FrameParseResult::Complete {
                        frame: packet,
                        bytes_consumed: total,
                    }
                }
                Err(reason) => FrameParseResult::invalid(reason),
            },
            MessageType::Response => {
                let correlation_id =
                    i32::from_be_bytes([message[0], message[1], message[2], message[3]]);
                if correlation_id < 0 {
                    return FrameParseResult::invalid("negative correlation id");
                }
                FrameParseResult::Complete {
                    frame: Packet {
                        timestamp_ns: 0,
                        correlation_id,
                        header: None,
                        body: Bytes::copy_from_slice(&message[4..]),
                        size: total,
                    },
                    bytes_consumed: total,
                }
            }
        }
    }

    fn find_frame_boundary(
        message_type: MessageType,
        buf: &[u8],
        start_pos: usize,
        state: &KafkaState,
    ) -> Option<usize> {
        scan_boundary(buf, start_pos, |candidate| match message_type {
            MessageType::Request => {
                message_len(candidate, MIN_REQUEST_LEN)
                    .is_some_and(|len| LENGTH_LEN + len <= candidate.len())
                    && candidate
                        .get(LENGTH_LEN..)
                        .and_then(plausible_request_header)
                        .is_some()
            }
            // A response header is only recognisable by a known correlation id
            MessageType::Response => {
                message_len(candidate, MIN_RESPONSE_LEN)
                    .is_some_and(|len| LENGTH_LEN + len <= candidate.len())
                    && candidate
                        .get(LENGTH_LEN..LENGTH_LEN + 4)
                        .map(|id| i32::from_be_bytes([id[0], id[1], id[2], id[3]]))
                        .is_some_and(|id| state.has_seen(id))
            }
        })
    }

    fn stream_key(frame: &Packet) -> i32 {
        frame.correlation_id
    }

    fn stitch_frames(
        requests: &mut VecDeque<Packet>,
        responses: &mut VecDeque<Packet>,
        _state: &mut KafkaState,
    ) -> RecordsWithErrorCount<Record> {
        stitch_in_order(PROTOCOL, requests, responses, |req, resp| Record { req, resp })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_bytes(api_key: i16, version: i16, correlation_id: i32, body: &[u8]) -> Vec<u8> {
        let client_id = b"producer-1";
        let mut msg = Vec::new();
        msg.extend_from_slice(&api_key.to_be_bytes());
        msg.extend_from_slice(&version.to_be_bytes());
        msg.extend_from_slice(&correlation_id.to_be_bytes());
        msg.extend_from_slice(&(client_id.len() as i16).to_be_bytes());
        msg.extend_from_slice(client_id);
        msg.extend_from_slice(body);
        let mut out = (msg.len() as i32).to_be_bytes().to_vec();
        out.extend(msg);
        out
    }

    fn response_bytes(correlation_id: i32, body: &[u8]) -> Vec<u8> {
        let mut out = ((body.len() + 4) as i32).to_be_bytes().to_vec();
        out.extend_from_slice(&correlation_id.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn parse(message_type: MessageType, data: &[u8], state: &mut KafkaState) -> Packet {
        match Kafka::parse_frame(message_type, data, state) {
            FrameParseResult::Complete {
                frame,
                bytes_consumed,
            } => {
                assert_eq!(bytes_consumed, data.len());
                frame
            }
            _ => panic!("Expected Complete"),
        }
    }

    #[test]
    fn test_parse_request() {
        let data = request_bytes(3, 9, 42, b"\x00\x00\x00\x00");
        let mut state = KafkaState::default();
        let packet = parse(MessageType::Request, &data, &mut state);

        assert_eq!(packet.correlation_id, 42);
        let header = packet.header.unwrap();
        assert_eq!(api_name(header.api_key), "Metadata");
        assert_eq!(header.api_version, 9);
        assert_eq!(header.client_id, Some(Bytes::from_static(b"producer-1")));
        assert_eq!(&packet.body[..], b"\x00\x00\x00\x00");
        assert!(state.has_seen(42));
    }

    #[test]
    fn test_parse_null_client_id() {
        let mut data = Vec::new();
        data.extend_from_slice(&10i32.to_be_bytes());
        data.extend_from_slice(&[0, 18, 0, 3, 0, 0, 0, 7, 0xff, 0xff]);
        let mut state = KafkaState::default();
        let packet = parse(MessageType::Request, &data, &mut state);
        assert_eq!(packet.header.unwrap().client_id, None);
    }

    #[test]
    fn test_parse_invalid_api_key() {
        let data = request_bytes(999, 0, 1, b"");
        let mut state = KafkaState::default();
        let result = Kafka::parse_frame(MessageType::Request, &data, &mut state);
        assert!(matches!(result, FrameParseResult::Invalid { .. }));
        assert!(!state.has_seen(1));
    }

    #[test]
    fn test_parse_need_more() {
        let data = response_bytes(5, b"payload");
        let mut state = KafkaState::default();
        match Kafka::parse_frame(MessageType::Response, &data[..6], &mut state) {
            FrameParseResult::NeedMore { minimum_bytes } => {
                assert_eq!(minimum_bytes, Some(data.len()))
            }
            _ => panic!("Expected NeedMore"),
        }
    }

    #[test]
    fn test_response_boundary_uses_seen_ids() {
        let mut state = KafkaState::default();
        parse(MessageType::Request, &request_bytes(0, 7, 77, b""), &mut state);

        let mut data = vec![0x13, 0x37, 0x00];
        data.extend(response_bytes(77, b"ok"));
        assert_eq!(
            Kafka::find_frame_boundary(MessageType::Response, &data, 0, &state),
            Some(3)
        );

        let other = response_bytes(78, b"ok");
        assert_eq!(
            Kafka::find_frame_boundary(MessageType::Response, &other, 0, &state),
            None
        );
    }

    #[test]
    fn test_request_boundary_rejects_oversize_header() {
        let state = KafkaState::default();
        let mut data = vec![0xff; 5];
        data.extend_from_slice(&1000i32.to_be_bytes());
        data.extend_from_slice(&[0, 3, 0, 9, 0, 0, 0, 42]);
        assert_eq!(
            Kafka::find_frame_boundary(MessageType::Request, &data, 0, &state),
            None
        );

        data.truncate(5);
        data.extend(request_bytes(3, 9, 42, b""));
        assert_eq!(
            Kafka::find_frame_boundary(MessageType::Request, &data, 0, &state),
            Some(5)
        );
    }

    #[test]
    fn test_seen_ids_are_bounded() {
        let mut state = KafkaState::default();
        for id in 0..(SEEN_IDS_CAPACITY as i32 + 10) {
            state.remember(id);
        }
        assert!(!state.has_seen(0));
        assert!(state.has_seen(SEEN_IDS_CAPACITY as i32 + 9));
    }

    // Test 1: One request and one response per correlation id
    #[test]
    fn test_stitch_by_correlation_id() {
        let mut state = KafkaState::default();
        let mut req = parse(MessageType::Request, &request_bytes(1, 11, 9, b"fetch"), &mut state);
        let mut resp = parse(MessageType::Response, &response_bytes(9, b"records"), &mut state);
        req.timestamp_ns = 10;
        resp.timestamp_ns = 20;

        let mut reqs = VecDeque::from([req]);
        let mut resps = VecDeque::from([resp]);
        let result = Kafka::stitch_frames(&mut reqs, &mut resps, &mut state);

        assert_eq!(result.error_count, 0);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].api_key(), Some(1));
        assert_eq!(result.records[0].resp_payload(), Bytes::from_static(b"records"));
        assert_eq!(Kafka::stream_key(&result.records[0].req), 9);
    }
}

//! AMQP 0-9-1 framing.
//!
//! A logical message is a method frame plus, for content-bearing methods, a
//! content header and as many body frames as the header's `body_size` needs.
//! Frames of one channel share a queue, so assembly happens at stitch time.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::error::ProtocolError;
use crate::stream::decode::Decoder;
use crate::stream::parser::scan_boundary;
use crate::stream::{
    Exchange, FrameBase, FrameParseResult, MessageType, Protocol, ProtocolHandler,
    RecordsWithErrorCount,
};

const PROTOCOL: &str = "amqp";

pub const PROTOCOL_HEADER: &[u8] = b"AMQP\x00\x00\x09\x01";
const FRAME_HEADER_LEN: usize = 7;
const FRAME_END: u8 = 0xCE;
const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

pub mod frame_type {
    pub const METHOD: u8 = 1;
    pub const HEADER: u8 = 2;
    pub const BODY: u8 = 3;
    pub const HEARTBEAT: u8 = 8;
}

/// Class ids.
pub mod class {
    pub const CONNECTION: u16 = 10;
    pub const CHANNEL: u16 = 20;
    pub const EXCHANGE: u16 = 40;
    pub const QUEUE: u16 = 50;
    pub const BASIC: u16 = 60;
    pub const CONFIRM: u16 = 85;
    pub const TX: u16 = 90;
}

/// Synchronous client methods and the method ids that answer them.
const SYNC_METHODS: &[(u16, u16, &[u16])] = &[
    (class::CONNECTION, 40, &[41]),
    (class::CONNECTION, 50, &[51]),
    (class::CHANNEL, 10, &[11]),
    (class::CHANNEL, 20, &[21]),
    (class::CHANNEL, 40, &[41]),
    (class::EXCHANGE, 10, &[11]),
    (class::EXCHANGE, 20, &[21]),
    (class::EXCHANGE, 30, &[31]),
    (class::EXCHANGE, 40, &[51]),
    (class::QUEUE, 10, &[11]),
    (class::QUEUE, 20, &[21]),
    (class::QUEUE, 30, &[31]),
    (class::QUEUE, 40, &[41]),
    (class::QUEUE, 50, &[51]),
    (class::BASIC, 10, &[11]),
    (class::BASIC, 20, &[21]),
    (class::BASIC, 30, &[31]),
    (class::BASIC, 70, &[71, 72]),
    (class::BASIC, 110, &[111]),
    (class::CONFIRM, 10, &[11]),
    (class::TX, 10, &[11]),
    (class::TX, 20, &[21]),
    (class::TX, 30, &[31]),
];

fn expected_replies(class_id: u16, method_id: u16) -> Option<&'static [u16]> {
    SYNC_METHODS
        .iter()
        .find(|(c, m, _)| *c == class_id && *m == method_id)
        .map(|(_, _, replies)| *replies)
}

fn is_reply(class_id: u16, method_id: u16) -> bool {
    SYNC_METHODS
        .iter()
        .any(|(c, _, replies)| *c == class_id && replies.contains(&method_id))
}

fn has_content(class_id: u16, method_id: u16) -> bool {
    class_id == class::BASIC && matches!(method_id, 40 | 50 | 60 | 71)
}

pub fn method_name(class_id: u16, method_id: u16) -> &'static str {
    match (class_id, method_id) {
        (10, 10) => "Connection.Start",
        (10, 11) => "Connection.StartOk",
        (10, 20) => "Connection.Secure",
        (10, 21) => "Connection.SecureOk",
        (10, 30) => "Connection.Tune",
        (10, 31) => "Connection.TuneOk",
        (10, 40) => "Connection.Open",
        (10, 41) => "Connection.OpenOk",
        (10, 50) => "Connection.Close",
        (10, 51) => "Connection.CloseOk",
        (10, 60) => "Connection.Blocked",
        (10, 61) => "Connection.Unblocked",
        (20, 10) => "Channel.Open",
        (20, 11) => "Channel.OpenOk",
        (20, 20) => "Channel.Flow",
        (20, 21) => "Channel.FlowOk",
        (20, 40) => "Channel.Close",
        (20, 41) => "Channel.CloseOk",
        (40, 10) => "Exchange.Declare",
        (40, 11) => "Exchange.DeclareOk",
        (40, 20) => "Exchange.Delete",
        (40, 21) => "Exchange.DeleteOk",
        (40, 30) => "Exchange.Bind",
        (40, 31) => "Exchange.BindOk",
        (40, 40) => "Exchange.Unbind",
        (40, 51) => "Exchange.UnbindOk",
        (50, 10) => "Queue.Declare",
        (50, 11) => "Queue.DeclareOk",
        (50, 20) => "Queue.Bind",
        (50, 21) => "Queue.BindOk",
        (50, 30) => "Queue.Purge",
        (50, 31) => "Queue.PurgeOk",
        (50, 40) => "Queue.Delete",
        (50, 41) => "Queue.DeleteOk",
        (50, 50) => "Queue.Unbind",
        (50, 51) => "Queue.UnbindOk",
        (60, 10) => "Basic.Qos",
        (60, 11) => "Basic.QosOk",
        (60, 20) => "Basic.Consume",
        (60, 21) => "Basic.ConsumeOk",
        (60, 30) => "Basic.Cancel",
        (60, 31) => "Basic.CancelOk",
        (60, 40) => "Basic.Publish",
        (60, 50) => "Basic.Return",
        (60, 60) => "Basic.Deliver",
        (60, 70) => "Basic.Get",
        (60, 71) => "Basic.GetOk",
        (60, 72) => "Basic.GetEmpty",
        (60, 80) => "Basic.Ack",
        (60, 90) => "Basic.Reject",
        (60, 100) => "Basic.RecoverAsync",
        (60, 110) => "Basic.Recover",
        (60, 111) => "Basic.RecoverOk",
        (60, 120) => "Basic.Nack",
        (85, 10) => "Confirm.Select",
        (85, 11) => "Confirm.SelectOk",
        (90, 10) => "Tx.Select",
        (90, 11) => "Tx.SelectOk",
        (90, 20) => "Tx.Commit",
        (90, 21) => "Tx.CommitOk",
        (90, 30) => "Tx.Rollback",
        (90, 31) => "Tx.RollbackOk",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    ProtocolHeader,
    Method { class_id: u16, method_id: u16 },
    ContentHeader { class_id: u16, body_size: u64 },
    ContentBody,
    Heartbeat,
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub timestamp_ns: u64,
    pub channel: u16,
    pub kind: FrameKind,
    /// Method arguments or body bytes.
    pub payload: Bytes,
    pub size: usize,
}

impl FrameBase for Frame {
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

/// A method with its assembled content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub timestamp_ns: u64,
    pub channel: u16,
    pub class_id: u16,
    pub method_id: u16,
    pub args: Bytes,
    pub content: Bytes,
}

impl Message {
    pub fn name(&self) -> &'static str {
        method_name(self.class_id, self.method_id)
    }

    /// Method name, routing details where known, and the body.
    pub fn render(&self) -> Bytes {
        let mut out = BytesMut::from(self.name().as_bytes());
        if let Ok(details) = self.details() {
            if !details.is_empty() {
                out.extend_from_slice(b" ");
                out.extend_from_slice(details.as_bytes());
            }
        }
        if !self.content.is_empty() {
            out.extend_from_slice(b"\n");
            out.extend_from_slice(&self.content);
        }
        out.freeze()
    }

    fn details(&self) -> Result<String, ProtocolError> {
        let mut dec = Decoder::new(PROTOCOL, &self.args);
        let short_str = |dec: &mut Decoder<'_>| -> Result<String, ProtocolError> {
            let len = dec.u8()? as usize;
            Ok(String::from_utf8_lossy(dec.bytes(len)?).into_owned())
        };
        match (self.class_id, self.method_id) {
            (class::BASIC, 40) => {
                dec.skip(2)?;
                let exchange = short_str(&mut dec)?;
                let routing_key = short_str(&mut dec)?;
                Ok(format!("exchange={} routing_key={}", exchange, routing_key))
            }
            (class::BASIC, 60) => {
                let consumer_tag = short_str(&mut dec)?;
                let delivery_tag = dec.u64_be()?;
                dec.skip(1)?;
                let exchange = short_str(&mut dec)?;
                let routing_key = short_str(&mut dec)?;
                Ok(format!(
                    "consumer_tag={} delivery_tag={} exchange={} routing_key={}",
                    consumer_tag, delivery_tag, exchange, routing_key
                ))
            }
            (class::QUEUE, 10) | (class::QUEUE, 20) | (class::QUEUE, 40) => {
                dec.skip(2)?;
                Ok(format!("queue={}", short_str(&mut dec)?))
            }
            (class::EXCHANGE, 10) => {
                dec.skip(2)?;
                Ok(format!("exchange={}", short_str(&mut dec)?))
            }
            _ => Ok(String::new()),
        }
    }
}

/// Request-only, response-only or paired exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub req: Option<Message>,
    pub resp: Option<Message>,
}

impl Record {
    fn first_timestamp_ns(&self) -> u64 {
        self.req
            .as_ref()
            .or(self.resp.as_ref())
            .map_or(0, |m| m.timestamp_ns)
    }
}

impl Exchange for Record {
    fn req_timestamp_ns(&self) -> Option<u64> {
        self.req.as_ref().map(|m| m.timestamp_ns)
    }

    fn resp_timestamp_ns(&self) -> Option<u64> {
        self.resp.as_ref().map(|m| m.timestamp_ns)
    }

    fn req_payload(&self) -> Bytes {
        self.req.as_ref().map(Message::render).unwrap_or_default()
    }

    fn resp_payload(&self) -> Bytes {
        self.resp.as_ref().map(Message::render).unwrap_or_default()
    }
}

/// Validate a general frame header; returns the total frame size.
fn frame_size(buf: &[u8]) -> Result<usize, &'static str> {
    if !matches!(
        buf[0],
        frame_type::METHOD | frame_type::HEADER | frame_type::BODY | frame_type::HEARTBEAT
    ) {
        return Err("unknown frame type");
    }
    let size = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]) as usize;
    if size > MAX_FRAME_SIZE {
        return Err("frame size out of range");
    }
    Ok(FRAME_HEADER_LEN + size + 1)
}

fn decode_kind(frame_type: u8, payload: &[u8]) -> Result<(FrameKind, Bytes), ProtocolError> {
    let mut dec = Decoder::new(PROTOCOL, payload);
    match frame_type {
        frame_type::METHOD => {
            let class_id = dec.u16_be()?;
            let method_id = dec.u16_be()?;
            Ok((
                FrameKind::Method {
                    class_id,
                    method_id,
                },
                Bytes::copy_from_slice(dec.rest()),
            ))
        }
        frame_type::HEADER => {
            let class_id = dec.u16_be()?;
            let _weight = dec.u16_be()?;
            let body_size = dec.u64_be()?;
            Ok((
                FrameKind::ContentHeader {
                    class_id,
                    body_size,
                },
                Bytes::new(),
            ))
        }
        frame_type::BODY => Ok((FrameKind::ContentBody, Bytes::copy_from_slice(payload))),
        _ => Ok((FrameKind::Heartbeat, Bytes::new())),
    }
}

/// Frames `[start, start + len)` of a queue, and what they assemble to.
#[derive(Debug)]
struct Span {
    start: usize,
    len: usize,
    item: SpanItem,
}

#[derive(Debug)]
enum SpanItem {
    Message(Message),
    /// Heartbeats and the protocol header.
    Noise,
    /// Content frames without a leading method.
    Orphan,
}

/// Split a queue into complete messages, stopping at the first incomplete one.
fn spans(queue: &VecDeque<Frame>) -> Vec<Span> {
    let mut out = Vec::new();
    let mut i = 0;
    while let Some(frame) = queue.get(i) {
        let (class_id, method_id) = match frame.kind {
            FrameKind::Method {
                class_id,
                method_id,
            } => (class_id, method_id),
            FrameKind::ProtocolHeader | FrameKind::Heartbeat => {
                out.push(Span {
                    start: i,
                    len: 1,
                    item: SpanItem::Noise,
                });
                i += 1;
                continue;
            }
            FrameKind::ContentHeader { .. } | FrameKind::ContentBody => {
                out.push(Span {
                    start: i,
                    len: 1,
                    item: SpanItem::Orphan,
                });
                i += 1;
                continue;
            }
        };

        let mut len = 1;
        let mut content = BytesMut::new();
        if has_content(class_id, method_id) {
            match queue.get(i + 1).map(|f| f.kind) {
                // Content header not captured yet
                None => break,
                Some(FrameKind::ContentHeader { body_size, .. }) => {
                    len += 1;
                    while (content.len() as u64) < body_size {
                        match queue.get(i + len) {
                            Some(f) if f.kind == FrameKind::ContentBody => {
                                content.extend_from_slice(&f.payload);
                                len += 1;
                            }
                            // Truncated content, keep what arrived
                            Some(_) => break,
                            None => return out,
                        }
                    }
                }
                // Content header lost
                Some(_) => {}
            }
        }

        out.push(Span {
            start: i,
            len,
            item: SpanItem::Message(Message {
                timestamp_ns: frame.timestamp_ns,
                channel: frame.channel,
                class_id,
                method_id,
                args: frame.payload.clone(),
                content: content.freeze(),
            }),
        });
        i += len;
    }
    out
}

fn remove_used<F>(queue: &mut VecDeque<F>, used: &[bool]) {
    let mut idx = 0;
    queue.retain(|_| {
        let keep = !used.get(idx).copied().unwrap_or(false);
        idx += 1;
        keep
    });
}

fn mark(used: &mut [bool], span: &Span) {
    for flag in &mut used[span.start..span.start + span.len] {
        *flag = true;
    }
}

/// Zero-sized handler for AMQP.
#[derive(Debug, Clone, Copy, Default)]
pub struct Amqp;

impl ProtocolHandler for Amqp {
    const PROTOCOL: Protocol = Protocol::Amqp;

    type Frame = Frame;
    type Key = u16;
    type State = ();
    type Record = Record;

    fn parse_frame(
        _message_type: MessageType,
        buf: &[u8],
        _state: &mut (),
    ) -> FrameParseResult<Frame> {
        if buf.first() == Some(&b'A') {
            let n = buf.len().min(PROTOCOL_HEADER.len());
            if buf[..n] != PROTOCOL_HEADER[..n] {
                return FrameParseResult::invalid("bad protocol header");
            }
            if n < PROTOCOL_HEADER.len() {
                return FrameParseResult::need(PROTOCOL_HEADER.len());
            }
            return FrameParseResult::Complete {
                frame: Frame {
                    timestamp_ns: 0,
                    channel: 0,
                    kind: FrameKind::ProtocolHeader,
                    payload: Bytes::new(),
                    size: PROTOCOL_HEADER.len(),
                },
                bytes_consumed: PROTOCOL_HEADER.len(),
            };
        }

        if buf.len() < FRAME_HEADER_LEN {
            return FrameParseResult::need(FRAME_HEADER_LEN);
        }
        let total = match frame_size(buf) {
            Ok(total) => total,
            Err(reason) => return FrameParseResult::invalid(reason),
        };
        if buf.len() < total {
            return FrameParseResult::need(total);
        }
        if buf[total - 1] != FRAME_END {
            return FrameParseResult::invalid("missing frame end marker");
        }
        let Ok((kind, payload)) = decode_kind(buf[0], &buf[FRAME_HEADER_LEN..total - 1]) else {
            return FrameParseResult::invalid("truncated frame payload");
        };
        FrameParseResult::Complete {
            frame: Frame {
                timestamp_ns: 0,
                channel: u16::from_be_bytes([buf[1], buf[2]]),
                kind,
                payload,
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
        scan_boundary(buf, start_pos, |candidate| {
            if candidate.starts_with(PROTOCOL_HEADER) {
                return true;
            }
            candidate.len() >= FRAME_HEADER_LEN
                && frame_size(candidate).is_ok_and(|total| {
                    total <= candidate.len() && candidate[total - 1] == FRAME_END
                })
        })
    }

    fn stream_key(frame: &Frame) -> u16 {
        frame.channel
    }

    fn stitch_frames(
        requests: &mut VecDeque<Frame>,
        responses: &mut VecDeque<Frame>,
        _state: &mut (),
    ) -> RecordsWithErrorCount<Record> {
        let mut result = RecordsWithErrorCount::new();
        let req_spans = spans(requests);
        let resp_spans = spans(responses);
        let mut req_used = vec![false; requests.len()];
        let mut resp_used = vec![false; responses.len()];

        // Synchronous requests waiting for their reply, oldest first
        let mut waiting: Vec<(&Span, &Message)> = Vec::new();
        for span in &req_spans {
            match &span.item {
                SpanItem::Message(msg)
                    if expected_replies(msg.class_id, msg.method_id).is_some() =>
                {
                    waiting.push((span, msg));
                }
                SpanItem::Message(msg) => {
                    mark(&mut req_used, span);
                    result.records.push(Record {
                        req: Some(msg.clone()),
                        resp: None,
                    });
                }
                SpanItem::Noise => mark(&mut req_used, span),
                SpanItem::Orphan => {
                    mark(&mut req_used, span);
                    result.error_count += 1;
                }
            }
        }

        for span in &resp_spans {
            let resp = match &span.item {
                SpanItem::Message(msg) => msg,
                SpanItem::Noise => {
                    mark(&mut resp_used, span);
                    continue;
                }
                SpanItem::Orphan => {
                    mark(&mut resp_used, span);
                    result.error_count += 1;
                    continue;
                }
            };
            mark(&mut resp_used, span);

            if !is_reply(resp.class_id, resp.method_id) {
                result.records.push(Record {
                    req: None,
                    resp: Some(resp.clone()),
                });
                continue;
            }

            let matched = waiting.iter().position(|(_, req)| {
                req.class_id == resp.class_id
                    && req.timestamp_ns <= resp.timestamp_ns
                    && expected_replies(req.class_id, req.method_id)
                        .is_some_and(|replies| replies.contains(&resp.method_id))
            });
            let Some(idx) = matched else {
                trace!(method = resp.name(), "reply without a pending request");
                result.error_count += 1;
                continue;
            };

            // Earlier unanswered requests were sent with no-wait
            for (i, (req_span, req)) in waiting.drain(..=idx).enumerate() {
                mark(&mut req_used, req_span);
                result.records.push(Record {
                    req: Some(req.clone()),
                    resp: (i == idx).then(|| resp.clone()),
                });
            }
        }

        remove_used(requests, &req_used);
        remove_used(responses, &resp_used);
        result.records.sort_by_key(Record::first_timestamp_ns);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(ty: u8, channel: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![ty];
        out.extend_from_slice(&channel.to_be_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out.push(FRAME_END);
        out
    }

    fn method(channel: u16, class_id: u16, method_id: u16, args: &[u8]) -> Vec<u8> {
        let mut payload = class_id.to_be_bytes().to_vec();
        payload.extend_from_slice(&method_id.to_be_bytes());
        payload.extend_from_slice(args);
        frame_bytes(frame_type::METHOD, channel, &payload)
    }

    fn content_header(channel: u16, body_size: u64) -> Vec<u8> {
        let mut payload = class::BASIC.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0, 0]);
        payload.extend_from_slice(&body_size.to_be_bytes());
        payload.extend_from_slice(&[0, 0]);
        frame_bytes(frame_type::HEADER, channel, &payload)
    }

    fn publish_args(exchange: &str, routing_key: &str) -> Vec<u8> {
        let mut args = vec![0, 0, exchange.len() as u8];
        args.extend_from_slice(exchange.as_bytes());
        args.push(routing_key.len() as u8);
        args.extend_from_slice(routing_key.as_bytes());
        args.push(0);
        args
    }

    fn parse_all(message_type: MessageType, mut data: &[u8], ts: u64) -> VecDeque<Frame> {
        let mut out = VecDeque::new();
        while !data.is_empty() {
            match Amqp::parse_frame(message_type, data, &mut ()) {
                FrameParseResult::Complete {
                    mut frame,
                    bytes_consumed,
                } => {
                    frame.timestamp_ns = ts;
                    out.push_back(frame);
                    data = &data[bytes_consumed..];
                }
                _ => panic!("Expected Complete"),
            }
        }
        out
    }

    #[test]
    fn test_parse_protocol_header_and_method() {
        let mut data = PROTOCOL_HEADER.to_vec();
        data.extend(method(0, class::CONNECTION, 11, b"\x00"));
        let frames = parse_all(MessageType::Request, &data, 0);

        assert_eq!(frames[0].kind, FrameKind::ProtocolHeader);
        assert_eq!(
            frames[1].kind,
            FrameKind::Method {
                class_id: class::CONNECTION,
                method_id: 11
            }
        );
        assert_eq!(frames[1].size, 13);
    }

    #[test]
    fn test_parse_partial_protocol_header() {
        match Amqp::parse_frame(MessageType::Request, b"AMQ", &mut ()) {
            FrameParseResult::NeedMore { minimum_bytes } => assert_eq!(minimum_bytes, Some(8)),
            _ => panic!("Expected NeedMore"),
        }
    }

    #[test]
    fn test_parse_missing_frame_end() {
        let mut data = method(1, class::CHANNEL, 10, b"\x00");
        let last = data.len() - 1;
        data[last] = 0x00;
        let result = Amqp::parse_frame(MessageType::Request, &data, &mut ());
        assert!(matches!(result, FrameParseResult::Invalid { .. }));
    }

    #[test]
    fn test_find_frame_boundary() {
        let mut data = vec![0x01, 0x00, 0x05, 0xff, 0xff];
        data.extend(method(1, class::CHANNEL, 11, b"\x00\x00\x00\x00"));
        assert_eq!(
            Amqp::find_frame_boundary(MessageType::Response, &data, 0, &()),
            Some(5)
        );
    }

    #[test]
    fn test_stitch_sync_async_and_push() {
        let mut req_bytes = PROTOCOL_HEADER.to_vec();
        req_bytes.extend(method(1, class::CHANNEL, 10, b"\x00"));
        req_bytes.extend(method(1, class::BASIC, 40, &publish_args("", "jobs")));
        req_bytes.extend(content_header(1, 5));
        req_bytes.extend(frame_bytes(frame_type::BODY, 1, b"hel"));
        req_bytes.extend(frame_bytes(frame_type::BODY, 1, b"lo"));
        let mut reqs = parse_all(MessageType::Request, &req_bytes, 1);

        let mut resp_bytes = method(1, class::CHANNEL, 11, b"\x00\x00\x00\x00");
        resp_bytes.extend(frame_bytes(frame_type::HEARTBEAT, 0, b""));
        let mut resps = parse_all(MessageType::Response, &resp_bytes, 2);

        let result = Amqp::stitch_frames(&mut reqs, &mut resps, &mut ());

        assert_eq!(result.error_count, 0);
        assert_eq!(result.records.len(), 2);
        let open = result
            .records
            .iter()
            .find(|r| r.resp.is_some())
            .unwrap();
        assert_eq!(open.req.as_ref().unwrap().name(), "Channel.Open");
        assert_eq!(open.resp.as_ref().unwrap().name(), "Channel.OpenOk");

        let publish = result.records.iter().find(|r| r.resp.is_none()).unwrap();
        assert_eq!(
            publish.req_payload(),
            Bytes::from("Basic.Publish exchange= routing_key=jobs\nhello")
        );
        assert!(reqs.is_empty());
        assert!(resps.is_empty());
    }

    #[test]
    fn test_stitch_server_push() {
        let mut args = vec![3];
        args.extend_from_slice(b"ctg");
        args.extend_from_slice(&7u64.to_be_bytes());
        args.push(0);
        args.extend_from_slice(b"\x00\x04jobs");
        let mut resp_bytes = method(1, class::BASIC, 60, &args);
        resp_bytes.extend(content_header(1, 2));
        resp_bytes.extend(frame_bytes(frame_type::BODY, 1, b"hi"));
        let mut resps = parse_all(MessageType::Response, &resp_bytes, 5);
        let mut reqs = VecDeque::new();

        let result = Amqp::stitch_frames(&mut reqs, &mut resps, &mut ());

        assert_eq!(result.error_count, 0);
        assert_eq!(result.records.len(), 1);
        assert!(result.records[0].req.is_none());
        assert_eq!(
            result.records[0].resp_payload(),
            Bytes::from("Basic.Deliver consumer_tag=ctg delivery_tag=7 exchange= routing_key=jobs\nhi")
        );
    }

    #[test]
    fn test_stitch_unmatched_reply() {
        let mut reqs = VecDeque::new();
        let mut resps = parse_all(
            MessageType::Response,
            &method(1, class::QUEUE, 11, b"\x00"),
            1,
        );

        let result = Amqp::stitch_frames(&mut reqs, &mut resps, &mut ());

        assert!(result.records.is_empty());
        assert_eq!(result.error_count, 1);
        assert!(resps.is_empty());
    }

    #[test]
    fn test_stitch_incomplete_content_waits() {
        let mut req_bytes = method(1, class::BASIC, 40, &publish_args("", "q"));
        req_bytes.extend(content_header(1, 10));
        req_bytes.extend(frame_bytes(frame_type::BODY, 1, b"12345"));
        let mut reqs = parse_all(MessageType::Request, &req_bytes, 1);
        let mut resps = VecDeque::new();

        let result = Amqp::stitch_frames(&mut reqs, &mut resps, &mut ());
        assert!(result.records.is_empty());
        assert_eq!(reqs.len(), 3);

        reqs.extend(parse_all(
            MessageType::Request,
            &frame_bytes(frame_type::BODY, 1, b"67890"),
            2,
        ));
        let result = Amqp::stitch_frames(&mut reqs, &mut resps, &mut ());
        assert_eq!(result.records.len(), 1);
        assert!(result.records[0].req_payload().ends_with(b"1234567890"));
        assert!(reqs.is_empty());
    }

    #[test]
    fn test_stitch_nowait_request() {
        let mut req_bytes = method(1, class::QUEUE, 10, b"\x00\x00\x01a\x10");
        req_bytes.extend(method(1, class::QUEUE, 20, b"\x00\x00\x01a"));
        let mut reqs = parse_all(MessageType::Request, &req_bytes, 1);
        let mut resps = parse_all(MessageType::Response, &method(1, class::QUEUE, 21, b""), 2);

        let result = Amqp::stitch_frames(&mut reqs, &mut resps, &mut ());

        assert_eq!(result.error_count, 0);
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[0].req.as_ref().unwrap().name(), "Queue.Declare");
        assert!(result.records[0].resp.is_none());
        assert_eq!(result.records[1].resp.as_ref().unwrap().name(), "Queue.BindOk");
        assert!(reqs.is_empty());
    }
}

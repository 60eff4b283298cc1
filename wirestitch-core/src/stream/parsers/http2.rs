//! HTTP/2 frame parser with HPACK header decompression.
//!
//! Each direction keeps its own HPACK decoder in the parser state, so header
//! blocks must be parsed in wire order. Header blocks split across
//! CONTINUATION frames are reassembled before decoding.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use compact_str::CompactString;
use hpack::Decoder as HpackDecoder;
use tracing::{debug, trace};

use crate::stream::parser::scan_boundary;
use crate::stream::{
    Exchange, FrameBase, FrameParseResult, MessageType, Protocol, ProtocolHandler,
    RecordsWithErrorCount,
};

const PROTOCOL: &str = "http2";

/// HTTP/2 connection preface: "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// SETTINGS_MAX_FRAME_SIZE before the peers negotiate.
const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Largest header block buffered across CONTINUATION frames.
const MAX_HEADER_BLOCK: usize = 1024 * 1024;

/// HTTP/2 frame types (RFC 7540 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => FrameType::Data,
            0x1 => FrameType::Headers,
            0x2 => FrameType::Priority,
            0x3 => FrameType::RstStream,
            0x4 => FrameType::Settings,
            0x5 => FrameType::PushPromise,
            0x6 => FrameType::Ping,
            0x7 => FrameType::GoAway,
            0x8 => FrameType::WindowUpdate,
            0x9 => FrameType::Continuation,
            other => FrameType::Unknown(other),
        }
    }
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::GoAway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
            FrameType::Unknown(_) => "UNKNOWN",
        }
    }
}

/// HTTP/2 frame flags
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// HTTP/2 error codes (RFC 7540 Section 7)
pub mod error_codes {
    pub const NO_ERROR: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const INTERNAL_ERROR: u32 = 0x2;
    pub const FLOW_CONTROL_ERROR: u32 = 0x3;
    pub const SETTINGS_TIMEOUT: u32 = 0x4;
    pub const STREAM_CLOSED: u32 = 0x5;
    pub const FRAME_SIZE_ERROR: u32 = 0x6;
    pub const REFUSED_STREAM: u32 = 0x7;
    pub const CANCEL: u32 = 0x8;
    pub const COMPRESSION_ERROR: u32 = 0x9;
    pub const CONNECT_ERROR: u32 = 0xa;
    pub const ENHANCE_YOUR_CALM: u32 = 0xb;
    pub const INADEQUATE_SECURITY: u32 = 0xc;
    pub const HTTP_1_1_REQUIRED: u32 = 0xd;

    pub fn name(code: u32) -> &'static str {
        match code {
            NO_ERROR => "NO_ERROR",
            PROTOCOL_ERROR => "PROTOCOL_ERROR",
            INTERNAL_ERROR => "INTERNAL_ERROR",
            FLOW_CONTROL_ERROR => "FLOW_CONTROL_ERROR",
            SETTINGS_TIMEOUT => "SETTINGS_TIMEOUT",
            STREAM_CLOSED => "STREAM_CLOSED",
            FRAME_SIZE_ERROR => "FRAME_SIZE_ERROR",
            REFUSED_STREAM => "REFUSED_STREAM",
            CANCEL => "CANCEL",
            COMPRESSION_ERROR => "COMPRESSION_ERROR",
            CONNECT_ERROR => "CONNECT_ERROR",
            ENHANCE_YOUR_CALM => "ENHANCE_YOUR_CALM",
            INADEQUATE_SECURITY => "INADEQUATE_SECURITY",
            HTTP_1_1_REQUIRED => "HTTP_1_1_REQUIRED",
            _ => "UNKNOWN",
        }
    }
}

/// HTTP/2 frame header (9 bytes)
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 9;

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }

        let length = ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | (data[2] as u32);
        let frame_type = FrameType::from(data[3]);
        let flags = data[4];
        let stream_id = ((data[5] as u32 & 0x7F) << 24)
            | ((data[6] as u32) << 16)
            | ((data[7] as u32) << 8)
            | (data[8] as u32);

        Some(FrameHeader {
            length,
            frame_type,
            flags,
            stream_id,
        })
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags & flags::END_STREAM != 0
    }

    pub fn is_end_headers(&self) -> bool {
        self.flags & flags::END_HEADERS != 0
    }

    pub fn is_padded(&self) -> bool {
        self.flags & flags::PADDED != 0
    }

    pub fn is_priority(&self) -> bool {
        self.flags & flags::PRIORITY != 0
    }

    pub fn frame_len(&self) -> usize {
        Self::SIZE + self.length as usize
    }

    /// Stream and length rules from RFC 7540 Section 6.
    fn validate(&self) -> Result<(), &'static str> {
        let len = self.length as usize;
        let on_stream = self.stream_id != 0;
        match self.frame_type {
            FrameType::Unknown(_) => Err("unknown frame type"),
            FrameType::Data
            | FrameType::Headers
            | FrameType::Priority
            | FrameType::RstStream
            | FrameType::PushPromise
            | FrameType::Continuation
                if !on_stream =>
            {
                Err("stream frame on stream 0")
            }
            FrameType::Settings | FrameType::Ping | FrameType::GoAway if on_stream => {
                Err("connection frame on a stream")
            }
            FrameType::Settings if len % 6 != 0 => Err("bad SETTINGS length"),
            FrameType::Ping if len != 8 => Err("bad PING length"),
            FrameType::RstStream | FrameType::WindowUpdate if len != 4 => Err("bad frame length"),
            FrameType::Priority if len != 5 => Err("bad PRIORITY length"),
            FrameType::GoAway if len < 8 => Err("bad GOAWAY length"),
            _ => Ok(()),
        }
    }
}

pub type HeaderList = Vec<(CompactString, CompactString)>;

/// What a frame contributes to its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Preface,
    /// A complete, decoded header block.
    Headers { headers: HeaderList, end_stream: bool },
    Data { data: Bytes, end_stream: bool },
    RstStream { error_code: u32 },
    /// Connection and flow-control frames, header fragments, push promises.
    Control,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub timestamp_ns: u64,
    pub stream_id: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub body: FrameBody,
    pub size: usize,
}

impl Frame {
    fn ends_half(&self) -> bool {
        match &self.body {
            FrameBody::Headers { end_stream, .. } | FrameBody::Data { end_stream, .. } => {
                *end_stream
            }
            FrameBody::RstStream { .. } => true,
            FrameBody::Preface | FrameBody::Control => false,
        }
    }

    fn contributes(&self) -> bool {
        !matches!(self.body, FrameBody::Preface | FrameBody::Control)
    }
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

/// One direction of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HalfStream {
    pub timestamp_ns: u64,
    /// Header blocks in order, trailers included.
    pub headers: HeaderList,
    pub body: Bytes,
    /// Error code when the half ended with RST_STREAM.
    pub reset: Option<u32>,
}

impl HalfStream {
    fn collect(frames: impl Iterator<Item = Frame>) -> Self {
        let mut half = HalfStream::default();
        let mut body = BytesMut::new();
        for (i, frame) in frames.enumerate() {
            if i == 0 {
                half.timestamp_ns = frame.timestamp_ns;
            }
            match frame.body {
                FrameBody::Headers { headers, .. } => half.headers.extend(headers),
                FrameBody::Data { data, .. } => body.extend_from_slice(&data),
                FrameBody::RstStream { error_code } => half.reset = Some(error_code),
                FrameBody::Preface | FrameBody::Control => {}
            }
        }
        half.body = body.freeze();
        half
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn render(&self) -> Bytes {
        let mut out = BytesMut::new();
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\n");
        }
        if let Some(code) = self.reset {
            out.extend_from_slice(b"RST_STREAM: ");
            out.extend_from_slice(error_codes::name(code).as_bytes());
            out.extend_from_slice(b"\n");
        }
        if !self.body.is_empty() {
            out.extend_from_slice(b"\n");
            out.extend_from_slice(&self.body);
        }
        out.freeze()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub stream_id: u32,
    pub req: HalfStream,
    pub resp: HalfStream,
}

impl Exchange for Record {
    fn req_timestamp_ns(&self) -> Option<u64> {
        Some(self.req.timestamp_ns)
    }

    fn resp_timestamp_ns(&self) -> Option<u64> {
        Some(self.resp.timestamp_ns)
    }

    fn req_payload(&self) -> Bytes {
        self.req.render()
    }

    fn resp_payload(&self) -> Bytes {
        self.resp.render()
    }
}

/// Header block awaiting CONTINUATION frames.
struct PendingBlock {
    stream_id: u32,
    block: Vec<u8>,
    end_stream: bool,
    /// PUSH_PROMISE blocks are decoded only to keep the HPACK table in sync.
    promise: bool,
}

/// Per-connection HPACK and CONTINUATION state, one slot per direction.
pub struct Http2State {
    client_decoder: HpackDecoder<'static>,
    server_decoder: HpackDecoder<'static>,
    client_pending: Option<PendingBlock>,
    server_pending: Option<PendingBlock>,
}

impl Default for Http2State {
    fn default() -> Self {
        Self {
            client_decoder: HpackDecoder::new(),
            server_decoder: HpackDecoder::new(),
            client_pending: None,
            server_pending: None,
        }
    }
}

impl Http2State {
    fn pending(&mut self, message_type: MessageType) -> &mut Option<PendingBlock> {
        match message_type {
            MessageType::Request => &mut self.client_pending,
            MessageType::Response => &mut self.server_pending,
        }
    }

    fn pending_stream(&self, message_type: MessageType) -> Option<u32> {
        match message_type {
            MessageType::Request => self.client_pending.as_ref(),
            MessageType::Response => self.server_pending.as_ref(),
        }
        .map(|p| p.stream_id)
    }

    fn decode(&mut self, message_type: MessageType, block: &[u8]) -> HeaderList {
        let decoder = match message_type {
            MessageType::Request => &mut self.client_decoder,
            MessageType::Response => &mut self.server_decoder,
        };
        match decoder.decode(block) {
            Ok(headers) => headers
                .into_iter()
                .map(|(name, value)| {
                    (
                        CompactString::from(String::from_utf8_lossy(&name)),
                        CompactString::from(String::from_utf8_lossy(&value)),
                    )
                })
                .collect(),
            Err(err) => {
                debug!(?err, direction = message_type.as_str(), "HPACK decoding failed");
                HeaderList::new()
            }
        }
    }
}

fn strip_padding<'a>(
    header: &FrameHeader,
    payload: &'a [u8],
) -> Result<&'a [u8], &'static str> {
    if !header.is_padded() {
        return Ok(payload);
    }
    let (&pad_len, rest) = payload.split_first().ok_or("missing pad length")?;
    rest.len()
        .checked_sub(pad_len as usize)
        .map(|end| &rest[..end])
        .ok_or("padding exceeds payload")
}

/// Header block fragment of a HEADERS frame, without padding or priority.
fn headers_fragment<'a>(
    header: &FrameHeader,
    payload: &'a [u8],
) -> Result<&'a [u8], &'static str> {
    let unpadded = strip_padding(header, payload)?;
    if header.is_priority() {
        unpadded.get(5..).ok_or("truncated priority fields")
    } else {
        Ok(unpadded)
    }
}

/// Interpret a complete frame; `state` is only touched once nothing can fail.
fn frame_body(
    message_type: MessageType,
    header: &FrameHeader,
    payload: &[u8],
    state: &mut Http2State,
) -> Result<FrameBody, &'static str> {
    let body = match header.frame_type {
        FrameType::Data => FrameBody::Data {
            data: Bytes::copy_from_slice(strip_padding(header, payload)?),
            end_stream: header.is_end_stream(),
        },
        FrameType::Headers => {
            let fragment = headers_fragment(header, payload)?;
            if header.is_end_headers() {
                FrameBody::Headers {
                    headers: state.decode(message_type, fragment),
                    end_stream: header.is_end_stream(),
                }
            } else {
                *state.pending(message_type) = Some(PendingBlock {
                    stream_id: header.stream_id,
                    block: fragment.to_vec(),
                    end_stream: header.is_end_stream(),
                    promise: false,
                });
                FrameBody::Control
            }
        }
        FrameType::PushPromise => {
            let fragment = strip_padding(header, payload)?
                .get(4..)
                .ok_or("truncated promised stream id")?;
            if header.is_end_headers() {
                state.decode(message_type, fragment);
            } else {
                *state.pending(message_type) = Some(PendingBlock {
                    stream_id: header.stream_id,
                    block: fragment.to_vec(),
                    end_stream: false,
                    promise: true,
                });
            }
            FrameBody::Control
        }
        FrameType::Continuation => {
            // A fragment for another stream, or with nothing pending, is skipped
            if state.pending_stream(message_type) != Some(header.stream_id) {
                return Ok(FrameBody::Control);
            }
            let Some(mut pending) = state.pending(message_type).take() else {
                return Ok(FrameBody::Control);
            };
            if pending.block.len() + payload.len() > MAX_HEADER_BLOCK {
                debug!(stream_id = header.stream_id, "oversized header block discarded");
                return Ok(FrameBody::Control);
            }
            pending.block.extend_from_slice(payload);
            if !header.is_end_headers() {
                *state.pending(message_type) = Some(pending);
                return Ok(FrameBody::Control);
            }
            let headers = state.decode(message_type, &pending.block);
            if pending.promise {
                FrameBody::Control
            } else {
                FrameBody::Headers {
                    headers,
                    end_stream: pending.end_stream,
                }
            }
        }
        FrameType::RstStream => FrameBody::RstStream {
            error_code: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
        },
        _ => FrameBody::Control,
    };
    Ok(body)
}

/// Position after the frame at the head of `buf`, if it has a valid header
/// within the default frame size.
fn valid_frame_end(buf: &[u8]) -> Option<usize> {
    let header = FrameHeader::parse(buf)?;
    header.validate().ok()?;
    (header.length <= DEFAULT_MAX_FRAME_SIZE).then(|| header.frame_len())
}

/// Zero-sized handler for HTTP/2.
#[derive(Debug, Clone, Copy, Default)]
pub struct Http2;

impl ProtocolHandler for Http2 {
    const PROTOCOL: Protocol = Protocol::Http2;

    type Frame = Frame;
    type Key = u32;
    type State = Http2State;
    type Record = Record;

    fn parse_frame(
        message_type: MessageType,
        buf: &[u8],
        state: &mut Http2State,
    ) -> FrameParseResult<Frame> {
        if message_type == MessageType::Request && !buf.is_empty() {
            if buf.starts_with(CONNECTION_PREFACE) {
                return FrameParseResult::Complete {
                    frame: Frame {
                        timestamp_ns: 0,
                        stream_id: 0,
                        frame_type: FrameType::Settings,
                        flags: 0,
                        body: FrameBody::Preface,
                        size: CONNECTION_PREFACE.len(),
                    },
                    bytes_consumed: CONNECTION_PREFACE.len(),
                };
            }
            if CONNECTION_PREFACE.starts_with(buf) {
                return FrameParseResult::need(CONNECTION_PREFACE.len());
            }
        }

        let Some(header) = FrameHeader::parse(buf) else {
            return FrameParseResult::need(FrameHeader::SIZE);
        };
        if let Err(reason) = header.validate() {
            return FrameParseResult::invalid(reason);
        }
        let total = header.frame_len();
        if buf.len() < total {
            return FrameParseResult::need(total);
        }

        match frame_body(message_type, &header, &buf[FrameHeader::SIZE..total], state) {
            Ok(body) => FrameParseResult::Complete {
                frame: Frame {
                    timestamp_ns: 0,
                    stream_id: header.stream_id,
                    frame_type: header.frame_type,
                    flags: header.flags,
                    body,
                    size: total,
                },
                bytes_consumed: total,
            },
            Err(reason) => FrameParseResult::invalid(reason),
        }
    }

    fn find_frame_boundary(
        _message_type: MessageType,
        buf: &[u8],
        start_pos: usize,
        _state: &Http2State,
    ) -> Option<usize> {
        scan_boundary(buf, start_pos, |candidate| match valid_frame_end(candidate) {
            // The frame must fit; the next frame, when present, must also look valid
            Some(end) if end <= candidate.len() => {
                candidate.len() - end < FrameHeader::SIZE
                    || valid_frame_end(&candidate[end..]).is_some()
            }
            _ => false,
        })
    }

    fn stream_key(frame: &Frame) -> u32 {
        frame.stream_id
    }

    fn stitch_frames(
        requests: &mut VecDeque<Frame>,
        responses: &mut VecDeque<Frame>,
        _state: &mut Http2State,
    ) -> RecordsWithErrorCount<Record> {
        let mut result = RecordsWithErrorCount::new();

        // Stream 0 carries only connection-level frames
        let stream_id = match requests.front().or(responses.front()) {
            Some(frame) => frame.stream_id,
            None => return result,
        };
        if stream_id == 0 {
            requests.clear();
            responses.clear();
            return result;
        }

        requests.retain(Frame::contributes);
        responses.retain(Frame::contributes);

        while let Some(resp_end) = responses.iter().position(Frame::ends_half) {
            if requests.is_empty() {
                trace!(protocol = PROTOCOL, stream_id, "response stream without request");
                responses.drain(..=resp_end);
                result.error_count += 1;
                continue;
            }
            let Some(req_end) = requests.iter().position(Frame::ends_half) else {
                break;
            };
            result.records.push(Record {
                stream_id,
                req: HalfStream::collect(requests.drain(..=req_end)),
                resp: HalfStream::collect(responses.drain(..=resp_end)),
            });
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpack::Encoder;

    fn frame_bytes(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() as u32;
        let mut out = vec![(len >> 16) as u8, (len >> 8) as u8, len as u8, frame_type, flags];
        out.extend_from_slice(&stream_id.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn encode(encoder: &mut Encoder<'_>, headers: &[(&str, &str)]) -> Vec<u8> {
        encoder.encode(headers.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())))
    }

    /// Parse every frame in `data`, stamping successive timestamps.
    fn parse_all(
        message_type: MessageType,
        data: &[u8],
        state: &mut Http2State,
        ts: u64,
    ) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            match Http2::parse_frame(message_type, &data[pos..], state) {
                FrameParseResult::Complete {
                    mut frame,
                    bytes_consumed,
                } => {
                    frame.timestamp_ns = ts + frames.len() as u64;
                    frames.push(frame);
                    pos += bytes_consumed;
                }
                _ => panic!("Expected Complete"),
            }
        }
        frames
    }

    fn queue_for(frames: Vec<Frame>, stream_id: u32) -> VecDeque<Frame> {
        frames.into_iter().filter(|f| f.stream_id == stream_id).collect()
    }

    #[test]
    fn test_frame_header_parse() {
        let data = frame_bytes(0x1, flags::END_HEADERS | flags::END_STREAM, 0x8000_0003, &[]);
        let header = FrameHeader::parse(&data).unwrap();
        assert_eq!(header.frame_type, FrameType::Headers);
        // Reserved bit is masked
        assert_eq!(header.stream_id, 3);
        assert!(header.is_end_stream());
        assert!(header.is_end_headers());
        assert!(!header.is_padded());
    }

    #[test]
    fn test_preface() {
        let mut state = Http2State::default();
        let (frame, consumed) =
            Http2::parse_frame(MessageType::Request, CONNECTION_PREFACE, &mut state)
                .into_frame()
                .unwrap();
        assert_eq!(frame.body, FrameBody::Preface);
        assert_eq!(consumed, 24);

        match Http2::parse_frame(MessageType::Request, &CONNECTION_PREFACE[..10], &mut state) {
            FrameParseResult::NeedMore { minimum_bytes } => assert_eq!(minimum_bytes, Some(24)),
            _ => panic!("Expected NeedMore"),
        }
    }

    #[test]
    fn test_invalid_frames() {
        let mut state = Http2State::default();
        let settings_on_stream = frame_bytes(0x4, 0, 1, &[]);
        assert!(matches!(
            Http2::parse_frame(MessageType::Response, &settings_on_stream, &mut state),
            FrameParseResult::Invalid { .. }
        ));
        let data_on_zero = frame_bytes(0x0, 0, 0, b"x");
        assert!(matches!(
            Http2::parse_frame(MessageType::Response, &data_on_zero, &mut state),
            FrameParseResult::Invalid { .. }
        ));
        let over_padded = frame_bytes(0x0, flags::PADDED, 1, &[10, b'a']);
        assert!(matches!(
            Http2::parse_frame(MessageType::Response, &over_padded, &mut state),
            FrameParseResult::Invalid { .. }
        ));
    }

    #[test]
    fn test_padded_data() {
        let mut state = Http2State::default();
        let data = frame_bytes(0x0, flags::PADDED | flags::END_STREAM, 1, b"\x03body\0\0\0");
        let frames = parse_all(MessageType::Response, &data, &mut state, 0);
        assert_eq!(
            frames[0].body,
            FrameBody::Data {
                data: Bytes::from_static(b"body"),
                end_stream: true
            }
        );
    }

    #[test]
    fn test_headers_with_priority_and_continuation() {
        let mut state = Http2State::default();
        let mut encoder = Encoder::new();
        let block = encode(
            &mut encoder,
            &[(":method", "GET"), (":path", "/"), ("user-agent", "curl")],
        );
        let (first, rest) = block.split_at(3);

        let mut payload = vec![0, 0, 0, 0, 16];
        payload.extend_from_slice(first);
        let mut data = frame_bytes(0x1, flags::PRIORITY | flags::END_STREAM, 5, &payload);
        data.extend(frame_bytes(0x9, flags::END_HEADERS, 5, rest));

        let frames = parse_all(MessageType::Request, &data, &mut state, 0);
        assert_eq!(frames[0].body, FrameBody::Control);
        match &frames[1].body {
            FrameBody::Headers {
                headers,
                end_stream,
            } => {
                assert!(*end_stream);
                assert_eq!(headers.len(), 3);
                assert_eq!(headers[2], ("user-agent".into(), "curl".into()));
            }
            other => panic!("Expected Headers, got {:?}", other),
        }
    }

    #[test]
    fn test_dynamic_table_persists_across_frames() {
        let mut state = Http2State::default();
        let mut encoder = Encoder::new();
        let headers = [(":method", "GET"), ("x-trace", "abc123")];
        let mut data = frame_bytes(0x1, 0x5, 1, &encode(&mut encoder, &headers));
        data.extend(frame_bytes(0x1, 0x5, 3, &encode(&mut encoder, &headers)));

        let frames = parse_all(MessageType::Request, &data, &mut state, 0);
        assert_eq!(frames[0].body, frames[1].body);
    }

    // Test 1: Full exchange on one stream
    #[test]
    fn test_stitch_exchange() {
        let mut client = Http2State::default();
        let mut server = Http2State::default();
        let mut client_enc = Encoder::new();
        let mut server_enc = Encoder::new();

        let mut req = CONNECTION_PREFACE.to_vec();
        req.extend(frame_bytes(0x4, 0, 0, &[]));
        req.extend(frame_bytes(
            0x1,
            flags::END_HEADERS | flags::END_STREAM,
            1,
            &encode(&mut client_enc, &[(":method", "GET"), (":path", "/index")]),
        ));

        let mut resp = frame_bytes(0x4, 0, 0, &[]);
        resp.extend(frame_bytes(
            0x1,
            flags::END_HEADERS,
            1,
            &encode(&mut server_enc, &[(":status", "200")]),
        ));
        resp.extend(frame_bytes(0x0, flags::END_STREAM, 1, b"hello"));

        let req_frames = parse_all(MessageType::Request, &req, &mut client, 10);
        let resp_frames = parse_all(MessageType::Response, &resp, &mut server, 20);

        let mut reqs = queue_for(req_frames.clone(), 0);
        let mut resps = queue_for(resp_frames.clone(), 0);
        let result = Http2::stitch_frames(&mut reqs, &mut resps, &mut client);
        assert!(result.records.is_empty());
        assert_eq!(result.error_count, 0);
        assert!(reqs.is_empty() && resps.is_empty());

        let mut reqs = queue_for(req_frames, 1);
        let mut resps = queue_for(resp_frames, 1);
        let result = Http2::stitch_frames(&mut reqs, &mut resps, &mut client);

        assert_eq!(result.error_count, 0);
        assert_eq!(result.records.len(), 1);
        let record = &result.records[0];
        assert_eq!(record.req.header(":path"), Some("/index"));
        assert_eq!(record.resp.header(":status"), Some("200"));
        assert_eq!(record.resp_payload(), Bytes::from(":status: 200\n\nhello"));
        assert_eq!(record.req_timestamp_ns(), Some(12));
        assert_eq!(record.resp_timestamp_ns(), Some(21));
    }

    // Test 2: Waits until both halves are complete
    #[test]
    fn test_stitch_pending_response() {
        let mut state = Http2State::default();
        let mut enc = Encoder::new();
        let req = frame_bytes(0x1, 0x5, 1, &encode(&mut enc, &[(":method", "GET")]));
        let resp = frame_bytes(
            0x1,
            flags::END_HEADERS,
            1,
            &encode(&mut Encoder::new(), &[(":status", "200")]),
        );

        let mut reqs: VecDeque<_> = parse_all(MessageType::Request, &req, &mut state, 1).into();
        let mut resps: VecDeque<_> = parse_all(MessageType::Response, &resp, &mut state, 2).into();
        let result = Http2::stitch_frames(&mut reqs, &mut resps, &mut state);

        assert!(result.records.is_empty());
        assert_eq!(reqs.len(), 1);
        assert_eq!(resps.len(), 1);
    }

    // Test 3: RST_STREAM completes a half
    #[test]
    fn test_stitch_reset_stream() {
        let mut state = Http2State::default();
        let mut enc = Encoder::new();
        let req = frame_bytes(0x1, 0x5, 7, &encode(&mut enc, &[(":method", "GET")]));
        let resp = frame_bytes(0x3, 0, 7, &error_codes::REFUSED_STREAM.to_be_bytes());

        let mut reqs: VecDeque<_> = parse_all(MessageType::Request, &req, &mut state, 1).into();
        let mut resps: VecDeque<_> = parse_all(MessageType::Response, &resp, &mut state, 2).into();
        let result = Http2::stitch_frames(&mut reqs, &mut resps, &mut state);

        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].resp.reset, Some(error_codes::REFUSED_STREAM));
        assert_eq!(
            result.records[0].resp_payload(),
            Bytes::from("RST_STREAM: REFUSED_STREAM\n")
        );
    }

    // Test 4: Response without any request frames
    #[test]
    fn test_stitch_orphan_response() {
        let mut state = Http2State::default();
        let resp = frame_bytes(0x0, flags::END_STREAM, 9, b"late");

        let mut reqs = VecDeque::new();
        let mut resps: VecDeque<_> = parse_all(MessageType::Response, &resp, &mut state, 2).into();
        let result = Http2::stitch_frames(&mut reqs, &mut resps, &mut state);

        assert!(result.records.is_empty());
        assert_eq!(result.error_count, 1);
        assert!(resps.is_empty());
    }

    #[test]
    fn test_find_frame_boundary() {
        let state = Http2State::default();
        let mut data = vec![0xde, 0xad, 0xbe];
        data.extend(frame_bytes(0x8, 0, 0, &[0, 0, 0x10, 0]));
        data.extend(frame_bytes(0x6, 0, 0, &[0; 8]));
        assert_eq!(
            Http2::find_frame_boundary(MessageType::Response, &data, 0, &state),
            Some(3)
        );
    }

    #[test]
    fn test_find_frame_boundary_rejects_oversize_header() {
        let state = Http2State::default();
        let mut data = vec![0xff; 5];
        data.extend_from_slice(&[0x00, 0x03, 0xe8, 0x0, 0, 0, 0, 0, 1]);
        assert_eq!(
            Http2::find_frame_boundary(MessageType::Request, &data, 0, &state),
            None
        );

        data.extend_from_slice(&[0; 1000]);
        assert_eq!(
            Http2::find_frame_boundary(MessageType::Request, &data, 0, &state),
            Some(5)
        );
    }
}

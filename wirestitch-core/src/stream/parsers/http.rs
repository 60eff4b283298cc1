//! HTTP/1.x parser using httparse for the message head.
//!
//! Supports:
//! - HTTP/1.0 and HTTP/1.1 requests and responses
//! - Chunked transfer encoding
//! - Content-Length based bodies
//! - Keep-alive connections with multiple messages per stream

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use compact_str::CompactString;
use httparse::{Request, Response, Status, EMPTY_HEADER};
use tracing::trace;

use crate::stream::parser::{scan_boundary, stitch_in_order};
use crate::stream::{
    Exchange, FrameBase, FrameParseResult, MessageType, Protocol, ProtocolHandler,
    RecordsWithErrorCount,
};

const PROTOCOL: &str = "http";

/// Maximum number of headers to parse per message.
const MAX_HEADERS: usize = 100;

/// A head still partial past this size is not HTTP.
const MAX_HEAD_LEN: usize = 64 * 1024;

/// Pending request methods remembered for HEAD detection.
const MAX_PENDING_METHODS: usize = 1024;

const METHODS: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ", b"CONNECT ",
    b"TRACE ",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: CompactString,
        path: CompactString,
    },
    Response {
        status: u16,
        reason: CompactString,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub timestamp_ns: u64,
    pub start: StartLine,
    pub minor_version: u8,
    /// Lower-cased header names with their values, in wire order.
    pub headers: Vec<(CompactString, CompactString)>,
    /// Body with any chunked framing removed.
    pub body: Bytes,
    pub size: usize,
}

impl Message {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn status(&self) -> Option<u16> {
        match self.start {
            StartLine::Response { status, .. } => Some(status),
            StartLine::Request { .. } => None,
        }
    }

    /// 1xx responses other than 101 precede the final response.
    fn is_interim(&self) -> bool {
        self.status()
            .is_some_and(|s| (100..200).contains(&s) && s != 101)
    }

    pub fn render(&self) -> Bytes {
        let line = match &self.start {
            StartLine::Request { method, path } => format!("{} {}", method, path),
            StartLine::Response { status, reason } => format!("{} {}", status, reason),
        };
        let mut out = BytesMut::with_capacity(line.len() + 1 + self.body.len());
        out.extend_from_slice(line.as_bytes());
        if !self.body.is_empty() {
            out.extend_from_slice(b"\n");
            out.extend_from_slice(&self.body);
        }
        out.freeze()
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
        self.req.render()
    }

    fn resp_payload(&self) -> Bytes {
        self.resp.render()
    }
}

/// Whether each unanswered request was a HEAD, oldest first.
///
/// Responses to HEAD carry Content-Length without a body.
#[derive(Debug, Default)]
pub struct HttpState {
    pending_head: VecDeque<bool>,
}

impl HttpState {
    fn push_request(&mut self, is_head: bool) {
        if self.pending_head.len() >= MAX_PENDING_METHODS {
            self.pending_head.pop_front();
        }
        self.pending_head.push_back(is_head);
    }
}

fn collect_headers(headers: &[httparse::Header]) -> Vec<(CompactString, CompactString)> {
    headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| {
            (
                CompactString::from(h.name.to_ascii_lowercase()),
                CompactString::from(String::from_utf8_lossy(h.value)),
            )
        })
        .collect()
}

fn is_chunked(headers: &[(CompactString, CompactString)]) -> bool {
    headers
        .iter()
        .any(|(n, v)| n == "transfer-encoding" && v.to_ascii_lowercase().contains("chunked"))
}

fn content_length(
    headers: &[(CompactString, CompactString)],
) -> Result<Option<usize>, &'static str> {
    match headers.iter().find(|(n, _)| n == "content-length") {
        Some((_, v)) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| "malformed Content-Length"),
        None => Ok(None),
    }
}

enum Chunked {
    Complete { consumed: usize, body: Bytes },
    Incomplete,
    Malformed,
}

/// Decode a chunked body, returning the bytes it occupied and its content.
fn parse_chunked_body(data: &[u8]) -> Chunked {
    let mut pos = 0;
    let mut body = BytesMut::new();

    loop {
        // Find chunk size line ending
        let Some(line_end) = data[pos..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|p| pos + p)
        else {
            return Chunked::Incomplete;
        };

        let Ok(size_str) = std::str::from_utf8(&data[pos..line_end]) else {
            return Chunked::Malformed;
        };
        // Chunk extensions follow a semicolon
        let size_part = size_str.split(';').next().unwrap_or(size_str);
        let Ok(chunk_size) = usize::from_str_radix(size_part.trim(), 16) else {
            return Chunked::Malformed;
        };

        pos = line_end + 2;

        if chunk_size == 0 {
            if data.len() >= pos + 2 && &data[pos..pos + 2] == b"\r\n" {
                return Chunked::Complete {
                    consumed: pos + 2,
                    body: body.freeze(),
                };
            }
            // Trailers end with an empty line
            return match data[pos..].windows(4).position(|w| w == b"\r\n\r\n") {
                Some(end) => Chunked::Complete {
                    consumed: pos + end + 4,
                    body: body.freeze(),
                },
                None => Chunked::Incomplete,
            };
        }

        let Some(chunk_end) = pos
            .checked_add(chunk_size)
            .filter(|&end| end < usize::MAX - 2)
        else {
            return Chunked::Malformed;
        };
        if data.len() < chunk_end + 2 {
            return Chunked::Incomplete;
        }
        if &data[chunk_end..chunk_end + 2] != b"\r\n" {
            return Chunked::Malformed;
        }
        body.extend_from_slice(&data[pos..chunk_end]);
        pos = chunk_end + 2;
    }
}

/// Body framing once the head is parsed.
fn complete_message(
    data: &[u8],
    head_len: usize,
    start: StartLine,
    minor_version: u8,
    headers: Vec<(CompactString, CompactString)>,
    has_body: bool,
) -> FrameParseResult<Message> {
    let rest = &data[head_len..];
    let (consumed, body) = if !has_body {
        (0, Bytes::new())
    } else if is_chunked(&headers) {
        match parse_chunked_body(rest) {
            Chunked::Complete { consumed, body } => (consumed, body),
            Chunked::Incomplete => return FrameParseResult::need_more(),
            Chunked::Malformed => return FrameParseResult::invalid("malformed chunked body"),
        }
    } else {
        match content_length(&headers) {
            Ok(Some(len)) => {
                if rest.len() < len {
                    return FrameParseResult::need(head_len.saturating_add(len));
                }
                (len, Bytes::copy_from_slice(&rest[..len]))
            }
            // Length-less messages are treated as body-less
            Ok(None) => (0, Bytes::new()),
            Err(reason) => return FrameParseResult::invalid(reason),
        }
    };

    let size = head_len + consumed;
    FrameParseResult::Complete {
        frame: Message {
            timestamp_ns: 0,
            start,
            minor_version,
            headers,
            body,
            size,
        },
        bytes_consumed: size,
    }
}

fn parse_request(data: &[u8], state: &mut HttpState) -> FrameParseResult<Message> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut req = Request::new(&mut headers);

    let head_len = match req.parse(data) {
        Ok(Status::Complete(len)) => len,
        Ok(Status::Partial) if data.len() > MAX_HEAD_LEN => {
            return FrameParseResult::invalid("request head too large")
        }
        Ok(Status::Partial) => return FrameParseResult::need_more(),
        Err(_) => return FrameParseResult::invalid("not an HTTP request"),
    };
    let method = CompactString::from(req.method.unwrap_or_default());
    let start = StartLine::Request {
        path: CompactString::from(req.path.unwrap_or_default()),
        method: method.clone(),
    };
    let result = complete_message(
        data,
        head_len,
        start,
        req.version.unwrap_or(1),
        collect_headers(req.headers),
        true,
    );
    if let FrameParseResult::Complete { .. } = result {
        state.push_request(method == "HEAD");
    }
    result
}

fn parse_response(data: &[u8], state: &mut HttpState) -> FrameParseResult<Message> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut resp = Response::new(&mut headers);

    let head_len = match resp.parse(data) {
        Ok(Status::Complete(len)) => len,
        Ok(Status::Partial) if data.len() > MAX_HEAD_LEN => {
            return FrameParseResult::invalid("response head too large")
        }
        Ok(Status::Partial) => return FrameParseResult::need_more(),
        Err(_) => return FrameParseResult::invalid("not an HTTP response"),
    };
    let status = resp.code.unwrap_or_default();
    let is_interim = (100..200).contains(&status) && status != 101;
    let answers_head = !is_interim && state.pending_head.front() == Some(&true);
    let has_body = !matches!(status, 100..=199 | 204 | 304) && !answers_head;

    let result = complete_message(
        data,
        head_len,
        StartLine::Response {
            status,
            reason: CompactString::from(resp.reason.unwrap_or_default()),
        },
        resp.version.unwrap_or(1),
        collect_headers(resp.headers),
        has_body,
    );
    if !is_interim && matches!(result, FrameParseResult::Complete { .. }) {
        state.pending_head.pop_front();
    }
    result
}

/// Zero-sized handler for HTTP/1.x.
#[derive(Debug, Clone, Copy, Default)]
pub struct Http;

impl ProtocolHandler for Http {
    const PROTOCOL: Protocol = Protocol::Http;

    type Frame = Message;
    type Key = u32;
    type State = HttpState;
    type Record = Record;

    fn parse_frame(
        message_type: MessageType,
        buf: &[u8],
        state: &mut HttpState,
    ) -> FrameParseResult<Message> {
        if buf.is_empty() {
            return FrameParseResult::need(1);
        }
        match message_type {
            MessageType::Request => parse_request(buf, state),
            MessageType::Response => parse_response(buf, state),
        }
    }

    fn find_frame_boundary(
        message_type: MessageType,
        buf: &[u8],
        start_pos: usize,
        _state: &HttpState,
    ) -> Option<usize> {
        scan_boundary(buf, start_pos, |candidate| match message_type {
            MessageType::Request => METHODS.iter().any(|m| candidate.starts_with(m)),
            MessageType::Response => candidate.starts_with(b"HTTP/1."),
        })
    }

    fn stream_key(_frame: &Message) -> u32 {
        0
    }

    fn stitch_frames(
        requests: &mut VecDeque<Message>,
        responses: &mut VecDeque<Message>,
        _state: &mut HttpState,
    ) -> RecordsWithErrorCount<Record> {
        responses.retain(|resp| {
            let keep = !resp.is_interim();
            if !keep {
                trace!(protocol = PROTOCOL, status = resp.status(), "interim response dropped");
            }
            keep
        });
        stitch_in_order(PROTOCOL, requests, responses, |req, resp| Record { req, resp })
    }
}

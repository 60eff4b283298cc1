//! PostgreSQL frontend/backend protocol (v3).
//!
//! Regular messages are a 1-byte tag followed by a big-endian `i32` length
//! that counts itself. The startup packet has no tag and is parsed as the
//! pseudo tag [`tag::STARTUP`].

use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::ProtocolError;
use crate::stream::decode::Decoder;
use crate::stream::parser::scan_boundary;
use crate::stream::{
    Exchange, FrameBase, FrameParseResult, MessageType, Protocol, ProtocolHandler,
    RecordsWithErrorCount,
};

const PROTOCOL: &str = "pgsql";

/// Message tags. Several values are shared between directions.
pub mod tag {
    pub const STARTUP: u8 = 0;

    // Frontend
    pub const QUERY: u8 = b'Q';
    pub const PARSE: u8 = b'P';
    pub const BIND: u8 = b'B';
    pub const DESCRIBE: u8 = b'D';
    pub const EXECUTE: u8 = b'E';
    pub const SYNC: u8 = b'S';
    pub const FLUSH: u8 = b'H';
    pub const CLOSE: u8 = b'C';
    pub const TERMINATE: u8 = b'X';
    pub const PASSWORD: u8 = b'p';
    pub const FUNCTION_CALL: u8 = b'F';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
    pub const COPY_FAIL: u8 = b'f';

    // Backend
    pub const AUTH: u8 = b'R';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const CLOSE_COMPLETE: u8 = b'3';
    pub const CMD_COMPLETE: u8 = b'C';
    pub const COPY_IN_RESPONSE: u8 = b'G';
    pub const COPY_OUT_RESPONSE: u8 = b'H';
    pub const COPY_BOTH_RESPONSE: u8 = b'W';
    pub const DATA_ROW: u8 = b'D';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const FUNCTION_CALL_RESPONSE: u8 = b'V';
    pub const NEGOTIATE_PROTOCOL_VERSION: u8 = b'v';
    pub const NO_DATA: u8 = b'n';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
    pub const PARAM_DESC: u8 = b't';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const PORTAL_SUSPENDED: u8 = b's';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESC: u8 = b'T';
}

const PROTOCOL_V3: u32 = 0x0003_0000;
const SSL_REQUEST_CODE: u32 = 80_877_103;
const CANCEL_REQUEST_CODE: u32 = 80_877_102;
const GSSENC_REQUEST_CODE: u32 = 80_877_104;

/// Tag byte plus length field.
const HEADER_LEN: usize = 5;
const MAX_MESSAGE_LEN: usize = 256 * 1024 * 1024;

/// Rendering of SQL NULL in assembled result sets.
pub const NULL_SENTINEL: &[u8] = b"[NULL]";

/// Prepared statements remembered per connection.
const MAX_STATEMENTS: usize = 1024;

fn is_request_tag(tag: u8) -> bool {
    matches!(
        tag,
        tag::QUERY
            | tag::PARSE
            | tag::BIND
            | tag::DESCRIBE
            | tag::EXECUTE
            | tag::SYNC
            | tag::FLUSH
            | tag::CLOSE
            | tag::TERMINATE
            | tag::PASSWORD
            | tag::FUNCTION_CALL
            | tag::COPY_DATA
            | tag::COPY_DONE
            | tag::COPY_FAIL
    )
}

fn is_response_tag(tag: u8) -> bool {
    matches!(
        tag,
        tag::AUTH
            | tag::BACKEND_KEY_DATA
            | tag::PARSE_COMPLETE
            | tag::BIND_COMPLETE
            | tag::CLOSE_COMPLETE
            | tag::CMD_COMPLETE
            | tag::COPY_IN_RESPONSE
            | tag::COPY_OUT_RESPONSE
            | tag::COPY_BOTH_RESPONSE
            | tag::COPY_DATA
            | tag::COPY_DONE
            | tag::DATA_ROW
            | tag::EMPTY_QUERY_RESPONSE
            | tag::ERROR_RESPONSE
            | tag::FUNCTION_CALL_RESPONSE
            | tag::NEGOTIATE_PROTOCOL_VERSION
            | tag::NO_DATA
            | tag::NOTICE_RESPONSE
            | tag::NOTIFICATION_RESPONSE
            | tag::PARAM_DESC
            | tag::PARAMETER_STATUS
            | tag::PORTAL_SUSPENDED
            | tag::READY_FOR_QUERY
            | tag::ROW_DESC
    )
}

fn is_valid_tag(message_type: MessageType, tag: u8) -> bool {
    match message_type {
        MessageType::Request => is_request_tag(tag),
        MessageType::Response => is_response_tag(tag),
    }
}

/// Backend messages that are not part of any request's response.
fn is_async_response(tag: u8) -> bool {
    matches!(
        tag,
        tag::PARAMETER_STATUS
            | tag::NOTICE_RESPONSE
            | tag::READY_FOR_QUERY
            | tag::BACKEND_KEY_DATA
            | tag::AUTH
            | tag::NOTIFICATION_RESPONSE
            | tag::NEGOTIATE_PROTOCOL_VERSION
    )
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegularMessage {
    pub timestamp_ns: u64,
    pub tag: u8,
    /// Declared length, including the length field itself.
    pub len: u32,
    pub payload: Bytes,
}

impl RegularMessage {
    /// Payload with trailing NUL terminators removed.
    pub fn text(&self) -> Bytes {
        strip_nul(&self.payload)
    }
}

impl FrameBase for RegularMessage {
    fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    fn set_timestamp_ns(&mut self, timestamp_ns: u64) {
        self.timestamp_ns = timestamp_ns;
    }

    fn byte_size(&self) -> usize {
        if self.tag == tag::STARTUP {
            self.len as usize
        } else {
            self.len as usize + 1
        }
    }
}

/// A statement's text and the columns its result set carries.
#[derive(Debug, Clone, Default)]
struct Statement {
    query: Bytes,
    columns: Vec<Bytes>,
}

/// Extended-query bookkeeping for one connection.
#[derive(Debug, Default)]
pub struct PgState {
    statements: HashMap<Bytes, Statement>,
    portal: Option<Statement>,
}

impl PgState {
    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    fn insert_statement(&mut self, name: Bytes, statement: Statement) {
        if self.statements.len() >= MAX_STATEMENTS && !self.statements.contains_key(&name) {
            debug!("too many prepared statements tracked, forgetting all");
            self.statements.clear();
        }
        self.statements.insert(name, statement);
    }
}

/// A request paired with its (possibly assembled) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub req: RegularMessage,
    pub resp: RegularMessage,
}

impl Exchange for Record {
    fn req_timestamp_ns(&self) -> Option<u64> {
        Some(self.req.timestamp_ns)
    }

    fn resp_timestamp_ns(&self) -> Option<u64> {
        Some(self.resp.timestamp_ns)
    }

    fn req_payload(&self) -> Bytes {
        self.req.payload.clone()
    }

    fn resp_payload(&self) -> Bytes {
        self.resp.payload.clone()
    }
}

fn strip_nul(data: &Bytes) -> Bytes {
    let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    data.slice(..end)
}

fn parse_startup(buf: &[u8]) -> FrameParseResult<RegularMessage> {
    if buf.len() < 8 {
        return FrameParseResult::need(8);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let code = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if !matches!(
        code,
        PROTOCOL_V3 | SSL_REQUEST_CODE | CANCEL_REQUEST_CODE | GSSENC_REQUEST_CODE
    ) {
        return FrameParseResult::invalid("unknown startup protocol version");
    }
    if !(8..=10_000).contains(&len) {
        return FrameParseResult::invalid("startup length out of range");
    }
    if buf.len() < len {
        return FrameParseResult::need(len);
    }
    FrameParseResult::Complete {
        frame: RegularMessage {
            timestamp_ns: 0,
            tag: tag::STARTUP,
            len: len as u32,
            payload: Bytes::copy_from_slice(&buf[4..len]),
        },
        bytes_consumed: len,
    }
}

/// Declared total size of a regular message at the head of `buf`, if its
/// header is plausible for the direction.
fn regular_message_size(message_type: MessageType, buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_LEN || !is_valid_tag(message_type, buf[0]) {
        return None;
    }
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 || len as usize > MAX_MESSAGE_LEN {
        return None;
    }
    Some(len as usize + 1)
}

fn parse_message(message_type: MessageType, buf: &[u8]) -> FrameParseResult<RegularMessage> {
    if message_type == MessageType::Request && buf.first() == Some(&0) {
        return parse_startup(buf);
    }
    if buf.len() < HEADER_LEN {
        return FrameParseResult::need(HEADER_LEN);
    }
    if !is_valid_tag(message_type, buf[0]) {
        return FrameParseResult::invalid("unknown message tag");
    }
    let Some(total) = regular_message_size(message_type, buf) else {
        return FrameParseResult::invalid("message length out of range");
    };
    if buf.len() < total {
        return FrameParseResult::need(total);
    }
    FrameParseResult::Complete {
        frame: RegularMessage {
            timestamp_ns: 0,
            tag: buf[0],
            len: (total - 1) as u32,
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..total]),
        },
        bytes_consumed: total,
    }
}

/// Column names from a RowDescription payload.
pub fn parse_row_desc(payload: &[u8]) -> Result<Vec<Bytes>, ProtocolError> {
    let mut dec = Decoder::new(PROTOCOL, payload);
    let count = dec.i16_be()?;
    if count < 0 {
        return Err(dec.invalid("field count", count.to_string()));
    }
    let mut names = Vec::with_capacity(count as usize);
    for _ in 0..count {
        names.push(Bytes::copy_from_slice(dec.cstr()?));
        // table oid, attribute number, type oid, type size, type modifier, format code
        dec.skip(18)?;
    }
    Ok(names)
}

/// Column values from a DataRow payload; `None` is SQL NULL.
pub fn parse_data_row(payload: &[u8]) -> Result<Vec<Option<Bytes>>, ProtocolError> {
    let mut dec = Decoder::new(PROTOCOL, payload);
    let count = dec.i16_be()?;
    if count < 0 {
        return Err(dec.invalid("column count", count.to_string()));
    }
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = dec.i32_be()?;
        if len < 0 {
            values.push(None);
        } else {
            values.push(Some(Bytes::copy_from_slice(dec.bytes(len as usize)?)));
        }
    }
    Ok(values)
}

/// `(field code, value)` pairs of an ErrorResponse or NoticeResponse.
pub fn parse_error_fields(payload: &[u8]) -> Result<Vec<(u8, Bytes)>, ProtocolError> {
    let mut dec = Decoder::new(PROTOCOL, payload);
    let mut fields = Vec::new();
    loop {
        let code = dec.u8()?;
        if code == 0 {
            break;
        }
        fields.push((code, Bytes::copy_from_slice(dec.cstr()?)));
    }
    Ok(fields)
}

/// Statement name and query text of a Parse message.
pub fn parse_parse(payload: &[u8]) -> Result<(Bytes, Bytes), ProtocolError> {
    let mut dec = Decoder::new(PROTOCOL, payload);
    let name = Bytes::copy_from_slice(dec.cstr()?);
    let query = Bytes::copy_from_slice(dec.cstr()?);
    Ok((name, query))
}

/// Portal and statement names of a Bind message.
pub fn parse_bind(payload: &[u8]) -> Result<(Bytes, Bytes), ProtocolError> {
    let mut dec = Decoder::new(PROTOCOL, payload);
    let portal = Bytes::copy_from_slice(dec.cstr()?);
    let statement = Bytes::copy_from_slice(dec.cstr()?);
    Ok((portal, statement))
}

/// Target kind (`S` or `P`) and name of a Describe or Close message.
pub fn parse_describe(payload: &[u8]) -> Result<(u8, Bytes), ProtocolError> {
    let mut dec = Decoder::new(PROTOCOL, payload);
    let kind = dec.u8()?;
    if kind != b'S' && kind != b'P' {
        return Err(dec.invalid("describe target", format!("{:#04x}", kind)));
    }
    let name = Bytes::copy_from_slice(dec.cstr()?);
    Ok((kind, name))
}

/// Name/value parameters of a startup packet payload.
pub fn parse_startup_params(payload: &[u8]) -> Result<Vec<(Bytes, Bytes)>, ProtocolError> {
    let mut dec = Decoder::new(PROTOCOL, payload);
    let _version = dec.u32_be()?;
    let mut params = Vec::new();
    loop {
        let name = dec.cstr()?;
        if name.is_empty() {
            break;
        }
        let value = dec.cstr()?;
        params.push((Bytes::copy_from_slice(name), Bytes::copy_from_slice(value)));
    }
    Ok(params)
}

fn render_error(payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let fields = parse_error_fields(payload)?;
    let field = |code: u8| fields.iter().find(|(c, _)| *c == code).map(|(_, v)| v);
    let mut out = BytesMut::new();
    if let Some(severity) = field(b'S') {
        out.extend_from_slice(severity);
        out.extend_from_slice(b": ");
    }
    if let Some(message) = field(b'M') {
        out.extend_from_slice(message);
    }
    Ok(out.freeze())
}

fn push_line(out: &mut BytesMut, parts: impl Iterator<Item = Bytes>) {
    if !out.is_empty() {
        out.extend_from_slice(b"\n");
    }
    for (i, part) in parts.enumerate() {
        if i > 0 {
            out.extend_from_slice(b",");
        }
        out.extend_from_slice(&part);
    }
}

/// Outcome of looking for an expected response at the head of the queue.
enum Take<T> {
    Done(T),
    /// Terminating message has not been captured yet.
    Pending,
    /// The head does not belong to this request.
    Mismatch,
    /// The group was consumed but could not be decoded.
    Malformed(ProtocolError),
}

/// Response to a Query or Execute: optional row description, data rows and a
/// terminating message.
fn take_result_set(
    responses: &mut VecDeque<RegularMessage>,
    columns: Option<&[Bytes]>,
    terminals: &[u8],
) -> Take<RegularMessage> {
    let mut end = None;
    for (i, msg) in responses.iter().enumerate() {
        if terminals.contains(&msg.tag) {
            end = Some(i);
            break;
        }
        let in_group = matches!(
            msg.tag,
            tag::ROW_DESC
                | tag::DATA_ROW
                | tag::COPY_IN_RESPONSE
                | tag::COPY_OUT_RESPONSE
                | tag::COPY_BOTH_RESPONSE
                | tag::COPY_DATA
                | tag::COPY_DONE
        ) || is_async_response(msg.tag);
        if !in_group {
            return Take::Mismatch;
        }
    }
    let Some(end) = end else {
        return Take::Pending;
    };

    let group: Vec<RegularMessage> = responses.drain(..=end).collect();
    match assemble_result_set(&group, columns) {
        Ok(resp) => Take::Done(resp),
        Err(err) => Take::Malformed(err),
    }
}

fn assemble_result_set(
    group: &[RegularMessage],
    columns: Option<&[Bytes]>,
) -> Result<RegularMessage, ProtocolError> {
    let mut out = BytesMut::new();
    let mut header_written = false;
    if let Some(columns) = columns.filter(|c| !c.is_empty()) {
        push_line(&mut out, columns.iter().cloned());
        header_written = true;
    }

    let mut terminal = None;
    for msg in group {
        match msg.tag {
            tag::ROW_DESC if !header_written => {
                push_line(&mut out, parse_row_desc(&msg.payload)?.into_iter());
                header_written = true;
            }
            tag::DATA_ROW => {
                let values = parse_data_row(&msg.payload)?;
                push_line(
                    &mut out,
                    values
                        .into_iter()
                        .map(|v| v.unwrap_or_else(|| Bytes::from_static(NULL_SENTINEL))),
                );
            }
            tag::CMD_COMPLETE | tag::EMPTY_QUERY_RESPONSE | tag::PORTAL_SUSPENDED => {
                if !msg.payload.is_empty() {
                    push_line(&mut out, std::iter::once(msg.text()));
                }
                terminal = Some(msg);
            }
            tag::ERROR_RESPONSE => {
                push_line(&mut out, std::iter::once(render_error(&msg.payload)?));
                terminal = Some(msg);
            }
            _ => {}
        }
    }

    let terminal = terminal.ok_or_else(|| ProtocolError::InvalidField {
        protocol: PROTOCOL,
        field: "response",
        reason: "missing terminating message".to_string(),
    })?;
    let first_ts = group.first().map_or(0, |m| m.timestamp_ns);
    Ok(RegularMessage {
        timestamp_ns: first_ts,
        tag: terminal.tag,
        len: terminal.len,
        payload: out.freeze(),
    })
}

/// Single-message reply (ParseComplete, BindComplete, ...), or an error.
fn take_single(responses: &mut VecDeque<RegularMessage>, expected: u8) -> Take<RegularMessage> {
    match responses.front().map(|m| m.tag) {
        None => Take::Pending,
        Some(t) if t == expected || t == tag::ERROR_RESPONSE => {
            responses.pop_front().map_or(Take::Pending, Take::Done)
        }
        Some(_) => Take::Mismatch,
    }
}

/// Reply to Describe: optional ParameterDescription, then RowDescription or
/// NoData.
fn take_describe(responses: &mut VecDeque<RegularMessage>) -> Take<RegularMessage> {
    let mut idx = 0;
    if responses.front().map(|m| m.tag) == Some(tag::PARAM_DESC) {
        idx = 1;
    }
    match responses.get(idx).map(|m| m.tag) {
        None => Take::Pending,
        Some(tag::ROW_DESC | tag::NO_DATA | tag::ERROR_RESPONSE) => {
            let mut group: Vec<RegularMessage> = responses.drain(..=idx).collect();
            match group.pop() {
                Some(last) => Take::Done(last),
                None => Take::Pending,
            }
        }
        Some(_) => Take::Mismatch,
    }
}

fn error_record(req: RegularMessage, resp: &RegularMessage) -> Result<Record, ProtocolError> {
    let payload = render_error(&resp.payload)?;
    Ok(Record {
        req,
        resp: RegularMessage {
            payload,
            ..resp.clone()
        },
    })
}

/// Zero-sized handler for PostgreSQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pgsql;

impl Pgsql {
    /// Handle the request at the head of the queue. Returns `false` when the
    /// stitcher must wait for more responses.
    fn stitch_one(
        requests: &mut VecDeque<RegularMessage>,
        responses: &mut VecDeque<RegularMessage>,
        state: &mut PgState,
        result: &mut RecordsWithErrorCount<Record>,
    ) -> bool {
        let Some(req) = requests.front() else {
            return false;
        };
        let req_tag = req.tag;

        let outcome = match req_tag {
            tag::QUERY => take_result_set(
                responses,
                None,
                &[
                    tag::CMD_COMPLETE,
                    tag::EMPTY_QUERY_RESPONSE,
                    tag::ERROR_RESPONSE,
                ],
            ),
            tag::EXECUTE => {
                let columns = state.portal.as_ref().map(|p| p.columns.clone());
                take_result_set(
                    responses,
                    columns.as_deref(),
                    &[
                        tag::CMD_COMPLETE,
                        tag::EMPTY_QUERY_RESPONSE,
                        tag::ERROR_RESPONSE,
                        tag::PORTAL_SUSPENDED,
                    ],
                )
            }
            tag::PARSE => take_single(responses, tag::PARSE_COMPLETE),
            tag::BIND => take_single(responses, tag::BIND_COMPLETE),
            tag::CLOSE => take_single(responses, tag::CLOSE_COMPLETE),
            tag::FUNCTION_CALL => take_single(responses, tag::FUNCTION_CALL_RESPONSE),
            tag::DESCRIBE => take_describe(responses),
            _ => {
                // Sync, Flush, Terminate, Startup, Password, Copy*
                requests.pop_front();
                return true;
            }
        };

        let resp = match outcome {
            Take::Pending => return false,
            Take::Mismatch => {
                trace!(tag = req_tag, "request dropped without a matching response");
                requests.pop_front();
                result.error_count += 1;
                return true;
            }
            Take::Malformed(err) => {
                debug!(%err, "malformed response dropped");
                requests.pop_front();
                result.error_count += 1;
                return true;
            }
            Take::Done(resp) => resp,
        };
        let Some(req) = requests.pop_front() else {
            return false;
        };

        match Self::complete(req, resp, state) {
            Ok(Some(record)) => result.records.push(record),
            Ok(None) => {}
            Err(err) => {
                debug!(%err, "failed to decode request");
                result.error_count += 1;
            }
        }
        true
    }

    /// Apply a request/response pair to the state, producing a record for
    /// exchanges that carry a statement.
    fn complete(
        req: RegularMessage,
        resp: RegularMessage,
        state: &mut PgState,
    ) -> Result<Option<Record>, ProtocolError> {
        let failed = resp.tag == tag::ERROR_RESPONSE;
        match req.tag {
            tag::QUERY => {
                let req = RegularMessage {
                    payload: req.text(),
                    ..req
                };
                Ok(Some(Record { req, resp }))
            }
            tag::EXECUTE => {
                let query = state
                    .portal
                    .as_ref()
                    .map(|p| p.query.clone())
                    .unwrap_or_default();
                let req = RegularMessage {
                    payload: query,
                    ..req
                };
                Ok(Some(Record { req, resp }))
            }
            tag::PARSE => {
                let (name, query) = parse_parse(&req.payload)?;
                if failed {
                    let req = RegularMessage {
                        payload: query,
                        ..req
                    };
                    return error_record(req, &resp).map(Some);
                }
                state.insert_statement(
                    name,
                    Statement {
                        query,
                        columns: Vec::new(),
                    },
                );
                Ok(None)
            }
            tag::DESCRIBE => {
                let (kind, name) = parse_describe(&req.payload)?;
                if resp.tag != tag::ROW_DESC {
                    return Ok(None);
                }
                let columns = parse_row_desc(&resp.payload)?;
                if kind == b'S' {
                    if let Some(statement) = state.statements.get_mut(&name) {
                        statement.columns = columns;
                    }
                } else if let Some(portal) = state.portal.as_mut() {
                    portal.columns = columns;
                }
                Ok(None)
            }
            tag::BIND => {
                let (_portal, statement) = parse_bind(&req.payload)?;
                let bound = state.statements.get(&statement).cloned();
                if failed {
                    let query = bound.map(|s| s.query).unwrap_or_default();
                    let req = RegularMessage {
                        payload: query,
                        ..req
                    };
                    return error_record(req, &resp).map(Some);
                }
                state.portal = Some(bound.unwrap_or_default());
                Ok(None)
            }
            tag::CLOSE => {
                let (kind, name) = parse_describe(&req.payload)?;
                if kind == b'S' && !failed {
                    state.statements.remove(&name);
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

impl ProtocolHandler for Pgsql {
    const PROTOCOL: Protocol = Protocol::Pgsql;

    type Frame = RegularMessage;
    type Key = u32;
    type State = PgState;
    type Record = Record;

    fn parse_frame(
        message_type: MessageType,
        buf: &[u8],
        _state: &mut PgState,
    ) -> FrameParseResult<RegularMessage> {
        parse_message(message_type, buf)
    }

    fn find_frame_boundary(
        message_type: MessageType,
        buf: &[u8],
        start_pos: usize,
        _state: &PgState,
    ) -> Option<usize> {
        scan_boundary(buf, start_pos, |candidate| {
            let Some(total) = regular_message_size(message_type, candidate) else {
                return false;
            };
            if total > candidate.len() {
                return false;
            }
            // A following message, when present, must also start with a valid tag.
            candidate
                .get(total)
                .map_or(true, |&next| is_valid_tag(message_type, next))
        })
    }

    fn stream_key(_frame: &RegularMessage) -> u32 {
        0
    }

    fn stitch_frames(
        requests: &mut VecDeque<RegularMessage>,
        responses: &mut VecDeque<RegularMessage>,
        state: &mut PgState,
    ) -> RecordsWithErrorCount<Record> {
        let mut result = RecordsWithErrorCount::new();

        loop {
            let Some(req_ts) = requests.front().map(|r| r.timestamp_ns) else {
                break;
            };
            // Async backend noise and responses older than the request
            while let Some(front) = responses.front() {
                if is_async_response(front.tag) {
                    responses.pop_front();
                } else if front.timestamp_ns < req_ts {
                    trace!(tag = front.tag, "response older than pending request dropped");
                    responses.pop_front();
                    result.error_count += 1;
                } else {
                    break;
                }
            }
            if !Self::stitch_one(requests, responses, state, &mut result) {
                break;
            }
        }

        if requests.is_empty() {
            for resp in responses.drain(..) {
                if !is_async_response(resp.tag) {
                    trace!(tag = resp.tag, "response without a pending request");
                    result.error_count += 1;
                }
            }
        }

        result
    }
}

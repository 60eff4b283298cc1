//! Cassandra native protocol (CQL binary, v3 to v5).

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tracing::debug;

use crate::error::ProtocolError;
use crate::stream::decode::Decoder;
use crate::stream::parser::{scan_boundary, stitch_in_order};
use crate::stream::{
    Exchange, FrameBase, FrameParseResult, MessageType, Protocol, ProtocolHandler,
    RecordsWithErrorCount,
};

const PROTOCOL: &str = "cql";

pub const HEADER_LEN: usize = 9;
const MAX_BODY_LEN: usize = 256 * 1024 * 1024;
const RESPONSE_FLAG: u8 = 0x80;
const MAX_PREPARED: usize = 1024;
const MAX_TYPE_DEPTH: usize = 16;

/// CQL opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Error,
    Startup,
    Ready,
    Authenticate,
    Options,
    Supported,
    Query,
    Result,
    Prepare,
    Execute,
    Register,
    Event,
    Batch,
    AuthChallenge,
    AuthResponse,
    AuthSuccess,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x09 => Opcode::Prepare,
            0x0A => Opcode::Execute,
            0x0B => Opcode::Register,
            0x0C => Opcode::Event,
            0x0D => Opcode::Batch,
            0x0E => Opcode::AuthChallenge,
            0x0F => Opcode::AuthResponse,
            0x10 => Opcode::AuthSuccess,
            _ => return None,
        })
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Opcode::Startup
                | Opcode::Options
                | Opcode::Query
                | Opcode::Prepare
                | Opcode::Execute
                | Opcode::Register
                | Opcode::Batch
                | Opcode::AuthResponse
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Opcode::Error => "ERROR",
            Opcode::Startup => "STARTUP",
            Opcode::Ready => "READY",
            Opcode::Authenticate => "AUTHENTICATE",
            Opcode::Options => "OPTIONS",
            Opcode::Supported => "SUPPORTED",
            Opcode::Query => "QUERY",
            Opcode::Result => "RESULT",
            Opcode::Prepare => "PREPARE",
            Opcode::Execute => "EXECUTE",
            Opcode::Register => "REGISTER",
            Opcode::Event => "EVENT",
            Opcode::Batch => "BATCH",
            Opcode::AuthChallenge => "AUTH_CHALLENGE",
            Opcode::AuthResponse => "AUTH_RESPONSE",
            Opcode::AuthSuccess => "AUTH_SUCCESS",
        }
    }
}

/// One CQL frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub timestamp_ns: u64,
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
    pub opcode: Opcode,
    pub body: Bytes,
}

impl FrameBase for Frame {
    fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    fn set_timestamp_ns(&mut self, timestamp_ns: u64) {
        self.timestamp_ns = timestamp_ns;
    }

    fn byte_size(&self) -> usize {
        HEADER_LEN + self.body.len()
    }
}

/// Rendered side of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub timestamp_ns: u64,
    pub opcode: Opcode,
    pub msg: Bytes,
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
        self.req.msg.clone()
    }

    fn resp_payload(&self) -> Bytes {
        self.resp.msg.clone()
    }
}

/// Prepared statement ids learned from PREPARE results.
#[derive(Debug, Default)]
pub struct CqlState {
    prepared: HashMap<Bytes, Bytes>,
}

/// Validate a header; returns the body length.
fn header_body_len(message_type: MessageType, buf: &[u8]) -> Result<usize, &'static str> {
    let version = buf[0];
    let is_response = version & RESPONSE_FLAG != 0;
    if is_response != (message_type == MessageType::Response) {
        return Err("direction bit does not match");
    }
    if !(3..=5).contains(&(version & !RESPONSE_FLAG)) {
        return Err("unsupported protocol version");
    }
    let opcode = Opcode::from_u8(buf[4]).ok_or("unknown opcode")?;
    if opcode.is_request() != (message_type == MessageType::Request) {
        return Err("opcode not valid for direction");
    }
    let len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
    if len > MAX_BODY_LEN {
        return Err("body length out of range");
    }
    Ok(len)
}

fn read_string<'a>(dec: &mut Decoder<'a>) -> Result<&'a [u8], ProtocolError> {
    let len = dec.u16_be()? as usize;
    dec.bytes(len)
}

fn read_long_string<'a>(dec: &mut Decoder<'a>) -> Result<&'a [u8], ProtocolError> {
    let len = dec.i32_be()?;
    if len < 0 {
        return Err(dec.invalid("long string", len.to_string()));
    }
    dec.bytes(len as usize)
}

fn read_short_bytes<'a>(dec: &mut Decoder<'a>) -> Result<&'a [u8], ProtocolError> {
    read_string(dec)
}

/// Skip a `[option]` type descriptor.
fn skip_type_option(dec: &mut Decoder<'_>, depth: usize) -> Result<(), ProtocolError> {
    if depth > MAX_TYPE_DEPTH {
        return Err(dec.invalid("type", "nesting too deep"));
    }
    match dec.u16_be()? {
        0x0000 => {
            read_string(dec)?;
        }
        0x0020 | 0x0022 => skip_type_option(dec, depth + 1)?,
        0x0021 => {
            skip_type_option(dec, depth + 1)?;
            skip_type_option(dec, depth + 1)?;
        }
        0x0030 => {
            read_string(dec)?;
            read_string(dec)?;
            for _ in 0..dec.u16_be()? {
                read_string(dec)?;
                skip_type_option(dec, depth + 1)?;
            }
        }
        0x0031 => {
            for _ in 0..dec.u16_be()? {
                skip_type_option(dec, depth + 1)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Row count of a `Rows` result body (after the kind field).
fn rows_count(dec: &mut Decoder<'_>) -> Result<i32, ProtocolError> {
    const GLOBAL_TABLES_SPEC: i32 = 0x0001;
    const HAS_MORE_PAGES: i32 = 0x0002;
    const NO_METADATA: i32 = 0x0004;

    let flags = dec.i32_be()?;
    let columns = dec.i32_be()?;
    if flags & HAS_MORE_PAGES != 0 {
        let len = dec.i32_be()?;
        if len > 0 {
            dec.skip(len as usize)?;
        }
    }
    if flags & NO_METADATA == 0 {
        let global = flags & GLOBAL_TABLES_SPEC != 0;
        if global {
            read_string(dec)?;
            read_string(dec)?;
        }
        for _ in 0..columns.max(0) {
            if !global {
                read_string(dec)?;
                read_string(dec)?;
            }
            read_string(dec)?;
            skip_type_option(dec, 0)?;
        }
    }
    dec.i32_be()
}

fn render_request(frame: &Frame, state: &CqlState) -> Result<Bytes, ProtocolError> {
    let mut dec = Decoder::new(PROTOCOL, &frame.body);
    match frame.opcode {
        Opcode::Query | Opcode::Prepare => Ok(Bytes::copy_from_slice(read_long_string(&mut dec)?)),
        Opcode::Execute => {
            let id = read_short_bytes(&mut dec)?;
            Ok(state
                .prepared
                .get(id)
                .cloned()
                .unwrap_or_else(|| Bytes::from(format!("EXECUTE {}", hex(id)))))
        }
        Opcode::Startup => {
            let mut parts = Vec::new();
            for _ in 0..dec.u16_be()? {
                let key = String::from_utf8_lossy(read_string(&mut dec)?).into_owned();
                let value = String::from_utf8_lossy(read_string(&mut dec)?).into_owned();
                parts.push(format!("{}={}", key, value));
            }
            Ok(Bytes::from(parts.join(",")))
        }
        Opcode::Register => {
            let mut parts = Vec::new();
            for _ in 0..dec.u16_be()? {
                parts.push(String::from_utf8_lossy(read_string(&mut dec)?).into_owned());
            }
            Ok(Bytes::from(parts.join(",")))
        }
        Opcode::Batch => {
            let _kind = dec.u8()?;
            let count = dec.u16_be()?;
            Ok(Bytes::from(format!("BATCH of {} statements", count)))
        }
        _ => Ok(Bytes::new()),
    }
}

fn render_response(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut dec = Decoder::new(PROTOCOL, &frame.body);
    match frame.opcode {
        Opcode::Error => {
            let code = dec.i32_be()?;
            let message = String::from_utf8_lossy(read_string(&mut dec)?).into_owned();
            Ok(Bytes::from(format!("[{:#06x}] {}", code, message)))
        }
        Opcode::Result => {
            let text = match dec.i32_be()? {
                0x0001 => "Response type = VOID".to_string(),
                0x0002 => format!(
                    "Response type = ROWS\nNumber of rows = {}",
                    rows_count(&mut dec)?
                ),
                0x0003 => format!(
                    "Response type = SET_KEYSPACE\nKeyspace = {}",
                    String::from_utf8_lossy(read_string(&mut dec)?)
                ),
                0x0004 => "Response type = PREPARED".to_string(),
                0x0005 => "Response type = SCHEMA_CHANGE".to_string(),
                kind => return Err(dec.invalid("result kind", kind.to_string())),
            };
            Ok(Bytes::from(text))
        }
        Opcode::Authenticate => Ok(Bytes::copy_from_slice(read_string(&mut dec)?)),
        _ => Ok(Bytes::new()),
    }
}

/// Prepared id carried by a `Prepared` result, if any.
fn prepared_id(frame: &Frame) -> Option<Bytes> {
    if frame.opcode != Opcode::Result {
        return None;
    }
    let mut dec = Decoder::new(PROTOCOL, &frame.body);
    if dec.i32_be().ok()? != 0x0004 {
        return None;
    }
    read_short_bytes(&mut dec).ok().map(Bytes::copy_from_slice)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn rendered(result: Result<Bytes, ProtocolError>) -> Bytes {
    result.unwrap_or_else(|err| {
        debug!(%err, "failed to render CQL body");
        Bytes::new()
    })
}

/// Zero-sized handler for CQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cql;

impl ProtocolHandler for Cql {
    const PROTOCOL: Protocol = Protocol::Cql;

    type Frame = Frame;
    type Key = i16;
    type State = CqlState;
    type Record = Record;

    fn parse_frame(
        message_type: MessageType,
        buf: &[u8],
        _state: &mut CqlState,
    ) -> FrameParseResult<Frame> {
        if buf.len() < HEADER_LEN {
            return FrameParseResult::need(HEADER_LEN);
        }
        let body_len = match header_body_len(message_type, buf) {
            Ok(len) => len,
            Err(reason) => return FrameParseResult::invalid(reason),
        };
        let total = HEADER_LEN + body_len;
        if buf.len() < total {
            return FrameParseResult::need(total);
        }
        let Some(opcode) = Opcode::from_u8(buf[4]) else {
            return FrameParseResult::invalid("unknown opcode");
        };
        FrameParseResult::Complete {
            frame: Frame {
                timestamp_ns: 0,
                version: buf[0] & !RESPONSE_FLAG,
                flags: buf[1],
                stream: i16::from_be_bytes([buf[2], buf[3]]),
                opcode,
                body: Bytes::copy_from_slice(&buf[HEADER_LEN..total]),
            },
            bytes_consumed: total,
        }
    }

    fn find_frame_boundary(
        message_type: MessageType,
        buf: &[u8],
        start_pos: usize,
        _state: &CqlState,
    ) -> Option<usize> {
        scan_boundary(buf, start_pos, |candidate| {
            candidate.len() >= HEADER_LEN
                && header_body_len(message_type, candidate)
                    .is_ok_and(|len| HEADER_LEN + len <= candidate.len())
        })
    }

    fn stream_key(frame: &Frame) -> i16 {
        frame.stream
    }

    fn stitch_frames(
        requests: &mut VecDeque<Frame>,
        responses: &mut VecDeque<Frame>,
        state: &mut CqlState,
    ) -> RecordsWithErrorCount<Record> {
        // Server pushes are not replies to anything
        responses.retain(|resp| resp.opcode != Opcode::Event);

        stitch_in_order(PROTOCOL, requests, responses, |req, resp| {
            let req_msg = rendered(render_request(&req, state));
            if req.opcode == Opcode::Prepare {
                if let Some(id) = prepared_id(&resp) {
                    if state.prepared.len() >= MAX_PREPARED {
                        state.prepared.clear();
                    }
                    state.prepared.insert(id, req_msg.clone());
                }
            }
            Record {
                req: Message {
                    timestamp_ns: req.timestamp_ns,
                    opcode: req.opcode,
                    msg: req_msg,
                },
                resp: Message {
                    timestamp_ns: resp.timestamp_ns,
                    opcode: resp.opcode,
                    msg: rendered(render_response(&resp)),
                },
            }
        })
    }
}

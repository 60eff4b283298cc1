//! DNS messages.
//!
//! Messages are delimited by walking the header counts, questions and
//! resource records; no length prefix is expected.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use compact_str::CompactString;
use smallvec::SmallVec;

use crate::stream::parser::{scan_boundary, stitch_in_order};
use crate::stream::{
    Exchange, FrameBase, FrameParseResult, MessageType, Protocol, ProtocolHandler,
    RecordsWithErrorCount,
};

const PROTOCOL: &str = "dns";

const HEADER_LEN: usize = 12;
const MAX_SECTION_COUNT: u16 = 256;
const MAX_OPCODE: u8 = 5;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_JUMPS: usize = 32;

pub mod rr_type {
    pub const A: u16 = 1;
    pub const NS: u16 = 2;
    pub const CNAME: u16 = 5;
    pub const SOA: u16 = 6;
    pub const PTR: u16 = 12;
    pub const MX: u16 = 15;
    pub const TXT: u16 = 16;
    pub const AAAA: u16 = 28;
    pub const SRV: u16 = 33;
    pub const OPT: u16 = 41;
    pub const HTTPS: u16 = 65;

    pub fn name(rr_type: u16) -> &'static str {
        match rr_type {
            A => "A",
            NS => "NS",
            CNAME => "CNAME",
            SOA => "SOA",
            PTR => "PTR",
            MX => "MX",
            TXT => "TXT",
            AAAA => "AAAA",
            SRV => "SRV",
            OPT => "OPT",
            HTTPS => "HTTPS",
            _ => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub name: CompactString,
    pub rr_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerData {
    Addr(std::net::IpAddr),
    Cname(CompactString),
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub name: CompactString,
    pub rr_type: u16,
    pub data: AnswerData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub timestamp_ns: u64,
    pub txid: u16,
    pub flags: u16,
    pub queries: SmallVec<[Query; 2]>,
    pub answers: SmallVec<[Answer; 4]>,
    pub size: usize,
}

impl Message {
    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000f) as u8
    }

    /// JSON-like rendering of the questions or answers.
    pub fn render(&self, message_type: MessageType) -> Bytes {
        let mut out = String::new();
        match message_type {
            MessageType::Request => {
                out.push_str("{\"queries\": [");
                for (i, q) in self.queries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(
                        out,
                        "{{\"name\": \"{}\", \"type\": \"{}\"}}",
                        q.name,
                        rr_type::name(q.rr_type)
                    );
                }
            }
            MessageType::Response => {
                out.push_str("{\"answers\": [");
                let rendered = self.answers.iter().filter_map(|a| match &a.data {
                    AnswerData::Addr(addr) => Some(format!(
                        "{{\"name\": \"{}\", \"type\": \"{}\", \"addr\": \"{}\"}}",
                        a.name,
                        rr_type::name(a.rr_type),
                        addr
                    )),
                    AnswerData::Cname(cname) => Some(format!(
                        "{{\"name\": \"{}\", \"type\": \"CNAME\", \"cname\": \"{}\"}}",
                        a.name, cname
                    )),
                    AnswerData::Other => None,
                });
                for (i, entry) in rendered.enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&entry);
                }
            }
        }
        out.push_str("]}");
        Bytes::from(out)
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
        self.req.render(MessageType::Request)
    }

    fn resp_payload(&self) -> Bytes {
        self.resp.render(MessageType::Response)
    }
}

enum WalkError {
    Incomplete,
    Invalid(&'static str),
}

fn u16_at(buf: &[u8], pos: usize) -> Result<u16, WalkError> {
    match buf.get(pos..pos + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(WalkError::Incomplete),
    }
}

/// Decode the name at `pos`, following compression pointers.
///
/// Returns the dotted name and the position just past the name's encoding
/// at `pos` (a pointer ends the encoding).
fn read_name(buf: &[u8], pos: usize) -> Result<(CompactString, usize), WalkError> {
    let mut name = CompactString::default();
    let mut cur = pos;
    let mut end = None;
    let mut jumps = 0;

    loop {
        let Some(&len) = buf.get(cur) else {
            return Err(WalkError::Incomplete);
        };
        match len & 0xC0 {
            0xC0 => {
                let target = (u16_at(buf, cur)? & 0x3FFF) as usize;
                end.get_or_insert(cur + 2);
                jumps += 1;
                // Pointers must refer backwards
                if jumps > MAX_POINTER_JUMPS || target >= cur {
                    return Err(WalkError::Invalid("bad compression pointer"));
                }
                cur = target;
            }
            0x00 => {
                let len = len as usize;
                if len == 0 {
                    let end = end.unwrap_or(cur + 1);
                    return Ok((name, end));
                }
                if len > MAX_LABEL_LEN {
                    return Err(WalkError::Invalid("label too long"));
                }
                let Some(label) = buf.get(cur + 1..cur + 1 + len) else {
                    return Err(WalkError::Incomplete);
                };
                if !name.is_empty() {
                    name.push('.');
                }
                name.push_str(&String::from_utf8_lossy(label));
                if name.len() > MAX_NAME_LEN {
                    return Err(WalkError::Invalid("name too long"));
                }
                cur += 1 + len;
            }
            _ => return Err(WalkError::Invalid("reserved label type")),
        }
    }
}

fn walk_message(message_type: MessageType, buf: &[u8]) -> Result<Message, WalkError> {
    if buf.len() < HEADER_LEN {
        return Err(WalkError::Incomplete);
    }
    let txid = u16_at(buf, 0)?;
    let flags = u16_at(buf, 2)?;
    let is_response = flags & 0x8000 != 0;
    if is_response != (message_type == MessageType::Response) {
        return Err(WalkError::Invalid("QR bit does not match direction"));
    }
    if ((flags >> 11) & 0x0f) as u8 > MAX_OPCODE {
        return Err(WalkError::Invalid("unknown opcode"));
    }
    let counts = [u16_at(buf, 4)?, u16_at(buf, 6)?, u16_at(buf, 8)?, u16_at(buf, 10)?];
    if counts.iter().any(|&c| c > MAX_SECTION_COUNT) {
        return Err(WalkError::Invalid("implausible section count"));
    }

    let mut pos = HEADER_LEN;
    let mut queries = SmallVec::new();
    for _ in 0..counts[0] {
        let (name, after) = read_name(buf, pos)?;
        let rr_type = u16_at(buf, after)?;
        u16_at(buf, after + 2)?;
        queries.push(Query { name, rr_type });
        pos = after + 4;
    }

    let mut answers = SmallVec::new();
    let record_count = counts[1] as usize + counts[2] as usize + counts[3] as usize;
    for i in 0..record_count {
        let (name, after) = read_name(buf, pos)?;
        let rr_type = u16_at(buf, after)?;
        let rdlen = u16_at(buf, after + 8)? as usize;
        let rdata_start = after + 10;
        let Some(rdata) = buf.get(rdata_start..rdata_start + rdlen) else {
            return Err(WalkError::Incomplete);
        };
        // Only the answer section is rendered
        if i < counts[1] as usize {
            let data = match (rr_type, rdlen) {
                (rr_type::A, 4) => {
                    AnswerData::Addr(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).into())
                }
                (rr_type::AAAA, 16) => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(rdata);
                    AnswerData::Addr(Ipv6Addr::from(octets).into())
                }
                (rr_type::CNAME, _) => AnswerData::Cname(read_name(buf, rdata_start)?.0),
                _ => AnswerData::Other,
            };
            answers.push(Answer {
                name,
                rr_type,
                data,
            });
        }
        pos = rdata_start + rdlen;
    }

    Ok(Message {
        timestamp_ns: 0,
        txid,
        flags,
        queries,
        answers,
        size: pos,
    })
}

/// Zero-sized handler for DNS.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dns;

impl ProtocolHandler for Dns {
    const PROTOCOL: Protocol = Protocol::Dns;

    type Frame = Message;
    type Key = u16;
    type State = ();
    type Record = Record;

    fn parse_frame(
        message_type: MessageType,
        buf: &[u8],
        _state: &mut (),
    ) -> FrameParseResult<Message> {
        if buf.len() < HEADER_LEN {
            return FrameParseResult::need(HEADER_LEN);
        }
        match walk_message(message_type, buf) {
            Ok(message) => {
                let consumed = message.size;
                FrameParseResult::Complete {
                    frame: message,
                    bytes_consumed: consumed,
                }
            }
            Err(WalkError::Incomplete) => FrameParseResult::need_more(),
            Err(WalkError::Invalid(reason)) => FrameParseResult::invalid(reason),
        }
    }

    fn find_frame_boundary(
        message_type: MessageType,
        buf: &[u8],
        start_pos: usize,
        _state: &(),
    ) -> Option<usize> {
        scan_boundary(buf, start_pos, |candidate| {
            candidate.len() >= HEADER_LEN
                && matches!(
                    walk_message(message_type, candidate),
                    Ok(_) | Err(WalkError::Incomplete)
                )
        })
    }

    fn stream_key(frame: &Message) -> u16 {
        frame.txid
    }

    fn stitch_frames(
        requests: &mut VecDeque<Message>,
        responses: &mut VecDeque<Message>,
        _state: &mut (),
    ) -> RecordsWithErrorCount<Record> {
        stitch_in_order(PROTOCOL, requests, responses, |req, resp| Record { req, resp })
    }
}

//! MySQL client/server protocol.
//!
//! Every packet is a 3-byte little-endian payload length, a sequence id and
//! the payload. A command starts a new sequence at 0; the server's reply
//! continues it from 1.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tracing::trace;

use crate::error::ProtocolError;
use crate::stream::decode::{text, Decoder};
use crate::stream::parser::scan_boundary;
use crate::stream::{
    Exchange, FrameBase, FrameParseResult, MessageType, Protocol, ProtocolHandler,
    RecordsWithErrorCount,
};

const PROTOCOL: &str = "mysql";

const HEADER_LEN: usize = 4;
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FFFF;
const MAX_COLUMNS: u64 = 4096;
const MAX_PREPARED: usize = 1024;

pub mod command {
    pub const SLEEP: u8 = 0x00;
    pub const QUIT: u8 = 0x01;
    pub const INIT_DB: u8 = 0x02;
    pub const QUERY: u8 = 0x03;
    pub const FIELD_LIST: u8 = 0x04;
    pub const CREATE_DB: u8 = 0x05;
    pub const DROP_DB: u8 = 0x06;
    pub const REFRESH: u8 = 0x07;
    pub const SHUTDOWN: u8 = 0x08;
    pub const STATISTICS: u8 = 0x09;
    pub const PROCESS_INFO: u8 = 0x0a;
    pub const CONNECT: u8 = 0x0b;
    pub const PROCESS_KILL: u8 = 0x0c;
    pub const DEBUG: u8 = 0x0d;
    pub const PING: u8 = 0x0e;
    pub const TIME: u8 = 0x0f;
    pub const DELAYED_INSERT: u8 = 0x10;
    pub const CHANGE_USER: u8 = 0x11;
    pub const BINLOG_DUMP: u8 = 0x12;
    pub const TABLE_DUMP: u8 = 0x13;
    pub const CONNECT_OUT: u8 = 0x14;
    pub const REGISTER_SLAVE: u8 = 0x15;
    pub const STMT_PREPARE: u8 = 0x16;
    pub const STMT_EXECUTE: u8 = 0x17;
    pub const STMT_SEND_LONG_DATA: u8 = 0x18;
    pub const STMT_CLOSE: u8 = 0x19;
    pub const STMT_RESET: u8 = 0x1a;
    pub const SET_OPTION: u8 = 0x1b;
    pub const STMT_FETCH: u8 = 0x1c;
    pub const DAEMON: u8 = 0x1d;
    pub const BINLOG_DUMP_GTID: u8 = 0x1e;
    pub const RESET_CONNECTION: u8 = 0x1f;

    pub fn name(cmd: u8) -> &'static str {
        match cmd {
            SLEEP => "COM_SLEEP",
            QUIT => "COM_QUIT",
            INIT_DB => "COM_INIT_DB",
            QUERY => "COM_QUERY",
            FIELD_LIST => "COM_FIELD_LIST",
            CREATE_DB => "COM_CREATE_DB",
            DROP_DB => "COM_DROP_DB",
            REFRESH => "COM_REFRESH",
            SHUTDOWN => "COM_SHUTDOWN",
            STATISTICS => "COM_STATISTICS",
            PROCESS_INFO => "COM_PROCESS_INFO",
            CONNECT => "COM_CONNECT",
            PROCESS_KILL => "COM_PROCESS_KILL",
            DEBUG => "COM_DEBUG",
            PING => "COM_PING",
            TIME => "COM_TIME",
            DELAYED_INSERT => "COM_DELAYED_INSERT",
            CHANGE_USER => "COM_CHANGE_USER",
            BINLOG_DUMP => "COM_BINLOG_DUMP",
            TABLE_DUMP => "COM_TABLE_DUMP",
            CONNECT_OUT => "COM_CONNECT_OUT",
            REGISTER_SLAVE => "COM_REGISTER_SLAVE",
            STMT_PREPARE => "COM_STMT_PREPARE",
            STMT_EXECUTE => "COM_STMT_EXECUTE",
            STMT_SEND_LONG_DATA => "COM_STMT_SEND_LONG_DATA",
            STMT_CLOSE => "COM_STMT_CLOSE",
            STMT_RESET => "COM_STMT_RESET",
            SET_OPTION => "COM_SET_OPTION",
            STMT_FETCH => "COM_STMT_FETCH",
            DAEMON => "COM_DAEMON",
            BINLOG_DUMP_GTID => "COM_BINLOG_DUMP_GTID",
            RESET_CONNECTION => "COM_RESET_CONNECTION",
            _ => "COM_UNKNOWN",
        }
    }
}

const OK_HEADER: u8 = 0x00;
const EOF_HEADER: u8 = 0xFE;
const ERR_HEADER: u8 = 0xFF;

/// One wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub timestamp_ns: u64,
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    fn header(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    fn is_eof(&self) -> bool {
        self.header() == Some(EOF_HEADER) && self.payload.len() < 9
    }

    fn is_err(&self) -> bool {
        self.header() == Some(ERR_HEADER)
    }
}

impl FrameBase for Packet {
    fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    fn set_timestamp_ns(&mut self, timestamp_ns: u64) {
        self.timestamp_ns = timestamp_ns;
    }

    fn byte_size(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Rendered command or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub timestamp_ns: u64,
    pub msg: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub req: Message,
    pub resp: Option<Message>,
}

impl Exchange for Record {
    fn req_timestamp_ns(&self) -> Option<u64> {
        Some(self.req.timestamp_ns)
    }

    fn resp_timestamp_ns(&self) -> Option<u64> {
        self.resp.as_ref().map(|m| m.timestamp_ns)
    }

    fn req_payload(&self) -> Bytes {
        self.req.msg.clone()
    }

    fn resp_payload(&self) -> Bytes {
        self.resp.as_ref().map(|m| m.msg.clone()).unwrap_or_default()
    }
}

/// Prepared statement text by server-assigned id.
#[derive(Debug, Default)]
pub struct MysqlState {
    prepared: HashMap<u32, Bytes>,
}

fn read_lenenc(dec: &mut Decoder<'_>) -> Result<u64, ProtocolError> {
    match dec.u8()? {
        n @ 0..=0xfa => Ok(n as u64),
        0xfc => Ok(dec.u16_le()? as u64),
        0xfd => Ok(dec.u24_le()? as u64),
        0xfe => dec.u64_le(),
        other => Err(dec.invalid("length-encoded integer", format!("{:#04x}", other))),
    }
}

/// Total size of the packet at the head of `buf` if its header is plausible.
fn packet_size(message_type: MessageType, buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], 0]) as usize;
    let seq = buf[3];
    if len == 0 {
        return None;
    }
    // A new command restarts the sequence and must name a known command
    if message_type == MessageType::Request
        && seq == 0
        && buf.get(HEADER_LEN).is_some_and(|&cmd| cmd > command::RESET_CONNECTION)
    {
        return None;
    }
    Some(HEADER_LEN + len)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Ok,
    Err,
    Eof,
    Text,
    ResultSet { rows: usize },
    Prepared { stmt_id: u32, columns: u16, params: u16 },
    FieldList { columns: usize },
}

enum Group {
    Pending,
    Complete { packets: usize, reply: Reply },
    Malformed(ProtocolError),
}

/// Statement id, column count and parameter count of a COM_STMT_PREPARE reply.
fn parse_prepare_ok(payload: &[u8]) -> Result<(u32, u16, u16), ProtocolError> {
    let mut dec = Decoder::new(PROTOCOL, payload);
    dec.skip(1)?;
    Ok((dec.u32_le()?, dec.u16_le()?, dec.u16_le()?))
}

/// Locate the end of the reply to `cmd` at the head of `responses`.
fn response_group(cmd: u8, responses: &VecDeque<Packet>) -> Group {
    let Some(first) = responses.front() else {
        return Group::Pending;
    };
    let single = |reply| Group::Complete { packets: 1, reply };

    match first.header() {
        None => return single(Reply::Text),
        Some(ERR_HEADER) => return single(Reply::Err),
        Some(OK_HEADER) if cmd == command::STMT_PREPARE => {
            let (stmt_id, columns, params) = match parse_prepare_ok(&first.payload) {
                Ok(v) => v,
                Err(err) => return Group::Malformed(err),
            };
            let section = |n: u16| if n > 0 { n as usize + 1 } else { 0 };
            let packets = 1 + section(params) + section(columns);
            if responses.len() < packets {
                return Group::Pending;
            }
            return Group::Complete {
                packets,
                reply: Reply::Prepared {
                    stmt_id,
                    columns,
                    params,
                },
            };
        }
        Some(OK_HEADER) => return single(Reply::Ok),
        Some(EOF_HEADER) if first.is_eof() => return single(Reply::Eof),
        _ => {}
    }

    match cmd {
        command::STATISTICS => single(Reply::Text),
        command::FIELD_LIST => match responses.iter().position(|p| p.is_eof() || p.is_err()) {
            Some(end) => Group::Complete {
                packets: end + 1,
                reply: Reply::FieldList { columns: end },
            },
            None => Group::Pending,
        },
        _ => {
            let mut dec = Decoder::new(PROTOCOL, &first.payload);
            let columns = match read_lenenc(&mut dec) {
                Ok(n) if (1..=MAX_COLUMNS).contains(&n) => n as usize,
                Ok(n) => return Group::Malformed(dec.invalid("column count", n.to_string())),
                Err(err) => return Group::Malformed(err),
            };
            let mut idx = 1 + columns;
            match responses.get(idx) {
                None => return Group::Pending,
                Some(p) if p.is_eof() => idx += 1,
                // Servers with CLIENT_DEPRECATE_EOF skip the delimiter
                Some(_) => {}
            }
            match responses
                .iter()
                .skip(idx)
                .position(|p| p.is_eof() || p.is_err())
            {
                Some(rows) => Group::Complete {
                    packets: idx + rows + 1,
                    reply: Reply::ResultSet { rows },
                },
                None => Group::Pending,
            }
        }
    }
}

fn render_request(packet: &Packet, state: &MysqlState) -> Bytes {
    let Some(&cmd) = packet.payload.first() else {
        return Bytes::new();
    };
    let body = packet.payload.slice(1..);
    match cmd {
        command::QUERY | command::STMT_PREPARE | command::INIT_DB => body,
        command::STMT_EXECUTE | command::STMT_CLOSE | command::STMT_RESET => {
            let mut dec = Decoder::new(PROTOCOL, &body);
            match dec.u32_le() {
                Ok(id) => state.prepared.get(&id).cloned().unwrap_or_else(|| {
                    Bytes::from(format!("{} stmt_id={}", command::name(cmd), id))
                }),
                Err(_) => Bytes::from_static(command::name(cmd).as_bytes()),
            }
        }
        _ => Bytes::from_static(command::name(cmd).as_bytes()),
    }
}

fn render_reply(reply: Reply, first: &Packet) -> Bytes {
    let rendered = match reply {
        Reply::Ok => "OK".to_string(),
        Reply::Eof => "EOF".to_string(),
        Reply::Text => text(&first.payload),
        Reply::Err => {
            let mut dec = Decoder::new(PROTOCOL, &first.payload);
            let code = dec.skip(1).and_then(|_| dec.u16_le()).unwrap_or(0);
            let mut message = dec.rest();
            // Skip the SQL state marker and code
            if message.first() == Some(&b'#') && message.len() >= 6 {
                message = &message[6..];
            }
            format!("ERR {}: {}", code, text(message))
        }
        Reply::ResultSet { rows } => format!("Resultset rows = {}", rows),
        Reply::FieldList { columns } => format!("Fields = {}", columns),
        Reply::Prepared {
            stmt_id,
            columns,
            params,
        } => format!(
            "PREPARE OK stmt_id={} columns={} params={}",
            stmt_id, columns, params
        ),
    };
    Bytes::from(rendered)
}

fn is_fire_and_forget(cmd: u8) -> bool {
    matches!(
        cmd,
        command::QUIT | command::STMT_CLOSE | command::STMT_SEND_LONG_DATA
    )
}

/// Zero-sized handler for MySQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mysql;

impl ProtocolHandler for Mysql {
    const PROTOCOL: Protocol = Protocol::Mysql;

    type Frame = Packet;
    type Key = u32;
    type State = MysqlState;
    type Record = Record;

    fn parse_frame(
        message_type: MessageType,
        buf: &[u8],
        _state: &mut MysqlState,
    ) -> FrameParseResult<Packet> {
        if buf.len() < HEADER_LEN + 1 {
            return FrameParseResult::need(HEADER_LEN + 1);
        }
        let Some(total) = packet_size(message_type, buf) else {
            return FrameParseResult::invalid("implausible packet header");
        };
        if buf.len() < total {
            return FrameParseResult::need(total);
        }
        FrameParseResult::Complete {
            frame: Packet {
                timestamp_ns: 0,
                sequence_id: buf[3],
                payload: Bytes::copy_from_slice(&buf[HEADER_LEN..total]),
            },
            bytes_consumed: total,
        }
    }

    fn find_frame_boundary(
        message_type: MessageType,
        buf: &[u8],
        start_pos: usize,
        _state: &MysqlState,
    ) -> Option<usize> {
        scan_boundary(buf, start_pos, |candidate| {
            // Resync only onto the start of a new command or reply
            let expected_seq = match message_type {
                MessageType::Request => 0,
                MessageType::Response => 1,
            };
            candidate.len() > HEADER_LEN
                && candidate[3] == expected_seq
                && packet_size(message_type, candidate)
                    .is_some_and(|total| total <= candidate.len())
        })
    }

    fn stream_key(_frame: &Packet) -> u32 {
        0
    }

    fn stitch_frames(
        requests: &mut VecDeque<Packet>,
        responses: &mut VecDeque<Packet>,
        state: &mut MysqlState,
    ) -> RecordsWithErrorCount<Record> {
        let mut result = RecordsWithErrorCount::new();

        loop {
            // Handshake and authentication packets are not commands
            while requests.front().is_some_and(|p| p.sequence_id != 0) {
                requests.pop_front();
            }
            let Some(req) = requests.front() else {
                break;
            };
            let req_ts = req.timestamp_ns;
            let cmd = req.payload.first().copied().unwrap_or(command::SLEEP);

            while let Some(front) = responses.front() {
                let stale = front.timestamp_ns < req_ts;
                if stale || front.sequence_id != 1 {
                    if front.sequence_id == 1 {
                        trace!("reply older than pending command dropped");
                        result.error_count += 1;
                    }
                    responses.pop_front();
                } else {
                    break;
                }
            }

            if is_fire_and_forget(cmd) {
                if let Some(req) = requests.pop_front() {
                    result.records.push(Record {
                        req: Message {
                            timestamp_ns: req.timestamp_ns,
                            msg: render_request(&req, state),
                        },
                        resp: None,
                    });
                    if cmd == command::STMT_CLOSE {
                        forget_statement(&req, state);
                    }
                }
                continue;
            }

            let (packets, reply) = match response_group(cmd, responses) {
                Group::Pending => break,
                Group::Malformed(err) => {
                    trace!(%err, "malformed reply dropped");
                    requests.pop_front();
                    responses.pop_front();
                    result.error_count += 1;
                    continue;
                }
                Group::Complete { packets, reply } => (packets, reply),
            };

            let group: Vec<Packet> = responses.drain(..packets).collect();
            let Some(req) = requests.pop_front() else {
                break;
            };
            let Some(first) = group.first() else {
                continue;
            };

            let req_msg = render_request(&req, state);
            if let Reply::Prepared { stmt_id, .. } = reply {
                if state.prepared.len() >= MAX_PREPARED {
                    state.prepared.clear();
                }
                state.prepared.insert(stmt_id, req_msg.clone());
            }
            result.records.push(Record {
                req: Message {
                    timestamp_ns: req.timestamp_ns,
                    msg: req_msg,
                },
                resp: Some(Message {
                    timestamp_ns: first.timestamp_ns,
                    msg: render_reply(reply, first),
                }),
            });
        }

        if requests.is_empty() {
            for resp in responses.drain(..) {
                if resp.sequence_id == 1 {
                    trace!("reply without a pending command");
                    result.error_count += 1;
                }
            }
        }

        result
    }
}

fn forget_statement(req: &Packet, state: &mut MysqlState) {
    let mut dec = Decoder::new(PROTOCOL, &req.payload);
    if let Ok(id) = dec.skip(1).and_then(|_| dec.u32_le()) {
        state.prepared.remove(&id);
    }
}

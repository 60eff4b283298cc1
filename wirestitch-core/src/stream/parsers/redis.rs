//! Redis serialization protocol (RESP2).

use std::collections::VecDeque;
use std::fmt::Write as _;

use bytes::Bytes;
use compact_str::CompactString;
use tracing::trace;

use crate::stream::parser::scan_boundary;
use crate::stream::{
    Exchange, FrameBase, FrameParseResult, MessageType, Protocol, ProtocolHandler,
    RecordsWithErrorCount,
};

const PROTOCOL: &str = "redis";

pub const MAX_DEPTH: usize = 16;
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
const MAX_ARRAY_LEN: i64 = 1 << 20;
const MAX_LINE_LEN: usize = 64 * 1024;

/// Commands whose first argument is a subcommand.
const CONTAINER_COMMANDS: &[&str] = &[
    "ACL", "CLIENT", "CLUSTER", "COMMAND", "CONFIG", "DEBUG", "FUNCTION", "LATENCY", "MEMORY",
    "MODULE", "OBJECT", "PUBSUB", "SCRIPT", "SLOWLOG", "XGROUP", "XINFO",
];

const SUBSCRIBE_COMMANDS: &[&str] = &["SUBSCRIBE", "PSUBSCRIBE", "SSUBSCRIBE"];
const SUBSCRIBE_CONFIRMATIONS: &[&[u8]] = &[
    b"subscribe",
    b"psubscribe",
    b"ssubscribe",
    b"unsubscribe",
    b"punsubscribe",
    b"sunsubscribe",
];

pub const PUSH_PUB: &str = "PUSH PUB";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Simple(Bytes),
    Error(Bytes),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<Value>>),
}

impl Value {
    fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            Value::Bulk(Some(b)) => Some(b),
            _ => None,
        }
    }

    fn render(&self, out: &mut String) {
        match self {
            Value::Simple(s) | Value::Error(s) | Value::Bulk(Some(s)) => {
                out.push_str(&String::from_utf8_lossy(s))
            }
            Value::Integer(n) => {
                let _ = write!(out, "{}", n);
            }
            Value::Bulk(None) | Value::Array(None) => out.push_str("<NULL>"),
            Value::Array(Some(items)) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.render(out);
                }
                out.push(']');
            }
        }
    }
}

enum ParseError {
    Incomplete(Option<usize>),
    Invalid(&'static str),
}

fn read_line(buf: &[u8], pos: usize) -> Result<(&[u8], usize), ParseError> {
    let rest = buf.get(pos..).unwrap_or_default();
    match rest.windows(2).position(|w| w == b"\r\n") {
        Some(end) => Ok((&rest[..end], pos + end + 2)),
        None if rest.len() > MAX_LINE_LEN => Err(ParseError::Invalid("line too long")),
        None => Err(ParseError::Incomplete(None)),
    }
}

fn parse_int(line: &[u8]) -> Result<i64, ParseError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ParseError::Invalid("malformed integer"))
}

/// Parse one value starting at `pos`; returns it with the position after it.
fn parse_value(buf: &[u8], pos: usize, depth: usize) -> Result<(Value, usize), ParseError> {
    if depth > MAX_DEPTH {
        return Err(ParseError::Invalid("nesting too deep"));
    }
    let Some(&type_byte) = buf.get(pos) else {
        return Err(ParseError::Incomplete(Some(pos + 1)));
    };
    if !matches!(type_byte, b'+' | b'-' | b':' | b'$' | b'*') {
        return Err(ParseError::Invalid("unknown type byte"));
    }
    let (line, next) = read_line(buf, pos + 1)?;

    match type_byte {
        b'+' => Ok((Value::Simple(Bytes::copy_from_slice(line)), next)),
        b'-' => Ok((Value::Error(Bytes::copy_from_slice(line)), next)),
        b':' => Ok((Value::Integer(parse_int(line)?), next)),
        b'$' => match parse_int(line)? {
            -1 => Ok((Value::Bulk(None), next)),
            n if (0..=MAX_BULK_LEN).contains(&n) => {
                let end = next + n as usize;
                if buf.len() < end + 2 {
                    return Err(ParseError::Incomplete(Some(end + 2)));
                }
                if &buf[end..end + 2] != b"\r\n" {
                    return Err(ParseError::Invalid("bulk string not terminated"));
                }
                Ok((Value::Bulk(Some(Bytes::copy_from_slice(&buf[next..end]))), end + 2))
            }
            _ => Err(ParseError::Invalid("bad bulk length")),
        },
        _ => match parse_int(line)? {
            -1 => Ok((Value::Array(None), next)),
            n if (0..=MAX_ARRAY_LEN).contains(&n) => {
                let mut items = Vec::with_capacity((n as usize).min(64));
                let mut cur = next;
                for _ in 0..n {
                    let (item, after) = parse_value(buf, cur, depth + 1)?;
                    items.push(item);
                    cur = after;
                }
                Ok((Value::Array(Some(items)), cur))
            }
            _ => Err(ParseError::Invalid("bad array length")),
        },
    }
}

/// A parsed command or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub timestamp_ns: u64,
    /// Upper-cased command name; empty for replies.
    pub command: CompactString,
    pub value: Value,
    pub size: usize,
}

impl Message {
    /// Argument count after the command name.
    fn arg_count(&self) -> usize {
        match &self.value {
            Value::Array(Some(items)) => items.len().saturating_sub(1),
            _ => 0,
        }
    }

    fn leading_bulk(&self) -> Option<&Bytes> {
        match &self.value {
            Value::Array(Some(items)) => items.first().and_then(Value::as_bulk),
            _ => None,
        }
    }

    /// Published message delivered to a subscriber.
    fn is_push(&self) -> bool {
        match &self.value {
            Value::Array(Some(items)) => match items.first().and_then(Value::as_bulk) {
                Some(kind) if &kind[..] == b"message" || &kind[..] == b"smessage" => {
                    items.len() == 3
                }
                Some(kind) if &kind[..] == b"pmessage" => items.len() == 4,
                _ => false,
            },
            _ => false,
        }
    }

    fn is_subscribe_confirmation(&self) -> bool {
        self.leading_bulk()
            .is_some_and(|kind| SUBSCRIBE_CONFIRMATIONS.contains(&&kind[..]))
    }

    pub fn render(&self) -> Bytes {
        let mut out = String::new();
        match &self.value {
            Value::Array(Some(items)) if !self.command.is_empty() => {
                out.push_str(&self.command);
                let skip = self.command.split(' ').count();
                for item in items.iter().skip(skip) {
                    out.push(' ');
                    item.render(&mut out);
                }
            }
            value => value.render(&mut out),
        }
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
        self.req.render()
    }

    fn resp_payload(&self) -> Bytes {
        self.resp.render()
    }
}

/// Subscription confirmations still owed by the server.
#[derive(Debug, Default)]
pub struct RedisState {
    pending_confirmations: usize,
}

fn command_name(items: &[Value]) -> Option<CompactString> {
    let first = items.first()?.as_bulk()?;
    let mut name = CompactString::from(String::from_utf8_lossy(first).to_ascii_uppercase());
    if CONTAINER_COMMANDS.contains(&name.as_str()) {
        if let Some(sub) = items.get(1).and_then(Value::as_bulk) {
            name.push(' ');
            name.push_str(&String::from_utf8_lossy(sub).to_ascii_uppercase());
        }
    }
    Some(name)
}

fn synthetic_push_request(timestamp_ns: u64) -> Message {
    Message {
        timestamp_ns,
        command: CompactString::const_new(PUSH_PUB),
        value: Value::Array(Some(Vec::new())),
        size: 0,
    }
}

/// Zero-sized handler for Redis.
#[derive(Debug, Clone, Copy, Default)]
pub struct Redis;

impl ProtocolHandler for Redis {
    const PROTOCOL: Protocol = Protocol::Redis;

    type Frame = Message;
    type Key = u32;
    type State = RedisState;
    type Record = Record;

    fn parse_frame(
        message_type: MessageType,
        buf: &[u8],
        _state: &mut RedisState,
    ) -> FrameParseResult<Message> {
        if buf.is_empty() {
            return FrameParseResult::need(1);
        }
        let (value, consumed) = match parse_value(buf, 0, 0) {
            Ok(parsed) => parsed,
            Err(ParseError::Incomplete(Some(n))) => return FrameParseResult::need(n),
            Err(ParseError::Incomplete(None)) => return FrameParseResult::need_more(),
            Err(ParseError::Invalid(reason)) => return FrameParseResult::invalid(reason),
        };

        let command = match (message_type, &value) {
            (MessageType::Request, Value::Array(Some(items))) => {
                if !items.iter().all(|item| item.as_bulk().is_some()) {
                    return FrameParseResult::invalid("command arguments must be bulk strings");
                }
                match command_name(items) {
                    Some(name) => name,
                    None => return FrameParseResult::invalid("empty command"),
                }
            }
            (MessageType::Request, _) => {
                return FrameParseResult::invalid("command is not an array")
            }
            (MessageType::Response, _) => CompactString::default(),
        };

        FrameParseResult::Complete {
            frame: Message {
                timestamp_ns: 0,
                command,
                value,
                size: consumed,
            },
            bytes_consumed: consumed,
        }
    }

    fn find_frame_boundary(
        message_type: MessageType,
        buf: &[u8],
        start_pos: usize,
        _state: &RedisState,
    ) -> Option<usize> {
        scan_boundary(buf, start_pos, |candidate| {
            let starts_ok = match message_type {
                MessageType::Request => candidate.first() == Some(&b'*'),
                MessageType::Response => {
                    matches!(candidate.first(), Some(b'+' | b'-' | b':' | b'$' | b'*'))
                }
            };
            starts_ok && !matches!(parse_value(candidate, 0, 0), Err(ParseError::Invalid(_)))
        })
    }

    fn stream_key(_frame: &Message) -> u32 {
        0
    }

    fn stitch_frames(
        requests: &mut VecDeque<Message>,
        responses: &mut VecDeque<Message>,
        state: &mut RedisState,
    ) -> RecordsWithErrorCount<Record> {
        let mut result = RecordsWithErrorCount::new();

        while let Some(resp) = responses.pop_front() {
            if resp.is_push() {
                result.records.push(Record {
                    req: synthetic_push_request(resp.timestamp_ns),
                    resp,
                });
                continue;
            }
            if state.pending_confirmations > 0 && resp.is_subscribe_confirmation() {
                state.pending_confirmations -= 1;
                continue;
            }

            let matched = requests
                .front()
                .is_some_and(|req| req.timestamp_ns <= resp.timestamp_ns);
            if !matched {
                trace!(protocol = PROTOCOL, ts = resp.timestamp_ns, "unmatched response dropped");
                result.error_count += 1;
                continue;
            }
            let Some(req) = requests.pop_front() else {
                continue;
            };
            if SUBSCRIBE_COMMANDS.contains(&req.command.as_str()) {
                state.pending_confirmations += req.arg_count().saturating_sub(1);
            }
            result.records.push(Record { req, resp });
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_bytes(args: &[&str]) -> Vec<u8> {
        let mut out = format!("*{}\r\n", args.len()).into_bytes();
        for arg in args {
            out.extend(format!("${}\r\n{}\r\n", arg.len(), arg).into_bytes());
        }
        out
    }

    fn parse(message_type: MessageType, data: &[u8], ts: u64) -> Message {
        let mut state = RedisState::default();
        match Redis::parse_frame(message_type, data, &mut state) {
            FrameParseResult::Complete {
                mut frame,
                bytes_consumed,
            } => {
                assert_eq!(bytes_consumed, data.len());
                frame.timestamp_ns = ts;
                frame
            }
            _ => panic!("Expected Complete"),
        }
    }

    #[test]
    fn test_parse_command() {
        let msg = parse(MessageType::Request, &command_bytes(&["set", "key", "value"]), 0);
        assert_eq!(msg.command, "SET");
        assert_eq!(msg.render(), Bytes::from("SET key value"));
    }

    #[test]
    fn test_parse_container_command() {
        let msg = parse(
            MessageType::Request,
            &command_bytes(&["config", "get", "maxmemory"]),
            0,
        );
        assert_eq!(msg.command, "CONFIG GET");
        assert_eq!(msg.render(), Bytes::from("CONFIG GET maxmemory"));
    }

    #[test]
    fn test_parse_replies() {
        assert_eq!(
            parse(MessageType::Response, b"+OK\r\n", 0).render(),
            Bytes::from("OK")
        );
        assert_eq!(
            parse(MessageType::Response, b":42\r\n", 0).render(),
            Bytes::from("42")
        );
        assert_eq!(
            parse(MessageType::Response, b"$-1\r\n", 0).render(),
            Bytes::from("<NULL>")
        );
        assert_eq!(
            parse(MessageType::Response, b"*2\r\n$1\r\na\r\n*1\r\n:1\r\n", 0).render(),
            Bytes::from("[a, [1]]")
        );
    }

    #[test]
    fn test_parse_need_more() {
        let data = command_bytes(&["get", "key"]);
        let mut state = RedisState::default();
        for cut in [1, 5, data.len() - 1] {
            let result = Redis::parse_frame(MessageType::Request, &data[..cut], &mut state);
            assert!(
                matches!(result, FrameParseResult::NeedMore { .. }),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_parse_depth_limit() {
        let mut data = Vec::new();
        for _ in 0..=MAX_DEPTH + 1 {
            data.extend_from_slice(b"*1\r\n");
        }
        data.extend_from_slice(b":1\r\n");
        let mut state = RedisState::default();
        let result = Redis::parse_frame(MessageType::Response, &data, &mut state);
        assert!(matches!(result, FrameParseResult::Invalid { .. }));
    }

    #[test]
    fn test_parse_inline_request_rejected() {
        let mut state = RedisState::default();
        let result = Redis::parse_frame(MessageType::Request, b"+PING\r\n", &mut state);
        assert!(matches!(result, FrameParseResult::Invalid { .. }));
    }

    #[test]
    fn test_find_frame_boundary() {
        let state = RedisState::default();
        let mut data = b"garbage".to_vec();
        data.extend(command_bytes(&["ping"]));
        assert_eq!(
            Redis::find_frame_boundary(MessageType::Request, &data, 0, &state),
            Some(7)
        );
    }

    // Test 1: In-order pairing
    #[test]
    fn test_stitch_in_order() {
        let mut state = RedisState::default();
        let mut reqs = VecDeque::from([
            parse(MessageType::Request, &command_bytes(&["set", "a", "1"]), 1),
            parse(MessageType::Request, &command_bytes(&["get", "a"]), 2),
        ]);
        let mut resps = VecDeque::from([
            parse(MessageType::Response, b"+OK\r\n", 3),
            parse(MessageType::Response, b"$1\r\n1\r\n", 4),
        ]);

        let result = Redis::stitch_frames(&mut reqs, &mut resps, &mut state);

        assert_eq!(result.error_count, 0);
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[1].req_payload(), Bytes::from("GET a"));
        assert_eq!(result.records[1].resp_payload(), Bytes::from("1"));
    }

    // Test 2: Subscription confirmations and published messages
    #[test]
    fn test_stitch_pubsub() {
        let mut state = RedisState::default();
        let mut reqs = VecDeque::from([parse(
            MessageType::Request,
            &command_bytes(&["subscribe", "foo", "bar"]),
            1,
        )]);
        let mut resps = VecDeque::from([
            parse(
                MessageType::Response,
                b"*3\r\n$9\r\nsubscribe\r\n$3\r\nfoo\r\n:1\r\n",
                2,
            ),
            parse(
                MessageType::Response,
                b"*3\r\n$9\r\nsubscribe\r\n$3\r\nbar\r\n:2\r\n",
                3,
            ),
            parse(
                MessageType::Response,
                b"*3\r\n$7\r\nmessage\r\n$3\r\nfoo\r\n$5\r\nhello\r\n",
                4,
            ),
        ]);

        let result = Redis::stitch_frames(&mut reqs, &mut resps, &mut state);

        assert_eq!(result.error_count, 0);
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[0].req_payload(), Bytes::from("SUBSCRIBE foo bar"));
        assert_eq!(result.records[1].req_payload(), Bytes::from(PUSH_PUB));
        assert_eq!(result.records[1].req_timestamp_ns(), Some(4));
        assert_eq!(
            result.records[1].resp_payload(),
            Bytes::from("[message, foo, hello]")
        );
    }

    #[test]
    fn test_stitch_orphan_response() {
        let mut state = RedisState::default();
        let mut reqs = VecDeque::new();
        let mut resps = VecDeque::from([parse(MessageType::Response, b"+OK\r\n", 1)]);

        let result = Redis::stitch_frames(&mut reqs, &mut resps, &mut state);

        assert!(result.records.is_empty());
        assert_eq!(result.error_count, 1);
    }
}

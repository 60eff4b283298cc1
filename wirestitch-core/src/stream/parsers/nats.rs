//! NATS client protocol.
//!
//! Every message starts with a CRLF-terminated control line. PUB, HPUB, MSG
//! and HMSG declare a payload size as their last argument; the payload is
//! followed by another CRLF.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use compact_str::CompactString;
use tracing::trace;

use crate::stream::parser::scan_boundary;
use crate::stream::{
    Exchange, FrameBase, FrameParseResult, MessageType, Protocol, ProtocolHandler,
    RecordsWithErrorCount,
};

const MAX_CONTROL_LINE: usize = 4096;
const MAX_PAYLOAD: usize = 64 * 1024 * 1024;
const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Info,
    Connect,
    Pub,
    Hpub,
    Sub,
    Unsub,
    Msg,
    Hmsg,
    Ping,
    Pong,
    Ok,
    Err,
}

impl Command {
    const ALL: [Command; 12] = [
        Command::Info,
        Command::Connect,
        Command::Pub,
        Command::Hpub,
        Command::Sub,
        Command::Unsub,
        Command::Msg,
        Command::Hmsg,
        Command::Ping,
        Command::Pong,
        Command::Ok,
        Command::Err,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Info => "INFO",
            Command::Connect => "CONNECT",
            Command::Pub => "PUB",
            Command::Hpub => "HPUB",
            Command::Sub => "SUB",
            Command::Unsub => "UNSUB",
            Command::Msg => "MSG",
            Command::Hmsg => "HMSG",
            Command::Ping => "PING",
            Command::Pong => "PONG",
            Command::Ok => "+OK",
            Command::Err => "-ERR",
        }
    }

    fn from_token(token: &[u8]) -> Option<Command> {
        Command::ALL
            .into_iter()
            .find(|c| c.as_str().as_bytes().eq_ignore_ascii_case(token))
    }

    /// Whether `message_type` may carry this command.
    pub fn valid_for(&self, message_type: MessageType) -> bool {
        match message_type {
            MessageType::Request => matches!(
                self,
                Command::Connect
                    | Command::Pub
                    | Command::Hpub
                    | Command::Sub
                    | Command::Unsub
                    | Command::Ping
                    | Command::Pong
            ),
            MessageType::Response => matches!(
                self,
                Command::Info
                    | Command::Msg
                    | Command::Hmsg
                    | Command::Ping
                    | Command::Pong
                    | Command::Ok
                    | Command::Err
            ),
        }
    }

    fn has_payload(&self) -> bool {
        matches!(
            self,
            Command::Pub | Command::Hpub | Command::Msg | Command::Hmsg
        )
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub timestamp_ns: u64,
    pub command: Command,
    /// Control line arguments after the command.
    pub options: CompactString,
    pub payload: Bytes,
    pub size: usize,
}

impl Message {
    pub fn render(&self) -> Bytes {
        let mut out = BytesMut::from(self.command.as_str().as_bytes());
        if !self.options.is_empty() {
            out.extend_from_slice(b" ");
            out.extend_from_slice(self.options.as_bytes());
        }
        if !self.payload.is_empty() {
            out.extend_from_slice(b"\n");
            out.extend_from_slice(&self.payload);
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
    pub req: Option<Message>,
    pub resp: Option<Message>,
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

/// Command at the head of `buf` and the length of its token, if the token is
/// complete and known.
fn leading_command(buf: &[u8]) -> Result<Option<(Command, usize)>, &'static str> {
    let end = buf.iter().position(|&b| b == b' ' || b == b'\t' || b == b'\r');
    let Some(end) = end else {
        // Token still incomplete; make sure it can still become a command.
        let is_prefix = Command::ALL.iter().any(|c| {
            let name = c.as_str().as_bytes();
            buf.len() < name.len() && name[..buf.len()].eq_ignore_ascii_case(buf)
        });
        return if is_prefix || buf.is_empty() {
            Ok(None)
        } else {
            Err("unknown command")
        };
    };
    Command::from_token(&buf[..end])
        .map(|c| Some((c, end)))
        .ok_or("unknown command")
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

fn payload_len(command: Command, options: &str) -> Option<usize> {
    if !command.has_payload() {
        return Some(0);
    }
    // Last argument is the payload (or total) size
    options.split_ascii_whitespace().last()?.parse().ok()
}

fn parse_message(message_type: MessageType, buf: &[u8]) -> FrameParseResult<Message> {
    let (command, token_len) = match leading_command(buf) {
        Ok(Some(found)) => found,
        Ok(None) => return FrameParseResult::need_more(),
        Err(reason) => return FrameParseResult::invalid(reason),
    };
    if !command.valid_for(message_type) {
        return FrameParseResult::invalid("command not valid for direction");
    }

    let window = &buf[..buf.len().min(MAX_CONTROL_LINE + CRLF.len())];
    let Some(line_end) = find_crlf(window) else {
        if buf.len() > MAX_CONTROL_LINE {
            return FrameParseResult::invalid("control line too long");
        }
        return FrameParseResult::need_more();
    };

    let options = String::from_utf8_lossy(&buf[token_len..line_end]);
    let options = options.trim();
    let Some(len) = payload_len(command, options).filter(|&n| n <= MAX_PAYLOAD) else {
        return FrameParseResult::invalid("bad payload size");
    };

    let payload_start = line_end + CRLF.len();
    let (payload, total) = if command.has_payload() {
        let total = payload_start + len + CRLF.len();
        if buf.len() < total {
            return FrameParseResult::need(total);
        }
        if &buf[total - CRLF.len()..total] != CRLF {
            return FrameParseResult::invalid("payload not terminated by CRLF");
        }
        (
            Bytes::copy_from_slice(&buf[payload_start..payload_start + len]),
            total,
        )
    } else {
        (Bytes::new(), payload_start)
    };

    FrameParseResult::Complete {
        frame: Message {
            timestamp_ns: 0,
            command,
            options: CompactString::from(options),
            payload,
            size: total,
        },
        bytes_consumed: total,
    }
}

/// Reply that acknowledges `req`.
fn acknowledges(req: &Message, resp: &Message) -> bool {
    match req.command {
        Command::Ping => resp.command == Command::Pong,
        _ => matches!(resp.command, Command::Ok | Command::Err),
    }
}

/// Server messages that are not replies to a request.
fn is_server_push(resp: &Message) -> bool {
    matches!(
        resp.command,
        Command::Msg | Command::Hmsg | Command::Info | Command::Ping
    )
}

fn resolve_unpaired(resp: Message, result: &mut RecordsWithErrorCount<Record>) {
    if is_server_push(&resp) {
        result.records.push(Record {
            req: None,
            resp: Some(resp),
        });
    } else {
        trace!(command = resp.command.as_str(), "reply without a pending request");
        result.error_count += 1;
    }
}

/// Zero-sized handler for NATS.
#[derive(Debug, Clone, Copy, Default)]
pub struct Nats;

impl ProtocolHandler for Nats {
    const PROTOCOL: Protocol = Protocol::Nats;

    type Frame = Message;
    type Key = u32;
    type State = ();
    type Record = Record;

    fn parse_frame(
        message_type: MessageType,
        buf: &[u8],
        _state: &mut (),
    ) -> FrameParseResult<Message> {
        parse_message(message_type, buf)
    }

    fn find_frame_boundary(
        message_type: MessageType,
        buf: &[u8],
        start_pos: usize,
        _state: &(),
    ) -> Option<usize> {
        scan_boundary(buf, start_pos, |candidate| {
            let Ok(Some((command, token_len))) = leading_command(candidate) else {
                return false;
            };
            command.valid_for(message_type)
                && find_crlf(&candidate[token_len..]).is_some()
                // Reject substrings of longer words such as "SUBJECT"
                && matches!(candidate.get(token_len), Some(b' ' | b'\t' | b'\r'))
        })
    }

    fn stream_key(_frame: &Message) -> u32 {
        0
    }

    fn stitch_frames(
        requests: &mut VecDeque<Message>,
        responses: &mut VecDeque<Message>,
        _state: &mut (),
    ) -> RecordsWithErrorCount<Record> {
        let mut result = RecordsWithErrorCount::new();

        while let Some(req_ts) = requests.front().map(|r| r.timestamp_ns) {
            while responses.front().is_some_and(|r| r.timestamp_ns < req_ts) {
                if let Some(resp) = responses.pop_front() {
                    resolve_unpaired(resp, &mut result);
                }
            }

            let Some(resp) = responses.front() else {
                // Whether an ack follows is not known yet
                break;
            };
            let paired = requests.front().is_some_and(|req| acknowledges(req, resp));
            let req = requests.pop_front();
            let resp = if paired { responses.pop_front() } else { None };
            result.records.push(Record { req, resp });
        }

        if requests.is_empty() {
            for resp in responses.drain(..) {
                resolve_unpaired(resp, &mut result);
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(message_type: MessageType, mut data: &[u8], ts: u64) -> VecDeque<Message> {
        let mut out = VecDeque::new();
        while !data.is_empty() {
            match Nats::parse_frame(message_type, data, &mut ()) {
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
    fn test_parse_pub() {
        let frames = parse_all(MessageType::Request, b"PUB foo.bar reply 5\r\nhello\r\n", 0);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, Command::Pub);
        assert_eq!(frames[0].options, "foo.bar reply 5");
        assert_eq!(frames[0].payload, Bytes::from("hello"));
        assert_eq!(frames[0].size, 28);
    }

    #[test]
    fn test_parse_control_lines() {
        let frames = parse_all(
            MessageType::Response,
            b"INFO {\"server_id\":\"x\"}\r\n+OK\r\nPING\r\n-ERR 'Unknown Protocol Operation'\r\n",
            0,
        );
        let commands: Vec<_> = frames.iter().map(|f| f.command).collect();
        assert_eq!(
            commands,
            vec![Command::Info, Command::Ok, Command::Ping, Command::Err]
        );
        assert_eq!(frames[3].options, "'Unknown Protocol Operation'");
    }

    #[test]
    fn test_parse_need_more() {
        for partial in [&b"PU"[..], b"PUB foo 5", b"PUB foo 5\r\nhel"] {
            let result = Nats::parse_frame(MessageType::Request, partial, &mut ());
            assert!(
                matches!(result, FrameParseResult::NeedMore { .. }),
                "{:?}",
                partial
            );
        }
    }

    #[test]
    fn test_parse_invalid() {
        let result = Nats::parse_frame(MessageType::Request, b"HELLO world\r\n", &mut ());
        assert!(matches!(result, FrameParseResult::Invalid { .. }));

        // MSG only flows from the server
        let result = Nats::parse_frame(MessageType::Request, b"MSG a 1 1\r\nx\r\n", &mut ());
        assert!(matches!(result, FrameParseResult::Invalid { .. }));

        let result = Nats::parse_frame(MessageType::Request, b"PUB a 1\r\nxyz\r\n", &mut ());
        assert!(matches!(result, FrameParseResult::Invalid { .. }));
    }

    #[test]
    fn test_find_frame_boundary() {
        let data = b"lo\r\nxSUBJECTx PING\r\n";
        assert_eq!(
            Nats::find_frame_boundary(MessageType::Request, data, 0, &()),
            Some(14)
        );
    }

    #[test]
    fn test_stitch() {
        let mut reqs = parse_all(MessageType::Request, b"CONNECT {}\r\n", 1);
        reqs.extend(parse_all(MessageType::Request, b"SUB foo 1\r\n", 3));
        reqs.extend(parse_all(MessageType::Request, b"PING\r\n", 5));

        let mut resps = parse_all(MessageType::Response, b"INFO {}\r\n", 0);
        resps.extend(parse_all(MessageType::Response, b"+OK\r\n", 2));
        resps.extend(parse_all(MessageType::Response, b"MSG foo 1 2\r\nhi\r\n", 4));
        resps.extend(parse_all(MessageType::Response, b"PONG\r\n", 6));

        let result = Nats::stitch_frames(&mut reqs, &mut resps, &mut ());

        assert_eq!(result.error_count, 0);
        let shapes: Vec<(Option<Command>, Option<Command>)> = result
            .records
            .iter()
            .map(|r| {
                (
                    r.req.as_ref().map(|m| m.command),
                    r.resp.as_ref().map(|m| m.command),
                )
            })
            .collect();
        assert_eq!(
            shapes,
            vec![
                (None, Some(Command::Info)),
                (Some(Command::Connect), Some(Command::Ok)),
                (Some(Command::Sub), None),
                (None, Some(Command::Msg)),
                (Some(Command::Ping), Some(Command::Pong)),
            ]
        );
        assert!(reqs.is_empty());
        assert!(resps.is_empty());
        assert_eq!(result.records[3].resp_payload(), Bytes::from("MSG foo 1 2\nhi"));
    }

    #[test]
    fn test_stitch_stray_ack() {
        let mut reqs = VecDeque::new();
        let mut resps = parse_all(MessageType::Response, b"+OK\r\n", 1);

        let result = Nats::stitch_frames(&mut reqs, &mut resps, &mut ());

        assert!(result.records.is_empty());
        assert_eq!(result.error_count, 1);
        assert!(resps.is_empty());
    }
}

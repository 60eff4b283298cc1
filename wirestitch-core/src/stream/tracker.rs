use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::error::StitchError;

use super::parsers::{Amqp, Cql, Dns, Http, Http2, Kafka, Mux, Mysql, Nats, Pgsql, Redis};
use super::{
    BufferConfig, BufferStats, DataStreamBuffer, Exchange, FrameBase, FrameParseResult,
    MessageType, Protocol, ProtocolHandler, ProtocolStream, RawEvent,
};

/// Per-connection configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Limits applied to each direction's buffer.
    pub buffer: BufferConfig,
    /// Consecutive failed resynchronizations tolerated before the head bytes
    /// are dropped.
    pub max_resync_failures: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            max_resync_failures: 3,
        }
    }
}

/// Counters for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub request_frames: u64,
    pub response_frames: u64,
    pub records: u64,
    /// Parse and stitch errors, including frames discarded on close.
    pub errors: u64,
    /// Successful boundary searches after an invalid frame.
    pub resyncs: u64,
    /// Bytes skipped by resynchronization or dropped as unparseable.
    pub skipped_bytes: u64,
    /// Frames still queued when the connection was closed.
    pub discarded_frames: u64,
    pub request_buffer: BufferStats,
    pub response_buffer: BufferStats,
}

/// A stitched exchange in protocol-independent form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StitchedRecord {
    pub connection_id: u64,
    pub protocol: Protocol,
    pub stream_key: i64,
    /// Request timestamp, or the response timestamp for server pushes.
    pub timestamp_ns: u64,
    /// Response minus request timestamp when both sides are present.
    pub latency_ns: Option<u64>,
    pub req_payload: Bytes,
    pub resp_payload: Bytes,
}

impl StitchedRecord {
    pub fn new(
        connection_id: u64,
        protocol: Protocol,
        stream_key: i64,
        record: &impl Exchange,
    ) -> Self {
        let req_ts = record.req_timestamp_ns();
        let resp_ts = record.resp_timestamp_ns();
        let latency_ns = match (req_ts, resp_ts) {
            (Some(req), Some(resp)) => Some(resp.saturating_sub(req)),
            _ => None,
        };

        Self {
            connection_id,
            protocol,
            stream_key,
            timestamp_ns: req_ts.or(resp_ts).unwrap_or(0),
            latency_ns,
            req_payload: record.req_payload(),
            resp_payload: record.resp_payload(),
        }
    }
}

/// Records and error count produced by one processing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StitchOutput {
    pub records: Vec<StitchedRecord>,
    pub error_count: usize,
}

impl StitchOutput {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.error_count == 0
    }

    pub fn extend(&mut self, other: StitchOutput) {
        self.records.extend(other.records);
        self.error_count += other.error_count;
    }
}

/// Queues and protocol state of one connection, for every supported protocol.
pub enum ProtocolFrames {
    Pgsql(ProtocolStream<Pgsql>),
    Cql(ProtocolStream<Cql>),
    Amqp(ProtocolStream<Amqp>),
    Nats(ProtocolStream<Nats>),
    Mysql(ProtocolStream<Mysql>),
    Kafka(ProtocolStream<Kafka>),
    Redis(ProtocolStream<Redis>),
    Dns(ProtocolStream<Dns>),
    Http(ProtocolStream<Http>),
    Http2(ProtocolStream<Http2>),
    Mux(ProtocolStream<Mux>),
}

macro_rules! with_stream {
    ($frames:expr, $stream:ident => $body:expr) => {
        match $frames {
            ProtocolFrames::Pgsql($stream) => $body,
            ProtocolFrames::Cql($stream) => $body,
            ProtocolFrames::Amqp($stream) => $body,
            ProtocolFrames::Nats($stream) => $body,
            ProtocolFrames::Mysql($stream) => $body,
            ProtocolFrames::Kafka($stream) => $body,
            ProtocolFrames::Redis($stream) => $body,
            ProtocolFrames::Dns($stream) => $body,
            ProtocolFrames::Http($stream) => $body,
            ProtocolFrames::Http2($stream) => $body,
            ProtocolFrames::Mux($stream) => $body,
        }
    };
}

impl ProtocolFrames {
    pub fn new(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Pgsql => ProtocolFrames::Pgsql(ProtocolStream::new()),
            Protocol::Cql => ProtocolFrames::Cql(ProtocolStream::new()),
            Protocol::Amqp => ProtocolFrames::Amqp(ProtocolStream::new()),
            Protocol::Nats => ProtocolFrames::Nats(ProtocolStream::new()),
            Protocol::Mysql => ProtocolFrames::Mysql(ProtocolStream::new()),
            Protocol::Kafka => ProtocolFrames::Kafka(ProtocolStream::new()),
            Protocol::Redis => ProtocolFrames::Redis(ProtocolStream::new()),
            Protocol::Dns => ProtocolFrames::Dns(ProtocolStream::new()),
            Protocol::Http => ProtocolFrames::Http(ProtocolStream::new()),
            Protocol::Http2 => ProtocolFrames::Http2(ProtocolStream::new()),
            Protocol::Mux => ProtocolFrames::Mux(ProtocolStream::new()),
        }
    }

    pub fn protocol(&self) -> Protocol {
        with_stream!(self, stream => protocol_of(stream))
    }

    /// Frames queued across all keys.
    pub fn frame_count(&self) -> usize {
        with_stream!(self, stream => stream.queues().frame_count())
    }

    /// Bytes held in queued frames.
    pub fn queued_bytes(&self) -> usize {
        with_stream!(self, stream => stream.queued_bytes())
    }
}

fn protocol_of<P: ProtocolHandler>(_stream: &ProtocolStream<P>) -> Protocol {
    P::PROTOCOL
}

/// One direction of a connection.
#[derive(Debug)]
struct Side {
    buffer: DataStreamBuffer,
    resync_failures: u32,
    /// Head length at the last failed boundary search.
    searched_len: usize,
}

impl Side {
    fn new(config: &BufferConfig) -> Self {
        Self {
            buffer: DataStreamBuffer::new(config.clone()),
            resync_failures: 0,
            searched_len: 0,
        }
    }
}

/// Per-pass counters of one direction's parse loop.
#[derive(Debug, Default)]
struct ParseCounts {
    frames: u64,
    errors: usize,
    resyncs: u64,
    skipped_bytes: u64,
}

/// Drain the parseable prefix of one direction into the stream's queues.
fn parse_side<P: ProtocolHandler>(
    connection_id: u64,
    stream: &mut ProtocolStream<P>,
    side: &mut Side,
    message_type: MessageType,
    max_resync_failures: u32,
) -> ParseCounts {
    let mut counts = ParseCounts::default();
    let protocol = P::PROTOCOL.name();

    loop {
        let head = side.buffer.head();
        if head.is_empty() {
            break;
        }
        let head_len = head.len();

        match P::parse_frame(message_type, head, &mut stream.state) {
            FrameParseResult::Complete {
                mut frame,
                bytes_consumed,
            } if bytes_consumed > 0 => {
                frame.set_timestamp_ns(side.buffer.head_timestamp_ns());
                stream.push(message_type, frame);
                side.buffer.remove_prefix(bytes_consumed);
                side.resync_failures = 0;
                side.searched_len = 0;
                counts.frames += 1;
            }
            FrameParseResult::NeedMore { .. } => {
                if !side.buffer.has_gap_at_head_end() {
                    break;
                }
                debug!(
                    connection_id,
                    protocol,
                    direction = message_type.as_str(),
                    bytes = head_len,
                    "partial frame cut by lost gap, dropping"
                );
                side.buffer.remove_prefix(head_len);
                side.searched_len = 0;
                counts.errors += 1;
                counts.skipped_bytes += head_len as u64;
            }
            result => {
                let reason = match result {
                    FrameParseResult::Invalid { reason } => reason,
                    _ => "empty frame",
                };
                let boundary = P::find_frame_boundary(message_type, head, 1, &stream.state);
                match boundary {
                    Some(pos) => {
                        trace!(
                            connection_id,
                            protocol,
                            direction = message_type.as_str(),
                            reason,
                            skipped = pos,
                            "resynchronized"
                        );
                        side.buffer.remove_prefix(pos);
                        side.searched_len = 0;
                        counts.resyncs += 1;
                        counts.skipped_bytes += pos as u64;
                    }
                    None => {
                        // Only a longer window, or a full one, counts as another failure
                        if head_len > side.searched_len || side.buffer.is_full() {
                            side.resync_failures += 1;
                        }
                        side.searched_len = head_len;
                        if side.resync_failures < max_resync_failures
                            && !side.buffer.has_gap_at_head_end()
                        {
                            break;
                        }
                        warn!(
                            connection_id,
                            protocol,
                            direction = message_type.as_str(),
                            reason,
                            bytes = head_len,
                            "no frame boundary found, dropping bytes"
                        );
                        side.buffer.remove_prefix(head_len);
                        side.resync_failures = 0;
                        side.searched_len = 0;
                        counts.errors += 1;
                        counts.skipped_bytes += head_len as u64;
                    }
                }
            }
        }
    }

    counts
}

fn stitch_stream<P: ProtocolHandler>(
    connection_id: u64,
    stream: &mut ProtocolStream<P>,
) -> StitchOutput {
    let result = stream.stitch();
    let records = result
        .records
        .into_iter()
        .map(|(key, record)| StitchedRecord::new(connection_id, P::PROTOCOL, key.into(), &record))
        .collect();

    StitchOutput {
        records,
        error_count: result.error_count,
    }
}

/// Count leftover frames per direction, logging what is being abandoned.
fn discard_stream<P: ProtocolHandler>(connection_id: u64, stream: &mut ProtocolStream<P>) -> u64 {
    let protocol = P::PROTOCOL.name();
    let (mut requests, mut responses) = (0usize, 0usize);
    for (_, pair) in stream.queues.iter_mut() {
        requests += pair.requests.len();
        responses += pair.responses.len();
    }

    if requests > 0 && responses > 0 {
        debug!(
            connection_id,
            frames = requests + responses,
            "{}",
            StitchError::IncompleteResponse {
                protocol,
                reason: "connection closed mid-exchange",
            }
        );
    } else if requests > 0 {
        debug!(
            connection_id,
            frames = requests,
            "{}",
            StitchError::UnmatchedRequest { protocol }
        );
    } else if responses > 0 {
        debug!(
            connection_id,
            frames = responses,
            "{}",
            StitchError::UnmatchedResponse { protocol }
        );
    }

    stream.queues.clear() as u64
}

/// Reconstructs the exchanges of a single connection.
///
/// Events are buffered per direction; [`process`](Self::process) parses
/// whatever became contiguous and stitches the queued frames.
pub struct ConnTracker {
    connection_id: u64,
    config: TrackerConfig,
    requests: Side,
    responses: Side,
    frames: ProtocolFrames,
    stats: TrackerStats,
    last_event_ns: u64,
}

impl ConnTracker {
    pub fn new(connection_id: u64, protocol: Protocol, config: TrackerConfig) -> Self {
        Self {
            connection_id,
            requests: Side::new(&config.buffer),
            responses: Side::new(&config.buffer),
            frames: ProtocolFrames::new(protocol),
            stats: TrackerStats::default(),
            last_event_ns: 0,
            config,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn protocol(&self) -> Protocol {
        self.frames.protocol()
    }

    /// Latest capture timestamp seen on either direction.
    pub fn last_event_ns(&self) -> u64 {
        self.last_event_ns
    }

    /// Buffer a capture event.
    pub fn add_event(&mut self, event: RawEvent<'_>) {
        let side = match event.message_type {
            MessageType::Request => &mut self.requests,
            MessageType::Response => &mut self.responses,
        };
        side.buffer.add(event.position, event.data, event.timestamp_ns);
        self.last_event_ns = self.last_event_ns.max(event.timestamp_ns);
    }

    /// Parse both directions, then stitch every stream key.
    ///
    /// Requests are parsed before responses so response framing can rely on
    /// what the request side taught the parser state.
    pub fn process(&mut self) -> StitchOutput {
        let connection_id = self.connection_id;
        let max_failures = self.config.max_resync_failures;
        let (requests, responses) = (&mut self.requests, &mut self.responses);

        let (req_counts, resp_counts, mut output) = with_stream!(&mut self.frames, stream => {
            let req =
                parse_side(connection_id, stream, requests, MessageType::Request, max_failures);
            let resp =
                parse_side(connection_id, stream, responses, MessageType::Response, max_failures);
            (req, resp, stitch_stream(connection_id, stream))
        });

        output.error_count += req_counts.errors + resp_counts.errors;

        self.stats.request_frames += req_counts.frames;
        self.stats.response_frames += resp_counts.frames;
        self.stats.resyncs += req_counts.resyncs + resp_counts.resyncs;
        self.stats.skipped_bytes += req_counts.skipped_bytes + resp_counts.skipped_bytes;
        self.stats.records += output.records.len() as u64;
        self.stats.errors += output.error_count as u64;

        if !output.is_empty() {
            trace!(
                connection_id,
                records = output.records.len(),
                errors = output.error_count,
                "processed"
            );
        }
        output
    }

    /// Frames waiting for their counterpart.
    pub fn queued_frames(&self) -> usize {
        self.frames.frame_count()
    }

    /// Approximate bytes held by buffers and queued frames.
    pub fn memory_usage(&self) -> usize {
        self.requests.buffer.memory_usage()
            + self.responses.buffer.memory_usage()
            + self.frames.queued_bytes()
    }

    /// Snapshot of the counters, including buffer statistics.
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            request_buffer: self.requests.buffer.stats().clone(),
            response_buffer: self.responses.buffer.stats().clone(),
            ..self.stats.clone()
        }
    }

    /// Close the connection, discarding any queued frames as errors.
    pub fn close(mut self) -> TrackerStats {
        let connection_id = self.connection_id;
        let discarded =
            with_stream!(&mut self.frames, stream => discard_stream(connection_id, stream));
        self.stats.discarded_frames += discarded;
        self.stats.errors += discarded;
        self.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROLLBACK_REQ: &[u8] = b"Q\x00\x00\x00\x0dROLLBACK\x00";
    const ROLLBACK_RESP: &[u8] = b"C\x00\x00\x00\x0dROLLBACK\x00";
    const READY: &[u8] = b"Z\x00\x00\x00\x05I";

    fn pgsql_tracker() -> ConnTracker {
        ConnTracker::new(1, Protocol::Pgsql, TrackerConfig::default())
    }

    fn cql_frame(message_type: MessageType, stream: i16, opcode: u8, body: &[u8]) -> Vec<u8> {
        let version = match message_type {
            MessageType::Request => 0x04,
            MessageType::Response => 0x84,
        };
        let mut out = vec![version, 0];
        out.extend_from_slice(&stream.to_be_bytes());
        out.push(opcode);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    // Test 1: One query, one response
    #[test]
    fn test_single_exchange() {
        let mut tracker = pgsql_tracker();
        tracker.add_event(RawEvent::new(MessageType::Request, 0, 100, ROLLBACK_REQ));
        let mut resp = ROLLBACK_RESP.to_vec();
        resp.extend_from_slice(READY);
        tracker.add_event(RawEvent::new(MessageType::Response, 0, 250, &resp));

        let output = tracker.process();

        assert_eq!(output.error_count, 0);
        assert_eq!(output.records.len(), 1);
        let record = &output.records[0];
        assert_eq!(record.connection_id, 1);
        assert_eq!(record.protocol, Protocol::Pgsql);
        assert_eq!(record.stream_key, 0);
        assert_eq!(record.timestamp_ns, 100);
        assert_eq!(record.latency_ns, Some(150));
        assert_eq!(&record.req_payload[..], b"ROLLBACK");
        assert_eq!(&record.resp_payload[..], b"ROLLBACK");

        let stats = tracker.stats();
        assert_eq!(stats.request_frames, 1);
        assert_eq!(stats.response_frames, 2);
        assert_eq!(stats.records, 1);
    }

    // Test 2: Fragments delivered out of order
    #[test]
    fn test_out_of_order_events() {
        let mut tracker = pgsql_tracker();
        tracker.add_event(RawEvent::new(MessageType::Request, 0, 100, &ROLLBACK_REQ[..3]));
        tracker.add_event(RawEvent::new(MessageType::Request, 8, 102, &ROLLBACK_REQ[8..]));
        assert!(tracker.process().is_empty());

        tracker.add_event(RawEvent::new(MessageType::Request, 3, 101, &ROLLBACK_REQ[3..8]));
        tracker.add_event(RawEvent::new(MessageType::Response, 0, 300, ROLLBACK_RESP));

        let output = tracker.process();
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].timestamp_ns, 100);
        assert_eq!(tracker.stats().request_buffer.out_of_order_count, 1);
    }

    // Test 3: Frame split across events waits for the rest
    #[test]
    fn test_partial_frame_waits() {
        let mut tracker = pgsql_tracker();
        tracker.add_event(RawEvent::new(MessageType::Request, 0, 100, &ROLLBACK_REQ[..8]));

        let output = tracker.process();
        assert!(output.is_empty());
        assert_eq!(tracker.queued_frames(), 0);

        tracker.add_event(RawEvent::new(MessageType::Request, 8, 110, &ROLLBACK_REQ[8..]));
        let output = tracker.process();
        assert!(output.is_empty());
        assert_eq!(tracker.queued_frames(), 1);
    }

    // Test 4: Garbage before a valid frame is skipped
    #[test]
    fn test_resync_skips_garbage() {
        let mut tracker = pgsql_tracker();
        let mut req = vec![0xff; 5];
        req.extend_from_slice(ROLLBACK_REQ);
        tracker.add_event(RawEvent::new(MessageType::Request, 0, 100, &req));
        tracker.add_event(RawEvent::new(MessageType::Response, 0, 200, ROLLBACK_RESP));

        let output = tracker.process();

        assert_eq!(output.error_count, 0);
        assert_eq!(output.records.len(), 1);
        let stats = tracker.stats();
        assert_eq!(stats.resyncs, 1);
        assert_eq!(stats.skipped_bytes, 5);
    }

    // Test 5: Unparseable bytes are dropped after repeated failures
    #[test]
    fn test_resync_failure_drops_bytes() {
        let config = TrackerConfig {
            max_resync_failures: 2,
            ..Default::default()
        };
        let mut tracker = ConnTracker::new(1, Protocol::Pgsql, config);
        tracker.add_event(RawEvent::new(MessageType::Request, 0, 100, &[0xff; 16]));

        let output = tracker.process();
        assert_eq!(output.error_count, 0);

        tracker.add_event(RawEvent::new(MessageType::Request, 16, 200, &[0xff; 8]));
        let output = tracker.process();
        assert_eq!(output.error_count, 1);
        assert_eq!(tracker.stats().skipped_bytes, 24);

        // The stream continues after the dropped bytes.
        tracker.add_event(RawEvent::new(MessageType::Request, 24, 300, ROLLBACK_REQ));
        tracker.add_event(RawEvent::new(MessageType::Response, 0, 400, ROLLBACK_RESP));
        let output = tracker.process();
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.error_count, 0);
    }

    // Test 6: Polling without new bytes keeps a frame that is still arriving
    #[test]
    fn test_idle_cycles_keep_partial_resync() {
        let mut tracker = pgsql_tracker();
        let mut req = vec![0xff; 5];
        req.extend_from_slice(&ROLLBACK_REQ[..8]);
        tracker.add_event(RawEvent::new(MessageType::Request, 0, 100, &req));

        for _ in 0..5 {
            let output = tracker.process();
            assert!(output.is_empty());
            assert_eq!(output.error_count, 0);
        }

        tracker.add_event(RawEvent::new(MessageType::Request, 13, 110, &ROLLBACK_REQ[8..]));
        tracker.add_event(RawEvent::new(MessageType::Response, 0, 200, ROLLBACK_RESP));
        let output = tracker.process();

        assert_eq!(output.error_count, 0);
        assert_eq!(output.records.len(), 1);
        let stats = tracker.stats();
        assert_eq!(stats.resyncs, 1);
        assert_eq!(stats.skipped_bytes, 5);
    }

    // Test 7: Frame cut by a lost gap is dropped, the stream resumes after it
    #[test]
    fn test_lost_gap_drops_partial_frame() {
        let config = TrackerConfig {
            buffer: BufferConfig {
                max_gap_size: 16,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut tracker = ConnTracker::new(1, Protocol::Pgsql, config);

        // First half of a query, then a hole, then a whole query far ahead.
        tracker.add_event(RawEvent::new(MessageType::Request, 0, 100, &ROLLBACK_REQ[..6]));
        tracker.add_event(RawEvent::new(MessageType::Request, 64, 200, ROLLBACK_REQ));
        tracker.add_event(RawEvent::new(MessageType::Response, 0, 300, ROLLBACK_RESP));

        let output = tracker.process();

        assert_eq!(output.error_count, 1);
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].timestamp_ns, 200);
        assert_eq!(tracker.stats().request_buffer.gap_count, 1);
    }

    // Test 8: Response with no request is counted and not retained
    #[test]
    fn test_orphan_response() {
        let mut tracker = pgsql_tracker();
        tracker.add_event(RawEvent::new(MessageType::Response, 0, 100, ROLLBACK_RESP));

        let output = tracker.process();

        assert!(output.records.is_empty());
        assert_eq!(output.error_count, 1);
        assert_eq!(tracker.queued_frames(), 0);
    }

    // Test 9: Multiplexed protocols carry the stream key
    #[test]
    fn test_cql_stream_keys() {
        let mut tracker = ConnTracker::new(9, Protocol::Cql, TrackerConfig::default());
        let mut reqs = cql_frame(MessageType::Request, 3, 0x05, b"");
        reqs.extend(cql_frame(MessageType::Request, 4, 0x05, b""));
        let mut resps = cql_frame(MessageType::Response, 4, 0x06, b"\x00\x00");
        resps.extend(cql_frame(MessageType::Response, 3, 0x06, b"\x00\x00"));
        tracker.add_event(RawEvent::new(MessageType::Request, 0, 10, &reqs));
        tracker.add_event(RawEvent::new(MessageType::Response, 0, 20, &resps));

        let output = tracker.process();

        assert_eq!(output.error_count, 0);
        let keys: Vec<i64> = output.records.iter().map(|r| r.stream_key).collect();
        assert_eq!(keys, vec![3, 4]);
        assert!(output.records.iter().all(|r| r.connection_id == 9));
    }

    // Test 10: Close discards queued frames as errors
    #[test]
    fn test_close_counts_discarded() {
        let mut tracker = pgsql_tracker();
        let mut reqs = ROLLBACK_REQ.to_vec();
        reqs.extend_from_slice(ROLLBACK_REQ);
        tracker.add_event(RawEvent::new(MessageType::Request, 0, 100, &reqs));
        tracker.process();
        assert_eq!(tracker.queued_frames(), 2);
        assert!(tracker.memory_usage() > 0);

        let stats = tracker.close();
        assert_eq!(stats.discarded_frames, 2);
        assert_eq!(stats.errors, 2);
    }

    #[test]
    fn test_stitched_record_response_only() {
        struct Push;
        impl Exchange for Push {
            fn req_timestamp_ns(&self) -> Option<u64> {
                None
            }
            fn resp_timestamp_ns(&self) -> Option<u64> {
                Some(42)
            }
            fn req_payload(&self) -> Bytes {
                Bytes::new()
            }
            fn resp_payload(&self) -> Bytes {
                Bytes::from_static(b"pushed")
            }
        }

        let record = StitchedRecord::new(1, Protocol::Nats, 0, &Push);
        assert_eq!(record.timestamp_ns, 42);
        assert_eq!(record.latency_ns, None);
        assert!(record.req_payload.is_empty());
    }

    #[test]
    fn test_protocol_frames_dispatch() {
        for protocol in Protocol::ALL {
            let frames = ProtocolFrames::new(protocol);
            assert_eq!(frames.protocol(), protocol);
            assert_eq!(frames.frame_count(), 0);
        }
    }
}

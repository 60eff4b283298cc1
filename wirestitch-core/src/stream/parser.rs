use std::collections::VecDeque;
use std::fmt::Debug;

use bytes::Bytes;
use tracing::trace;

use super::{FrameParseResult, MessageType, Protocol};

/// Fields every parsed frame carries.
pub trait FrameBase {
    /// Capture timestamp of the frame's first byte.
    fn timestamp_ns(&self) -> u64;

    /// Stamped by the tracker once the frame is parsed.
    fn set_timestamp_ns(&mut self, timestamp_ns: u64);

    /// Bytes the frame occupied on the wire.
    fn byte_size(&self) -> usize;
}

/// Uniform view of a stitched request/response pair.
///
/// One-sided exchanges (server pushes, fire-and-forget requests) report
/// `None` for the missing side's timestamp and an empty payload.
pub trait Exchange {
    fn req_timestamp_ns(&self) -> Option<u64>;
    fn resp_timestamp_ns(&self) -> Option<u64>;
    fn req_payload(&self) -> Bytes;
    fn resp_payload(&self) -> Bytes;
}

/// Output of one stitching pass over a single stream key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordsWithErrorCount<R> {
    pub records: Vec<R>,
    pub error_count: usize,
}

impl<R> RecordsWithErrorCount<R> {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            error_count: 0,
        }
    }
}

impl<R> Default for RecordsWithErrorCount<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Framing and stitching rules for one wire protocol.
///
/// Implemented by a zero-sized type per protocol; the tracker dispatches
/// statically over the closed set of implementations.
pub trait ProtocolHandler {
    const PROTOCOL: Protocol;

    type Frame: FrameBase + Debug;
    /// Demultiplexing key; a constant for protocols without one.
    type Key: Copy + Ord + Debug + Into<i64>;
    /// Per-connection state shared by the parser and the stitcher.
    type State: Default;
    type Record: Exchange + Debug;

    /// Parse exactly one frame from the head of `buf`.
    ///
    /// Must not touch `state` unless the result is `Complete`, and must be
    /// idempotent on `NeedMore` and `Invalid`.
    fn parse_frame(
        message_type: MessageType,
        buf: &[u8],
        state: &mut Self::State,
    ) -> FrameParseResult<Self::Frame>;

    /// Earliest position `>= start_pos` that plausibly begins a frame.
    fn find_frame_boundary(
        message_type: MessageType,
        buf: &[u8],
        start_pos: usize,
        state: &Self::State,
    ) -> Option<usize>;

    fn stream_key(frame: &Self::Frame) -> Self::Key;

    /// Pair the queued frames of one key.
    ///
    /// Consumed frames are removed from the queues; leftovers stay for the
    /// next call.
    fn stitch_frames(
        requests: &mut VecDeque<Self::Frame>,
        responses: &mut VecDeque<Self::Frame>,
        state: &mut Self::State,
    ) -> RecordsWithErrorCount<Self::Record>;
}

/// Pair each response with the oldest request captured no later than it.
///
/// A response that precedes every queued request (or finds the queue empty)
/// is dropped and counted. Unpaired requests stay queued.
pub fn stitch_in_order<F, R>(
    protocol: &'static str,
    requests: &mut VecDeque<F>,
    responses: &mut VecDeque<F>,
    mut pair: impl FnMut(F, F) -> R,
) -> RecordsWithErrorCount<R>
where
    F: FrameBase,
{
    let mut result = RecordsWithErrorCount::new();

    while let Some(resp) = responses.pop_front() {
        let matched = requests
            .front()
            .is_some_and(|req| req.timestamp_ns() <= resp.timestamp_ns());
        if !matched {
            trace!(protocol, ts = resp.timestamp_ns(), "unmatched response dropped");
            result.error_count += 1;
            continue;
        }
        if let Some(req) = requests.pop_front() {
            result.records.push(pair(req, resp));
        }
    }

    result
}

/// Scan for the earliest position accepted by `is_header`.
pub(crate) fn scan_boundary(
    buf: &[u8],
    start_pos: usize,
    mut is_header: impl FnMut(&[u8]) -> bool,
) -> Option<usize> {
    (start_pos..buf.len()).find(|&pos| is_header(&buf[pos..]))
}

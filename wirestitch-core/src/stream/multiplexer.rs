use std::collections::{BTreeMap, VecDeque};

use super::{FrameBase, MessageType, ProtocolHandler, RecordsWithErrorCount};

/// Request and response queues for one stream key.
#[derive(Debug)]
pub struct QueuePair<F> {
    pub requests: VecDeque<F>,
    pub responses: VecDeque<F>,
}

impl<F> QueuePair<F> {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.responses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len() + self.responses.len()
    }
}

impl<F> Default for QueuePair<F> {
    fn default() -> Self {
        Self {
            requests: VecDeque::new(),
            responses: VecDeque::new(),
        }
    }
}

/// Routes frames into per-key FIFO queue pairs.
#[derive(Debug)]
pub struct FrameQueues<K, F> {
    queues: BTreeMap<K, QueuePair<F>>,
}

impl<K: Ord + Copy, F> FrameQueues<K, F> {
    pub fn new() -> Self {
        Self {
            queues: BTreeMap::new(),
        }
    }

    /// Append a frame to its key's queue, creating the pair on first use.
    pub fn push(&mut self, key: K, message_type: MessageType, frame: F) {
        let pair = self.queues.entry(key).or_default();
        match message_type {
            MessageType::Request => pair.requests.push_back(frame),
            MessageType::Response => pair.responses.push_back(frame),
        }
    }

    pub fn get(&self, key: &K) -> Option<&QueuePair<F>> {
        self.queues.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.queues.keys()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut QueuePair<F>)> {
        self.queues.iter_mut()
    }

    /// Number of keys with a live queue pair.
    pub fn key_count(&self) -> usize {
        self.queues.len()
    }

    /// Total queued frames across all keys.
    pub fn frame_count(&self) -> usize {
        self.queues.values().map(QueuePair::len).sum()
    }

    /// Drop pairs whose queues are both empty.
    pub fn remove_empty(&mut self) {
        self.queues.retain(|_, pair| !pair.is_empty());
    }

    /// Discard everything, returning the number of frames dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.frame_count();
        self.queues.clear();
        dropped
    }
}

impl<K: Ord + Copy, F> Default for FrameQueues<K, F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Queues plus parser/stitcher state for one connection of protocol `P`.
pub struct ProtocolStream<P: ProtocolHandler> {
    pub(crate) queues: FrameQueues<P::Key, P::Frame>,
    pub(crate) state: P::State,
}

impl<P: ProtocolHandler> ProtocolStream<P> {
    pub fn new() -> Self {
        Self {
            queues: FrameQueues::new(),
            state: P::State::default(),
        }
    }

    pub fn queues(&self) -> &FrameQueues<P::Key, P::Frame> {
        &self.queues
    }

    pub fn state(&self) -> &P::State {
        &self.state
    }

    /// File a parsed frame under its stream key.
    pub fn push(&mut self, message_type: MessageType, frame: P::Frame) {
        let key = P::stream_key(&frame);
        self.queues.push(key, message_type, frame);
    }

    /// Stitch every key, tagging each record with its key.
    pub fn stitch(&mut self) -> RecordsWithErrorCount<(P::Key, P::Record)> {
        let mut out = RecordsWithErrorCount::new();
        for (key, pair) in self.queues.iter_mut() {
            let result = P::stitch_frames(&mut pair.requests, &mut pair.responses, &mut self.state);
            out.error_count += result.error_count;
            out.records
                .extend(result.records.into_iter().map(|record| (*key, record)));
        }
        self.queues.remove_empty();
        out
    }

    /// Bytes still held in queued frames.
    pub fn queued_bytes(&self) -> usize {
        self.queues
            .queues
            .values()
            .flat_map(|pair| pair.requests.iter().chain(pair.responses.iter()))
            .map(FrameBase::byte_size)
            .sum()
    }
}

impl<P: ProtocolHandler> Default for ProtocolStream<P> {
    fn default() -> Self {
        Self::new()
    }
}

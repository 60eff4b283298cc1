use std::collections::{BTreeMap, VecDeque};

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

/// Limits for one direction of a connection.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Maximum number of reassembled, unconsumed bytes held.
    pub capacity: usize,
    /// Maximum span held ahead of the contiguous frontier before the hole in
    /// front of it is declared lost.
    pub max_gap_size: usize,
    /// Fragments landing at most this far behind the head are counted as
    /// retransmissions; anything older is stale.
    pub allow_before_gap_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1024 * 1024,             // 1 MB
            max_gap_size: 128 * 1024,          // 128 KB
            allow_before_gap_size: 128 * 1024, // 128 KB
        }
    }
}

/// A fragment received ahead of the contiguous frontier.
#[derive(Debug, Clone)]
struct Fragment {
    data: Vec<u8>,
    timestamp_ns: u64,
}

/// A span of the stream that was declared permanently lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    pub start: u64,
    pub end: u64,
}

impl SequenceGap {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Position inside the held bytes where data resumes after a lost gap.
#[derive(Debug, Clone, Copy)]
struct GapMarker {
    offset: usize,
    gap: SequenceGap,
}

/// Buffer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub event_count: u64,
    pub out_of_order_count: u64,
    pub retransmit_count: u64,
    pub stale_count: u64,
    pub gap_count: u64,
    pub gap_bytes: u64,
    pub dropped_bytes: u64,
}

/// Number of declared gaps remembered for inspection.
const MAX_RECORDED_GAPS: usize = 64;

/// Reassembles one direction of a captured byte stream.
///
/// Fragments may arrive in any order and may overlap. The longest contiguous
/// run starting at the head is exposed through [`head`](Self::head); a hole
/// that stays open while more than `max_gap_size` bytes pile up behind it is
/// declared lost and the head skips it once the bytes before it are consumed.
#[derive(Debug)]
pub struct DataStreamBuffer {
    config: BufferConfig,
    /// Absolute position of the first held byte. `None` until the first event.
    head: Option<u64>,
    /// Set once bytes have left the head; the head can no longer move back.
    head_advanced: bool,
    /// Absolute position one past the last contiguous byte.
    frontier: u64,
    /// Held bytes, possibly split by lost-gap markers.
    data: BytesMut,
    markers: VecDeque<GapMarker>,
    /// Out-of-order fragments keyed by absolute position.
    pending: BTreeMap<u64, Fragment>,
    pending_bytes: usize,
    /// Capture timestamp of each chunk, keyed by its absolute start position.
    timestamps: BTreeMap<u64, u64>,
    gaps: VecDeque<SequenceGap>,
    stats: BufferStats,
}

impl DataStreamBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            head: None,
            head_advanced: false,
            frontier: 0,
            data: BytesMut::new(),
            markers: VecDeque::new(),
            pending: BTreeMap::new(),
            pending_bytes: 0,
            timestamps: BTreeMap::new(),
            gaps: VecDeque::new(),
            stats: BufferStats::default(),
        }
    }

    /// Insert a fragment at an absolute stream position.
    pub fn add(&mut self, position: u64, data: &[u8], timestamp_ns: u64) {
        if data.is_empty() {
            return;
        }
        self.stats.event_count += 1;

        let mut position = position;
        let mut data = data;

        // A single event larger than the window can only contribute its tail.
        if data.len() > self.config.capacity {
            let excess = data.len() - self.config.capacity;
            self.stats.dropped_bytes += excess as u64;
            position += excess as u64;
            data = &data[excess..];
        }

        match self.head {
            None => {
                self.head = Some(position);
                self.frontier = position;
            }
            Some(head) if position < head && !self.head_advanced && self.markers.is_empty() => {
                self.stats.out_of_order_count += 1;
                self.rebase(head, position);
            }
            Some(_) => {}
        }

        if position < self.frontier {
            let end = position + data.len() as u64;
            if end <= self.frontier {
                self.note_behind_frontier(position);
                return;
            }
            // Partial overlap - trim the beginning
            let overlap = (self.frontier - position) as usize;
            data = &data[overlap..];
            position = self.frontier;
        }

        if position == self.frontier {
            self.append_contiguous(position, data, timestamp_ns);
            self.flush_pending();
            self.enforce_gap_limit();
        } else {
            self.insert_pending(position, data, timestamp_ns);
            self.enforce_gap_limit();
        }

        self.enforce_capacity();
    }

    /// Contiguous bytes starting at the head.
    ///
    /// Never spans a lost gap; once the bytes before a gap are consumed the
    /// head moves past it.
    pub fn head(&self) -> &[u8] {
        let end = self
            .markers
            .front()
            .map_or(self.data.len(), |marker| marker.offset);
        &self.data[..end]
    }

    /// Consume `n` bytes from the head.
    pub fn remove_prefix(&mut self, n: usize) {
        let n = n.min(self.data.len());
        if n == 0 {
            return;
        }
        let Some(head) = self.head else {
            return;
        };

        self.data.advance(n);
        self.head_advanced = true;

        let mut new_head = head + n as u64;
        while let Some(marker) = self.markers.front().copied() {
            if marker.offset > n {
                break;
            }
            new_head = marker.gap.end + (n - marker.offset) as u64;
            self.markers.pop_front();
        }
        for marker in self.markers.iter_mut() {
            marker.offset -= n;
        }
        self.head = Some(new_head);
        self.prune_timestamps(new_head);
    }

    /// Whether the current head view is cut short by a lost gap.
    ///
    /// When true, a frame that does not fit in [`head`](Self::head) can never
    /// complete.
    pub fn has_gap_at_head_end(&self) -> bool {
        !self.markers.is_empty()
    }

    /// Absolute position of the head byte.
    pub fn position(&self) -> u64 {
        self.head.unwrap_or(0)
    }

    /// Absolute position one past the last contiguous byte.
    pub fn frontier(&self) -> u64 {
        self.frontier
    }

    /// Capture timestamp of the chunk holding `position`.
    pub fn timestamp_ns_at(&self, position: u64) -> Option<u64> {
        self.timestamps
            .range(..=position)
            .next_back()
            .map(|(_, ts)| *ts)
    }

    /// Capture timestamp of the head byte (0 if nothing was captured yet).
    pub fn head_timestamp_ns(&self) -> u64 {
        self.head
            .and_then(|head| self.timestamp_ns_at(head))
            .unwrap_or(0)
    }

    /// Bytes held in order (including bytes beyond lost gaps).
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// True when the in-order window is at capacity.
    pub fn is_full(&self) -> bool {
        self.data.len() >= self.config.capacity
    }

    /// Bytes held out of order.
    pub fn pending_size(&self) -> usize {
        self.pending_bytes
    }

    /// True when no bytes are held at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.pending.is_empty()
    }

    /// Recently declared gaps, oldest first.
    pub fn gaps(&self) -> impl Iterator<Item = &SequenceGap> {
        self.gaps.iter()
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    /// Approximate memory held by this buffer.
    pub fn memory_usage(&self) -> usize {
        self.data.len() + self.pending_bytes
    }

    fn note_behind_frontier(&mut self, position: u64) {
        let head = self.position();
        if head.saturating_sub(position) <= self.config.allow_before_gap_size as u64 {
            self.stats.retransmit_count += 1;
            trace!(position, head, "duplicate fragment");
        } else {
            self.stats.stale_count += 1;
            debug!(position, head, "stale fragment dropped");
        }
    }

    /// Move an unconsumed head back to `position`, turning the held chunks
    /// into pending fragments.
    fn rebase(&mut self, head: u64, position: u64) {
        let held = self.data.split();
        let chunks: Vec<(u64, u64)> = self
            .timestamps
            .iter()
            .map(|(pos, ts)| (*pos, *ts))
            .collect();

        for (i, &(start, timestamp_ns)) in chunks.iter().enumerate() {
            let end = chunks.get(i + 1).map_or(self.frontier, |&(next, _)| next);
            let start = start.max(head);
            if start >= end {
                continue;
            }
            let chunk = &held[(start - head) as usize..(end - head) as usize];
            self.pending_bytes += chunk.len();
            self.pending.insert(
                start,
                Fragment {
                    data: chunk.to_vec(),
                    timestamp_ns,
                },
            );
        }

        trace!(from = head, to = position, "head moved back before first consume");
        self.timestamps.clear();
        self.head = Some(position);
        self.frontier = position;
    }

    fn append_contiguous(&mut self, position: u64, data: &[u8], timestamp_ns: u64) {
        self.data.extend_from_slice(data);
        self.timestamps.insert(position, timestamp_ns);
        self.frontier = position + data.len() as u64;
    }

    fn insert_pending(&mut self, position: u64, data: &[u8], timestamp_ns: u64) {
        if let Some(existing) = self.pending.get(&position) {
            if existing.data.len() >= data.len() {
                self.stats.retransmit_count += 1;
                return;
            }
            self.pending_bytes -= existing.data.len();
        }
        self.stats.out_of_order_count += 1;
        self.pending_bytes += data.len();
        self.pending.insert(
            position,
            Fragment {
                data: data.to_vec(),
                timestamp_ns,
            },
        );
    }

    /// Move pending fragments that now touch the frontier into the data.
    fn flush_pending(&mut self) {
        while let Some(entry) = self.pending.first_entry() {
            let position = *entry.key();
            if position > self.frontier {
                break;
            }
            let fragment = entry.remove();
            self.pending_bytes -= fragment.data.len();

            let end = position + fragment.data.len() as u64;
            if end <= self.frontier {
                // Fully covered by data that arrived since
                continue;
            }
            let skip = (self.frontier - position) as usize;
            let frontier = self.frontier;
            self.append_contiguous(frontier, &fragment.data[skip..], fragment.timestamp_ns);
        }
    }

    /// Declare holes lost while too much data waits behind them.
    fn enforce_gap_limit(&mut self) {
        loop {
            let furthest = self
                .pending
                .iter()
                .map(|(pos, frag)| pos + frag.data.len() as u64)
                .max();
            let Some(furthest) = furthest else {
                break;
            };
            if furthest - self.frontier <= self.config.max_gap_size as u64 {
                break;
            }
            let Some(first) = self.pending.keys().next().copied() else {
                break;
            };

            let gap = SequenceGap {
                start: self.frontier,
                end: first,
            };
            self.record_gap(gap);
            self.markers.push_back(GapMarker {
                offset: self.data.len(),
                gap,
            });
            self.frontier = first;
            self.flush_pending();
        }
        self.skip_leading_markers();
    }

    fn record_gap(&mut self, gap: SequenceGap) {
        debug!(start = gap.start, end = gap.end, "stream gap declared lost");
        self.stats.gap_count += 1;
        self.stats.gap_bytes += gap.len();
        if self.gaps.len() == MAX_RECORDED_GAPS {
            self.gaps.pop_front();
        }
        self.gaps.push_back(gap);
    }

    /// A marker at offset 0 means nothing is left before the gap.
    fn skip_leading_markers(&mut self) {
        let mut moved = false;
        while let Some(marker) = self.markers.front().copied() {
            if marker.offset != 0 {
                break;
            }
            self.head = Some(marker.gap.end);
            self.markers.pop_front();
            self.head_advanced = true;
            moved = true;
        }
        if moved {
            self.prune_timestamps(self.position());
        }
    }

    fn enforce_capacity(&mut self) {
        if self.data.len() > self.config.capacity {
            let excess = self.data.len() - self.config.capacity;
            debug!(excess, "stream buffer over capacity, dropping oldest bytes");
            self.stats.dropped_bytes += excess as u64;
            self.remove_prefix(excess);
        }
    }

    /// Forget timestamps of chunks that lie entirely before `head`.
    fn prune_timestamps(&mut self, head: u64) {
        let covering = self
            .timestamps
            .range(..=head)
            .next_back()
            .map(|(pos, ts)| (*pos, *ts));
        let mut retained = self.timestamps.split_off(&head);
        if let Some((pos, ts)) = covering {
            retained.entry(pos).or_insert(ts);
        }
        self.timestamps = retained;
    }
}

impl Default for DataStreamBuffer {
    fn default() -> Self {
        Self::new(BufferConfig::default())
    }
}

//! Fuzz target for the connection tracker.
//!
//! Input layout: one protocol selector byte, then records of
//! `[flags: u8][position: u16 BE][len: u8][bytes...]`. Bit 0 of `flags`
//! picks the direction. Events may overlap, repeat or leave holes.
//!
//! Checks:
//! - No panics under arbitrary fragment ordering
//! - Closing always succeeds and accounts for every queued frame

#![no_main]

use libfuzzer_sys::fuzz_target;
use wirestitch_core::stream::{
    BufferConfig, ConnTracker, MessageType, Protocol, RawEvent, TrackerConfig,
};

fuzz_target!(|data: &[u8]| {
    let Some((&selector, mut rest)) = data.split_first() else {
        return;
    };
    let protocol = Protocol::ALL[selector as usize % Protocol::ALL.len()];
    let config = TrackerConfig {
        buffer: BufferConfig {
            capacity: 4096,
            max_gap_size: 256,
            allow_before_gap_size: 256,
        },
        max_resync_failures: 2,
    };
    let mut tracker = ConnTracker::new(1, protocol, config);

    let mut ts = 0u64;
    while rest.len() >= 4 {
        let flags = rest[0];
        let position = u16::from_be_bytes([rest[1], rest[2]]) as u64;
        let len = (rest[3] as usize).min(rest.len() - 4);
        let bytes = &rest[4..4 + len];
        rest = &rest[4 + len..];

        let message_type = if flags & 1 == 0 {
            MessageType::Request
        } else {
            MessageType::Response
        };
        ts += 1;
        tracker.add_event(RawEvent::new(message_type, position, ts, bytes));

        if flags & 2 != 0 {
            let _ = tracker.process();
        }
    }

    let _ = tracker.process();
    let queued = tracker.queued_frames() as u64;
    let stats = tracker.close();
    assert_eq!(stats.discarded_frames, queued);
});

//! # wirestitch-core
//!
//! Passive reconstruction of request/response exchanges from captured socket
//! byte streams.
//!
//! This crate takes the raw bytes an instrumentation layer observed on each
//! direction of a connection, reassembles them, parses them into protocol
//! frames and pairs requests with responses. It owns no sockets, files or
//! threads; callers feed events in and pull stitched records out.
//!
//! ## Features
//!
//! - **Reassembly**: Out-of-order and overlapping fragments, bounded gap
//!   tolerance, per-chunk capture timestamps
//! - **Framing**: 11 built-in protocols with resynchronization after garbage
//!   or data loss
//! - **Stitching**: Per-stream-key pairing for multiplexed protocols, server
//!   pushes and fire-and-forget requests as one-sided records
//!
//! ## Quick Start
//!
//! ```rust
//! use wirestitch_core::prelude::*;
//!
//! let mut tracker = ConnTracker::new(1, Protocol::Redis, TrackerConfig::default());
//! tracker.add_event(RawEvent::new(
//!     MessageType::Request,
//!     0,
//!     1_000,
//!     b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n",
//! ));
//! tracker.add_event(RawEvent::new(MessageType::Response, 0, 1_500, b"$5\r\nvalue\r\n"));
//!
//! let output = tracker.process();
//! for record in &output.records {
//!     println!("{} {:?} -> {:?}", record.protocol, record.req_payload, record.resp_payload);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        wirestitch-core                              |
//! +---------------------------------------------------------------------+
//! |  stream/reassembly   - DataStreamBuffer, gap tracking               |
//! |  stream/parser       - ProtocolHandler trait, Exchange              |
//! |  stream/parsers/     - 11 protocol handlers                         |
//! |  stream/multiplexer  - Per-key request/response queues              |
//! |  stream/tracker      - ConnTracker, StitchedRecord                  |
//! |  stream/manager      - StreamManager (many connections)             |
//! |  error/              - Error types                                  |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Supported Protocols
//!
//! | Family | Protocols |
//! |--------|-----------|
//! | Databases | PostgreSQL, MySQL, CQL, Redis |
//! | Messaging | AMQP 0-9-1, NATS, Kafka, Mux |
//! | Web / naming | HTTP/1.x, HTTP/2, DNS |

pub mod error;
pub mod prelude;
pub mod stream;

// Re-export commonly used types at crate root for convenience
pub use error::{Error, ProtocolError, Result, StitchError};
pub use stream::{
    BufferConfig, ConnTracker, DataStreamBuffer, Exchange, MessageType, Protocol,
    ProtocolHandler, RawEvent, StitchOutput, StitchedRecord, StreamConfig, StreamManager,
    TrackerConfig, TrackerStats,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Byte-stream reassembly, framing and request/response stitching.
//!
//! Captured socket bytes arrive as [`RawEvent`]s, possibly out of order and
//! with holes. Each connection direction is reassembled, cut into protocol
//! frames, filed per stream key and paired into exchanges.
//!
//! ## Components
//!
//! - [`DataStreamBuffer`] - Reassembles one direction into a contiguous head
//! - [`ProtocolHandler`] - Framing, boundary search and stitching per protocol
//! - [`FrameQueues`] - Per-key request/response FIFO queues
//! - [`ConnTracker`] - Drives one connection from events to records
//! - [`StreamManager`] - Owns the trackers of many connections
//!
//! ## Built-in Protocols
//!
//! - PostgreSQL, MySQL, CQL (Cassandra), Redis
//! - AMQP 0-9-1, NATS, Kafka, Mux
//! - DNS, HTTP/1.x, HTTP/2
//!
//! ## Example
//!
//! ```rust
//! use wirestitch_core::stream::{MessageType, Protocol, RawEvent, StreamManager};
//!
//! let mut manager = StreamManager::with_defaults();
//! let query = b"Q\x00\x00\x00\x0dROLLBACK\x00";
//! let reply = b"C\x00\x00\x00\x0dROLLBACK\x00";
//!
//! manager
//!     .add_event(1, Protocol::Pgsql, RawEvent::new(MessageType::Request, 0, 100, query))
//!     .unwrap();
//! manager
//!     .add_event(1, Protocol::Pgsql, RawEvent::new(MessageType::Response, 0, 180, reply))
//!     .unwrap();
//!
//! let output = manager.process_all();
//! assert_eq!(output.records.len(), 1);
//! assert_eq!(output.records[0].latency_ns, Some(80));
//! ```

mod context;
pub mod decode;
mod manager;
mod multiplexer;
mod parser;
pub mod parsers;
mod reassembly;
mod registry;
mod tracker;

pub use context::{FrameParseResult, MessageType, ParseState, RawEvent};
pub use manager::{StreamConfig, StreamManager};
pub use multiplexer::{FrameQueues, ProtocolStream, QueuePair};
pub use parser::{stitch_in_order, Exchange, FrameBase, ProtocolHandler, RecordsWithErrorCount};
pub use reassembly::{BufferConfig, BufferStats, DataStreamBuffer, SequenceGap};
pub use registry::Protocol;
pub use tracker::{
    ConnTracker, ProtocolFrames, StitchOutput, StitchedRecord, TrackerConfig, TrackerStats,
};

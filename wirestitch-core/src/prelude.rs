//! Convenient re-exports for common usage.
//!
//! # Example
//!
//! ```rust
//! use wirestitch_core::prelude::*;
//!
//! let manager = StreamManager::new(StreamConfig::default());
//! assert_eq!(manager.connection_count(), 0);
//! ```

// Pipeline types
pub use crate::stream::{
    ConnTracker, MessageType, Protocol, RawEvent, StitchOutput, StitchedRecord, StreamConfig,
    StreamManager, TrackerConfig, TrackerStats,
};

// Buffer types
pub use crate::stream::{BufferConfig, BufferStats, DataStreamBuffer};

// Handler traits
pub use crate::stream::{Exchange, FrameBase, FrameParseResult, ProtocolHandler};

// Error types
pub use crate::error::{Error, Result};

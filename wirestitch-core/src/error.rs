//! Error types for wirestitch-core.
//!
//! Nothing in the reconstruction pipeline is fatal: parse and stitch anomalies
//! are folded into error counts. These types exist for the places where a
//! decoder or a caller-facing operation needs to say *what* went wrong:
//!
//! - [`enum@Error`] - Main error enum that wraps all error types
//! - [`ProtocolError`] - Errors from decoding a frame's payload
//! - [`StitchError`] - Anomalies observed while pairing requests and responses
//!
//! All errors implement `std::error::Error`.

use thiserror::Error;

use crate::stream::Protocol;

/// Main error type for wirestitch-core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Error while decoding a frame payload
    #[error("Protocol parse error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Error while stitching frames
    #[error("Stitch error: {0}")]
    Stitch(#[from] StitchError),

    /// Protocol name not recognized
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    /// Event delivered for a connection that is tracked with another protocol
    #[error("Connection {connection_id} is tracked as {tracked}, got event for {requested}")]
    ProtocolMismatch {
        connection_id: u64,
        tracked: Protocol,
        requested: Protocol,
    },

    /// Connection table is full
    #[error("Connection limit reached ({limit})")]
    ConnectionLimit { limit: usize },
}

/// Errors related to decoding protocol payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload too short for the field being read
    #[error("{protocol}: packet too short (need {needed} bytes, have {have})")]
    PacketTooShort {
        protocol: &'static str,
        needed: usize,
        have: usize,
    },

    /// Invalid field value
    #[error("{protocol}: invalid {field}: {reason}")]
    InvalidField {
        protocol: &'static str,
        field: &'static str,
        reason: String,
    },
}

/// Anomalies found while stitching.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StitchError {
    /// Response arrived with no pending request to pair with
    #[error("{protocol}: response without a pending request")]
    UnmatchedResponse { protocol: &'static str },

    /// Request was abandoned because its response never lined up
    #[error("{protocol}: request dropped without a matching response")]
    UnmatchedRequest { protocol: &'static str },

    /// A multi-message response could not be assembled
    #[error("{protocol}: incomplete response: {reason}")]
    IncompleteResponse {
        protocol: &'static str,
        reason: &'static str,
    },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Which side of an exchange a byte stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client to server.
    Request,
    /// Server to client.
    Response,
}

impl MessageType {
    /// Return a string representation of the message type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
        }
    }
}

/// One capture event as delivered by the instrumentation layer.
///
/// `position` is the byte offset since the start of this direction of the
/// connection. The bytes are copied into the stream buffer on insertion.
#[derive(Debug, Clone, Copy)]
pub struct RawEvent<'a> {
    pub message_type: MessageType,
    pub position: u64,
    pub timestamp_ns: u64,
    pub data: &'a [u8],
}

impl<'a> RawEvent<'a> {
    pub fn new(
        message_type: MessageType,
        position: u64,
        timestamp_ns: u64,
        data: &'a [u8],
    ) -> Self {
        Self {
            message_type,
            position,
            timestamp_ns,
            data,
        }
    }
}

/// Outcome of a single parse attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Success,
    NeedsMoreData,
    Invalid,
}

/// Result of parsing one frame from the head of a buffer.
#[derive(Debug, Clone)]
pub enum FrameParseResult<F> {
    /// Exactly one frame was parsed.
    Complete { frame: F, bytes_consumed: usize },

    /// Need more contiguous bytes before parsing can proceed.
    NeedMore { minimum_bytes: Option<usize> },

    /// The bytes at the head are not a frame of this protocol.
    Invalid { reason: &'static str },
}

impl<F> FrameParseResult<F> {
    pub fn state(&self) -> ParseState {
        match self {
            FrameParseResult::Complete { .. } => ParseState::Success,
            FrameParseResult::NeedMore { .. } => ParseState::NeedsMoreData,
            FrameParseResult::Invalid { .. } => ParseState::Invalid,
        }
    }

    pub(crate) fn need(minimum_bytes: usize) -> Self {
        FrameParseResult::NeedMore {
            minimum_bytes: Some(minimum_bytes),
        }
    }

    pub(crate) fn need_more() -> Self {
        FrameParseResult::NeedMore {
            minimum_bytes: None,
        }
    }

    pub(crate) fn invalid(reason: &'static str) -> Self {
        FrameParseResult::Invalid { reason }
    }

    /// Unwrap a complete frame, mostly useful in tests.
    pub fn into_frame(self) -> Option<(F, usize)> {
        match self {
            FrameParseResult::Complete {
                frame,
                bytes_consumed,
            } => Some((frame, bytes_consumed)),
            _ => None,
        }
    }
}

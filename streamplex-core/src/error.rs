//! Error types for stream and packetizer operations

/// Errors that can occur while moving frames through a stream graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// A pool cannot satisfy a buffer request
    #[error("Allocation failure: {0}")]
    AllocationFailure(String),

    /// A blocking call exceeded its deadline
    #[error("Operation timed out")]
    Timeout,

    /// Segment check value mismatch
    #[error("Integrity failure: expected {expected:08x}, got {actual:08x}")]
    IntegrityFailure {
        /// The check value carried by the segment.
        expected: u32,
        /// The check value computed on receipt.
        actual: u32,
    },

    /// Out-of-order or duplicate segment
    #[error("Sequence error on channel {channel}: expected {expected}, got {actual}")]
    SequenceError {
        /// Channel the segment belongs to.
        channel: u8,
        /// The sequence number the context was waiting for.
        expected: u8,
        /// The sequence number that arrived.
        actual: u8,
    },

    /// Malformed header or oversized segment
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The component was closed while the caller waited or before it called
    #[error("Transport closed")]
    TransportClosed,

    /// Channel id outside the configured range
    #[error("Invalid channel: {0}")]
    InvalidChannel(u8),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error while reading or writing frame data
    #[error("IO error: {0}")]
    Io(String),
}

impl StreamError {
    /// True for the errors a caller may retry (backpressure rather than loss)
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::Timeout)
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Io(err.to_string())
    }
}

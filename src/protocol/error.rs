//! Helix error types

use thiserror::Error;

/// Errors surfaced to application calls.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// The connection is closed or was disposed while waiting.
    #[error("connection closed")]
    Closed,

    /// The operation did not complete before its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The operation was canceled by the caller or the peer.
    #[error("operation canceled")]
    Canceled,

    /// No transmission slot is available on the connection.
    #[error("no transmission available")]
    NoTransmission,

    /// The block exceeds the negotiated maximum block size.
    #[error("block size limit exceeded")]
    BlockSizeLimit,

    /// The stream exceeds the negotiated maximum stream length.
    #[error("stream length limit exceeded")]
    StreamLengthLimit,

    /// Application payload could not be serialized.
    #[error("serialization failed")]
    SerializationFailed,

    /// Application payload could not be deserialized.
    #[error("deserialization failed")]
    DeserializationFailed,

    /// The relay route could not carry the packet.
    #[error("invalid relay")]
    InvalidRelay,

    /// The endpoint does not match the connection.
    #[error("invalid endpoint")]
    InvalidEndpoint,

    /// Inbound data failed validation.
    #[error("invalid data")]
    InvalidData,
}

/// Result type alias for application calls
pub type NetResult<T> = std::result::Result<T, NetError>;

/// Wire decoding failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer too small
    #[error("buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall {
        /// Needed size
        needed: usize,
        /// Actual size
        got: usize,
    },

    /// Unknown packet type
    #[error("unknown packet type: {0:#06x}")]
    UnknownPacketType(u16),

    /// Unknown frame type
    #[error("unknown frame type: {0:#06x}")]
    UnknownFrameType(u16),

    /// Unknown or non-wire transmission mode
    #[error("invalid transmission mode: {0}")]
    InvalidMode(u16),

    /// Unknown data control code
    #[error("invalid data control: {0}")]
    InvalidDataControl(u16),

    /// Gene count outside of the accepted range
    #[error("invalid gene count: {0}")]
    InvalidGeneCount(i32),

    /// Ack range with `start > end` or a negative bound
    #[error("invalid ack range: [{start}, {end})")]
    InvalidRange {
        /// Range start
        start: i32,
        /// Range end
        end: i32,
    },
}

impl From<FrameError> for NetError {
    fn from(_: FrameError) -> Self {
        NetError::InvalidData
    }
}

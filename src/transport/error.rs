//! Transport-level error types for packet protection.

use thiserror::Error;

use crate::protocol::NetError;

/// Failure while sealing or opening a protected packet.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// The packet is shorter than the protected envelope.
    #[error("protected packet truncated: need {needed} bytes, got {got}")]
    Truncated {
        /// Minimum envelope size.
        needed: usize,
        /// Actual packet size.
        got: usize,
    },
    /// Tag verification failed.
    #[error("packet authentication failed")]
    Authentication,
    /// The cipher refused to seal the payload.
    #[error("packet sealing failed")]
    Seal,
}

impl From<CryptoError> for NetError {
    fn from(_: CryptoError) -> Self {
        NetError::InvalidData
    }
}

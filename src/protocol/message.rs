//! Reassembled application message

use bytes::Bytes;

/// Application message delivered by a completed burst or block transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    data_kind: u32,
    data_id: u64,
    payload: Bytes,
}

impl Message {
    /// Create a new message
    pub fn new(data_kind: u32, data_id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            data_kind,
            data_id,
            payload: payload.into(),
        }
    }

    /// Get application data kind
    #[must_use]
    pub const fn data_kind(&self) -> u32 {
        self.data_kind
    }

    /// Get application data id
    #[must_use]
    pub const fn data_id(&self) -> u64 {
        self.data_id
    }

    /// Get payload
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the message, returning the payload
    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

//! Helix packet header
//!
//! The header is 18 bytes and authenticated (but not encrypted) in protected packets.

use super::{FrameError, PACKET_HEADER_SIZE, PacketType};

/// Packet header (18 bytes)
///
/// # Wire Format
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Source Relay Id (2)       |   Destination Relay Id (2)    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Salt (4)                            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |       Packet Type (2)         |                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+                               +
/// |                     Connection Id (8)                         |
/// +                               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    source_relay_id: u16,
    destination_relay_id: u16,
    salt: u32,
    packet_type: u16,
    id: u64,
}

impl PacketHeader {
    /// Create a header for a direct (non-relayed) packet
    #[must_use]
    pub const fn new(packet_type: PacketType, salt: u32, id: u64) -> Self {
        Self {
            source_relay_id: 0,
            destination_relay_id: 0,
            salt,
            packet_type: packet_type.as_u16(),
            id,
        }
    }

    /// Set relay identifiers
    #[must_use]
    pub const fn with_relays(mut self, source: u16, destination: u16) -> Self {
        self.source_relay_id = source;
        self.destination_relay_id = destination;
        self
    }

    /// Get source relay id
    #[must_use]
    pub const fn source_relay_id(&self) -> u16 {
        self.source_relay_id
    }

    /// Get destination relay id
    #[must_use]
    pub const fn destination_relay_id(&self) -> u16 {
        self.destination_relay_id
    }

    /// Get salt
    #[must_use]
    pub const fn salt(&self) -> u32 {
        self.salt
    }

    /// Get raw packet type
    #[must_use]
    pub const fn packet_type_raw(&self) -> u16 {
        self.packet_type
    }

    /// Get packet type
    #[must_use]
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u16(self.packet_type)
    }

    /// Get connection id
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Convert to bytes (little-endian)
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut bytes = [0u8; PACKET_HEADER_SIZE];

        bytes[0..2].copy_from_slice(&self.source_relay_id.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.destination_relay_id.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.salt.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.packet_type.to_le_bytes());
        bytes[10..18].copy_from_slice(&self.id.to_le_bytes());

        bytes
    }

    /// Parse from bytes (little-endian)
    ///
    /// Unknown packet types are preserved; callers decide whether to handle them.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(FrameError::BufferTooSmall {
                needed: PACKET_HEADER_SIZE,
                got: bytes.len(),
            });
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[10..18]);

        Ok(Self {
            source_relay_id: u16::from_le_bytes([bytes[0], bytes[1]]),
            destination_relay_id: u16::from_le_bytes([bytes[2], bytes[3]]),
            salt: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            packet_type: u16::from_le_bytes([bytes[8], bytes[9]]),
            id: u64::from_le_bytes(id),
        })
    }
}

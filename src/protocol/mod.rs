//! Helix wire protocol
//!
//! This module provides the packet header, the frame codecs and the shared protocol types.
//! Everything on the wire is little-endian.

mod codec;
mod error;
mod header;
mod message;
mod metrics;
mod types;

pub use codec::{
    FirstGeneHeader, FollowingGeneHeader, GeneSpan, KnockFrame, KnockResponseFrame,
    read_frame_type,
};
pub use error::{FrameError, NetError, NetResult};
pub use header::PacketHeader;
pub use message::Message;
pub use metrics::{MetricsSnapshot, TerminalMetrics};
pub use types::{ConnectionState, DataControl, FrameType, PacketType, TransmissionMode};

/// Maximum size of a UDP datagram produced by a terminal.
pub const MAX_PACKET_SIZE: usize = 1432;

/// Packet header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 18;

/// Size of the explicit per-packet nonce that precedes the ciphertext.
pub const NONCE_SIZE: usize = 8;

/// AEAD authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Bytes a protected packet adds around its frame.
pub const PROTECTED_OVERHEAD: usize = PACKET_HEADER_SIZE + NONCE_SIZE + TAG_SIZE;

/// Largest plaintext frame that fits into one protected packet.
pub const MAX_FRAME_SIZE: usize = MAX_PACKET_SIZE - PROTECTED_OVERHEAD;

/// `FrameType` prefix size.
pub const FRAME_TYPE_SIZE: usize = 2;

/// FirstGene header size for burst and block transmissions.
pub const FIRST_GENE_BLOCK_HEADER_SIZE: usize = FRAME_TYPE_SIZE + 2 + 4 + 2 + 4 + 4 + 4 + 8;

/// FirstGene header size for stream transmissions.
pub const FIRST_GENE_STREAM_HEADER_SIZE: usize = FRAME_TYPE_SIZE + 2 + 4 + 2 + 4 + 8 + 4 + 8;

/// FollowingGene header size.
pub const FOLLOWING_GENE_HEADER_SIZE: usize = FRAME_TYPE_SIZE + 4 + 2 + 4;

/// Payload bytes carried by every gene except the last one of a transmission.
///
/// Sized against the largest FirstGene header so that every gene position carries the
/// same amount of payload.
pub const MAX_GENE_LENGTH: usize = MAX_FRAME_SIZE - FIRST_GENE_STREAM_HEADER_SIZE;

/// Transmissions with at most this many genes use inline burst storage.
pub const BURST_GENE_LIMIT: usize = 3;

/// Number of genes needed to carry `length` payload bytes (minimum one).
#[must_use]
pub fn gene_count(length: usize) -> usize {
    length.div_ceil(MAX_GENE_LENGTH).max(1)
}

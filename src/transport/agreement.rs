//! Limits negotiated between the two ends of a connection.

use bytes::{Buf, BufMut};

use super::ack::ensure;
use super::clock::{MICS_PER_SECOND, Mics};
use crate::protocol::{FRAME_TYPE_SIZE, FrameError, FrameType, MAX_GENE_LENGTH};

/// Negotiated connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Agreement {
    /// Concurrent send transmissions allowed per connection.
    pub max_transmissions: u32,
    /// Largest burst/block payload in bytes.
    pub max_block_size: u32,
    /// Largest stream in bytes; zero disables streams.
    pub max_stream_length: i64,
    /// Receive buffer per stream in bytes.
    pub stream_buffer_size: u32,
    /// Idle time before an open connection is closed.
    pub min_connection_retention_mics: Mics,
    /// Whether either side may open a reverse connection.
    pub enable_bidirectional_connection: bool,
}

impl Default for Agreement {
    fn default() -> Self {
        Self {
            max_transmissions: 16,
            max_block_size: 4 * 1024 * 1024,
            max_stream_length: 0,
            stream_buffer_size: 1024 * 1024,
            min_connection_retention_mics: 15 * MICS_PER_SECOND,
            enable_bidirectional_connection: false,
        }
    }
}

impl Agreement {
    /// Maximum number of genes in a burst or block.
    #[must_use]
    pub fn max_block_genes(&self) -> i32 {
        genes_for(i64::from(self.max_block_size))
    }

    /// Genes that fit into the stream receive buffer (at least one).
    #[must_use]
    pub fn stream_buffer_genes(&self) -> i32 {
        genes_for(i64::from(self.stream_buffer_size)).max(1)
    }

    /// Gene window of a stream of at most `max_stream_length` bytes.
    ///
    /// Both ends derive it from the agreement, so sender and receiver windows match.
    #[must_use]
    pub fn stream_window_genes(&self, max_stream_length: i64) -> i32 {
        self.stream_buffer_genes()
            .min(genes_for(max_stream_length).saturating_add(1))
    }

    /// Widen every limit to cover `target`.
    pub fn accept_all(&mut self, target: &Agreement) {
        self.max_transmissions = self.max_transmissions.max(target.max_transmissions);
        self.max_block_size = self.max_block_size.max(target.max_block_size);
        self.max_stream_length = self.max_stream_length.max(target.max_stream_length);
        self.stream_buffer_size = self.stream_buffer_size.max(target.stream_buffer_size);
        self.min_connection_retention_mics = self
            .min_connection_retention_mics
            .max(target.min_connection_retention_mics);
        self.enable_bidirectional_connection |= target.enable_bidirectional_connection;
    }

    /// Check whether every limit of `target` lies within `self`.
    #[must_use]
    pub fn is_inclusive(&self, target: &Agreement) -> bool {
        target.max_transmissions <= self.max_transmissions
            && target.max_block_size <= self.max_block_size
            && target.max_stream_length <= self.max_stream_length
            && target.stream_buffer_size <= self.stream_buffer_size
            && target.min_connection_retention_mics <= self.min_connection_retention_mics
            && (!target.enable_bidirectional_connection || self.enable_bidirectional_connection)
    }
}

/// Proposal to widen both ends of a connection to `agreement`.
///
/// ```text
/// [FrameType:u16][Serial:u32][MaxTransmissions:u32][MaxBlockSize:u32][MaxStreamLength:i64]
/// [StreamBufferSize:u32][MinConnectionRetention:i64][EnableBidirectional:u8]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AgreementUpdateFrame {
    pub serial: u32,
    pub agreement: Agreement,
}

impl AgreementUpdateFrame {
    const BODY_LEN: usize = 4 + 4 + 4 + 8 + 4 + 8 + 1;
    pub(crate) const ENCODED_LEN: usize = FRAME_TYPE_SIZE + Self::BODY_LEN;

    pub(crate) fn encode(&self, out: &mut impl BufMut) {
        let agreement = &self.agreement;
        out.put_u16_le(FrameType::AgreementUpdate.as_u16());
        out.put_u32_le(self.serial);
        out.put_u32_le(agreement.max_transmissions);
        out.put_u32_le(agreement.max_block_size);
        out.put_i64_le(agreement.max_stream_length);
        out.put_u32_le(agreement.stream_buffer_size);
        out.put_i64_le(agreement.min_connection_retention_mics);
        out.put_u8(u8::from(agreement.enable_bidirectional_connection));
    }

    pub(crate) fn decode(buf: &mut &[u8]) -> Result<Self, FrameError> {
        ensure(buf, Self::BODY_LEN)?;
        Ok(Self {
            serial: buf.get_u32_le(),
            agreement: Agreement {
                max_transmissions: buf.get_u32_le(),
                max_block_size: buf.get_u32_le(),
                max_stream_length: buf.get_i64_le(),
                stream_buffer_size: buf.get_u32_le(),
                min_connection_retention_mics: buf.get_i64_le(),
                enable_bidirectional_connection: buf.get_u8() != 0,
            },
        })
    }
}

/// `[FrameType:u16][Serial:u32][Accepted:u8]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AgreementResponseFrame {
    pub serial: u32,
    pub accepted: bool,
}

impl AgreementResponseFrame {
    pub(crate) fn encode(&self, out: &mut impl BufMut) {
        out.put_u16_le(FrameType::AgreementResponse.as_u16());
        out.put_u32_le(self.serial);
        out.put_u8(u8::from(self.accepted));
    }

    pub(crate) fn decode(buf: &mut &[u8]) -> Result<Self, FrameError> {
        ensure(buf, 5)?;
        Ok(Self {
            serial: buf.get_u32_le(),
            accepted: buf.get_u8() != 0,
        })
    }
}

/// Number of genes needed for `length` bytes, saturating at `i32::MAX`.
#[must_use]
pub(crate) fn genes_for(length: i64) -> i32 {
    let per_gene = i64::try_from(MAX_GENE_LENGTH).unwrap_or(i64::MAX);
    let genes = (length.max(0) + per_gene - 1) / per_gene;
    i32::try_from(genes).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_gene_counts() {
        let agreement = Agreement {
            max_block_size: u32::try_from(MAX_GENE_LENGTH * 10).unwrap(),
            stream_buffer_size: 1,
            ..Agreement::default()
        };
        assert_eq!(agreement.max_block_genes(), 10);
        assert_eq!(agreement.stream_buffer_genes(), 1);
        assert_eq!(
            Agreement {
                stream_buffer_size: 0,
                ..agreement
            }
            .stream_buffer_genes(),
            1
        );
    }

    #[test]
    fn accept_all_widens() {
        let mut local = Agreement::default();
        let remote = Agreement {
            max_transmissions: 64,
            max_block_size: 1024,
            max_stream_length: 1 << 30,
            enable_bidirectional_connection: true,
            ..Agreement::default()
        };
        local.accept_all(&remote);

        assert_eq!(local.max_transmissions, 64);
        assert_eq!(local.max_block_size, Agreement::default().max_block_size);
        assert_eq!(local.max_stream_length, 1 << 30);
        assert!(local.enable_bidirectional_connection);
        assert!(local.is_inclusive(&remote));
    }

    #[test]
    fn inclusion_checks_every_limit() {
        let limit = Agreement::default();
        assert!(limit.is_inclusive(&limit));
        assert!(!limit.is_inclusive(&Agreement {
            max_block_size: limit.max_block_size + 1,
            ..limit
        }));
        assert!(!limit.is_inclusive(&Agreement {
            enable_bidirectional_connection: true,
            ..limit
        }));
    }

    #[test]
    fn agreement_update_layout() {
        let frame = AgreementUpdateFrame {
            serial: 4,
            agreement: Agreement {
                max_block_size: 8 << 20,
                max_stream_length: -1,
                enable_bidirectional_connection: true,
                ..Agreement::default()
            },
        };
        let mut out = Vec::new();
        frame.encode(&mut out);
        assert_eq!(out.len(), AgreementUpdateFrame::ENCODED_LEN);
        assert_eq!(&out[2..6], &4u32.to_le_bytes());
        assert_eq!(out.last(), Some(&1));

        let mut buf = out.as_slice();
        assert_eq!(
            crate::protocol::read_frame_type(&mut buf).unwrap(),
            FrameType::AgreementUpdate
        );
        assert_eq!(AgreementUpdateFrame::decode(&mut buf).unwrap(), frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn truncated_agreement_response() {
        let mut out = Vec::new();
        AgreementResponseFrame {
            serial: 9,
            accepted: true,
        }
        .encode(&mut out);
        assert_eq!(out.len(), FRAME_TYPE_SIZE + 5);

        let mut buf = &out[FRAME_TYPE_SIZE..out.len() - 1];
        assert!(matches!(
            AgreementResponseFrame::decode(&mut buf),
            Err(FrameError::BufferTooSmall { needed: 5, got: 4 })
        ));
    }
}

//! Frame codecs (encode/decode)
//!
//! Every frame starts with a `FrameType:u16`. Encoders write the frame type themselves;
//! decoders expect the caller to have consumed it with [`read_frame_type`] first.

use bytes::{Buf, BufMut};

use super::{
    DataControl, FIRST_GENE_BLOCK_HEADER_SIZE, FIRST_GENE_STREAM_HEADER_SIZE,
    FOLLOWING_GENE_HEADER_SIZE, FRAME_TYPE_SIZE, FrameError, FrameType, TransmissionMode,
};

#[inline]
fn ensure(buf: &[u8], needed: usize) -> Result<(), FrameError> {
    if buf.len() < needed {
        return Err(FrameError::BufferTooSmall {
            needed,
            got: buf.len(),
        });
    }
    Ok(())
}

/// Consume and decode the leading frame type.
pub fn read_frame_type(buf: &mut &[u8]) -> Result<FrameType, FrameError> {
    ensure(buf, FRAME_TYPE_SIZE)?;
    FrameType::from_u16(buf.get_u16_le())
}

/// Size field of a FirstGene header, depending on the transmission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneSpan {
    /// Burst and block: number of genes in the transmission
    TotalGene(i32),
    /// Stream: upper bound of the stream length in bytes
    MaxStreamLength(i64),
}

/// Header of the first gene of a transmission.
///
/// ```text
/// [FrameType:u16][Mode:u16][TransmissionId:u32][DataControl:u16][RttHint:i32]
/// [TotalGene:i32 | MaxStreamLength:i64][DataKind:u32][DataId:u64][payload...]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirstGeneHeader {
    /// Transmission mode (`Burst`, `Block` or `Stream`)
    pub mode: TransmissionMode,
    /// Transmission id
    pub transmission_id: u32,
    /// Control code of gene 0
    pub data_control: DataControl,
    /// Sender's smoothed RTT in microseconds
    pub rtt_hint: i32,
    /// Gene count or stream length
    pub span: GeneSpan,
    /// Application data kind
    pub data_kind: u32,
    /// Application data id
    pub data_id: u64,
}

impl FirstGeneHeader {
    /// Encoded header size including the frame type
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        match self.span {
            GeneSpan::TotalGene(_) => FIRST_GENE_BLOCK_HEADER_SIZE,
            GeneSpan::MaxStreamLength(_) => FIRST_GENE_STREAM_HEADER_SIZE,
        }
    }

    /// Write the frame type and the header
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u16_le(FrameType::FirstGene.as_u16());
        out.put_u16_le(self.mode.as_u16());
        out.put_u32_le(self.transmission_id);
        out.put_u16_le(self.data_control.as_u16());
        out.put_i32_le(self.rtt_hint);
        match self.span {
            GeneSpan::TotalGene(total) => out.put_i32_le(total),
            GeneSpan::MaxStreamLength(length) => out.put_i64_le(length),
        }
        out.put_u32_le(self.data_kind);
        out.put_u64_le(self.data_id);
    }

    /// Decode the header; `buf` is left pointing at the payload
    pub fn decode(buf: &mut &[u8]) -> Result<Self, FrameError> {
        ensure(buf, FIRST_GENE_BLOCK_HEADER_SIZE - FRAME_TYPE_SIZE)?;
        let mode = TransmissionMode::from_wire(buf.get_u16_le())?;
        let transmission_id = buf.get_u32_le();
        let data_control = DataControl::from_u16(buf.get_u16_le())?;
        let rtt_hint = buf.get_i32_le();
        let span = if mode == TransmissionMode::Stream {
            ensure(buf, 8 + 4 + 8)?;
            GeneSpan::MaxStreamLength(buf.get_i64_le())
        } else {
            let total = buf.get_i32_le();
            if total < 1 {
                return Err(FrameError::InvalidGeneCount(total));
            }
            GeneSpan::TotalGene(total)
        };
        let data_kind = buf.get_u32_le();
        let data_id = buf.get_u64_le();

        Ok(Self {
            mode,
            transmission_id,
            data_control,
            rtt_hint,
            span,
            data_kind,
            data_id,
        })
    }
}

/// Header of every gene after the first.
///
/// ```text
/// [FrameType:u16][TransmissionId:u32][DataControl:u16][DataPosition:i32][payload...]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowingGeneHeader {
    /// Transmission id
    pub transmission_id: u32,
    /// Control code
    pub data_control: DataControl,
    /// Gene position (at least 1)
    pub position: i32,
}

impl FollowingGeneHeader {
    /// Write the frame type and the header
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u16_le(FrameType::FollowingGene.as_u16());
        out.put_u32_le(self.transmission_id);
        out.put_u16_le(self.data_control.as_u16());
        out.put_i32_le(self.position);
    }

    /// Decode the header; `buf` is left pointing at the payload
    pub fn decode(buf: &mut &[u8]) -> Result<Self, FrameError> {
        ensure(buf, FOLLOWING_GENE_HEADER_SIZE - FRAME_TYPE_SIZE)?;
        let transmission_id = buf.get_u32_le();
        let data_control = DataControl::from_u16(buf.get_u16_le())?;
        let position = buf.get_i32_le();
        if position < 1 {
            return Err(FrameError::InvalidGeneCount(position));
        }
        Ok(Self {
            transmission_id,
            data_control,
            position,
        })
    }
}

/// Stream window probe sent by a blocked stream sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnockFrame {
    /// Stream transmission id
    pub transmission_id: u32,
}

impl KnockFrame {
    /// Encoded size including the frame type
    pub const ENCODED_LEN: usize = FRAME_TYPE_SIZE + 4;

    /// Write the frame
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u16_le(FrameType::Knock.as_u16());
        out.put_u32_le(self.transmission_id);
    }

    /// Decode the frame body
    pub fn decode(buf: &mut &[u8]) -> Result<Self, FrameError> {
        ensure(buf, 4)?;
        Ok(Self {
            transmission_id: buf.get_u32_le(),
        })
    }
}

/// Receive window report answering a knock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnockResponseFrame {
    /// Stream transmission id
    pub transmission_id: u32,
    /// First position the receiver cannot accept yet
    pub max_receive_position: i32,
    /// Every position below this one has been received
    pub successive_received_position: i32,
}

impl KnockResponseFrame {
    /// Encoded size including the frame type
    pub const ENCODED_LEN: usize = FRAME_TYPE_SIZE + 4 + 4 + 4;

    /// Write the frame
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u16_le(FrameType::KnockResponse.as_u16());
        out.put_u32_le(self.transmission_id);
        out.put_i32_le(self.max_receive_position);
        out.put_i32_le(self.successive_received_position);
    }

    /// Decode the frame body
    pub fn decode(buf: &mut &[u8]) -> Result<Self, FrameError> {
        ensure(buf, 12)?;
        Ok(Self {
            transmission_id: buf.get_u32_le(),
            max_receive_position: buf.get_i32_le(),
            successive_received_position: buf.get_i32_le(),
        })
    }
}

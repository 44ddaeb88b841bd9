//! Ack frame encoding and decoding.
//!
//! ```text
//! [FrameType:u16] then entries:
//!   burst:        [-1:i32][TransmissionId:u32]
//!   block/stream: [MaxReceivePosition:i32][TransmissionId:u32]
//!                 [SuccessiveReceivedPosition:i32][PairCount:u16]
//!                 [(Start:i32, End:i32) * PairCount]
//! ```

use bytes::{Buf, BufMut};

use crate::protocol::{FRAME_TYPE_SIZE, FrameError, FrameType};

/// Size of a burst entry.
pub const BURST_ENTRY_SIZE: usize = 4 + 4;

/// Size of a block/stream entry without its pairs.
pub const BLOCK_ENTRY_HEADER_SIZE: usize = 4 + 4 + 4 + 2;

/// Size of one `[start, end)` pair.
pub const ACK_PAIR_SIZE: usize = 4 + 4;

/// Half-open range of acknowledged gene positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRange {
    start: i32,
    end: i32,
}

impl AckRange {
    /// Create a range ensuring `0 <= start < end`.
    pub fn new(start: i32, end: i32) -> Result<Self, FrameError> {
        if start < 0 || start >= end {
            return Err(FrameError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// First acknowledged position.
    #[must_use]
    pub const fn start(&self) -> i32 {
        self.start
    }

    /// One past the last acknowledged position.
    #[must_use]
    pub const fn end(&self) -> i32 {
        self.end
    }
}

/// One decoded ack entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEntry {
    /// Every gene of a burst transmission arrived.
    Burst {
        /// Transmission id
        transmission_id: u32,
    },
    /// Progress of a block or stream transmission.
    Block {
        /// Transmission id
        transmission_id: u32,
        /// First position the receiver cannot accept yet
        max_receive_position: i32,
        /// Every position below this one has been received
        successive_received_position: i32,
        /// Positions received beyond the successive position
        ranges: Vec<AckRange>,
    },
}

impl AckEntry {
    /// Transmission the entry refers to.
    #[must_use]
    pub const fn transmission_id(&self) -> u32 {
        match self {
            Self::Burst { transmission_id } | Self::Block { transmission_id, .. } => {
                *transmission_id
            }
        }
    }
}

/// Decode the entries of an ack frame whose frame type has been consumed.
pub fn decode_ack_entries(mut buf: &[u8]) -> Result<Vec<AckEntry>, FrameError> {
    let mut entries = Vec::new();
    while !buf.is_empty() {
        ensure(buf, BURST_ENTRY_SIZE)?;
        let max_receive_position = buf.get_i32_le();
        let transmission_id = buf.get_u32_le();
        if max_receive_position < 0 {
            entries.push(AckEntry::Burst { transmission_id });
            continue;
        }

        ensure(buf, BLOCK_ENTRY_HEADER_SIZE - BURST_ENTRY_SIZE)?;
        let successive_received_position = buf.get_i32_le();
        let pair_count = usize::from(buf.get_u16_le());
        ensure(buf, pair_count * ACK_PAIR_SIZE)?;
        let mut ranges = Vec::with_capacity(pair_count);
        for _ in 0..pair_count {
            let start = buf.get_i32_le();
            let end = buf.get_i32_le();
            ranges.push(AckRange::new(start, end)?);
        }
        entries.push(AckEntry::Block {
            transmission_id,
            max_receive_position,
            successive_received_position,
            ranges,
        });
    }
    Ok(entries)
}

pub(crate) fn ensure(buf: &[u8], needed: usize) -> Result<(), FrameError> {
    if buf.len() < needed {
        return Err(FrameError::BufferTooSmall {
            needed,
            got: buf.len(),
        });
    }
    Ok(())
}

/// Sort `positions` and merge adjacent ones into ranges, skipping positions below `floor`.
pub fn coalesce(positions: &mut Vec<i32>, floor: i32, ranges: &mut Vec<AckRange>) {
    positions.retain(|position| *position >= floor);
    positions.sort_unstable();
    positions.dedup();

    let mut iter = positions.iter().copied();
    let Some(first) = iter.next() else {
        return;
    };
    let (mut start, mut end) = (first, first + 1);
    for position in iter {
        if position == end {
            end += 1;
        } else {
            ranges.push(AckRange { start, end });
            start = position;
            end = position + 1;
        }
    }
    ranges.push(AckRange { start, end });
}

/// Incremental writer splitting entries across frames of at most `limit` bytes.
#[derive(Debug)]
pub struct AckFrameWriter {
    limit: usize,
    current: Vec<u8>,
    frames: Vec<Vec<u8>>,
}

impl AckFrameWriter {
    /// Create a writer producing frames of at most `limit` bytes.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        assert!(
            limit >= FRAME_TYPE_SIZE + BLOCK_ENTRY_HEADER_SIZE + ACK_PAIR_SIZE,
            "ack frame limit too small"
        );
        Self {
            limit,
            current: Vec::new(),
            frames: Vec::new(),
        }
    }

    fn remaining(&self) -> usize {
        if self.current.is_empty() {
            self.limit - FRAME_TYPE_SIZE
        } else {
            self.limit - self.current.len()
        }
    }

    fn reserve(&mut self, needed: usize) {
        if self.remaining() < needed {
            self.flush();
        }
        if self.current.is_empty() {
            self.current.put_u16_le(FrameType::Ack.as_u16());
        }
    }

    fn flush(&mut self) {
        if !self.current.is_empty() {
            self.frames.push(std::mem::take(&mut self.current));
        }
    }

    /// Append a burst entry.
    pub fn write_burst(&mut self, transmission_id: u32) {
        self.reserve(BURST_ENTRY_SIZE);
        self.current.put_i32_le(-1);
        self.current.put_u32_le(transmission_id);
    }

    /// Append a block/stream entry, continuing in a new frame when the pairs do not fit.
    pub fn write_block(
        &mut self,
        transmission_id: u32,
        max_receive_position: i32,
        successive_received_position: i32,
        ranges: &[AckRange],
    ) {
        let mut rest = ranges;
        loop {
            self.reserve(BLOCK_ENTRY_HEADER_SIZE + ACK_PAIR_SIZE.min(rest.len() * ACK_PAIR_SIZE));
            let fit = (self.remaining() - BLOCK_ENTRY_HEADER_SIZE) / ACK_PAIR_SIZE;
            let count = rest.len().min(fit).min(usize::from(u16::MAX));

            self.current.put_i32_le(max_receive_position);
            self.current.put_u32_le(transmission_id);
            self.current.put_i32_le(successive_received_position);
            self.current
                .put_u16_le(u16::try_from(count).unwrap_or(u16::MAX));
            for range in &rest[..count] {
                self.current.put_i32_le(range.start);
                self.current.put_i32_le(range.end);
            }

            rest = &rest[count..];
            if rest.is_empty() {
                break;
            }
            self.flush();
        }
    }

    /// Finish and return every frame.
    #[must_use]
    pub fn finish(mut self) -> Vec<Vec<u8>> {
        self.flush();
        self.frames
    }
}

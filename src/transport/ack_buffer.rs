//! Deferred acknowledgment aggregation.
//!
//! Receivers do not answer every gene. Positions are collected per connection and flushed
//! as coalesced Ack frames once the connection's ack delay has passed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::ack::{AckFrameWriter, AckRange, coalesce};
use super::clock::Mics;
use crate::protocol::MAX_FRAME_SIZE;

/// Identity of an ack target inside one terminal.
///
/// A connection and its bidirectional twin share the connection id, so the role is part
/// of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AckKey {
    pub connection_id: u64,
    pub server: bool,
}

/// Receiver side of a connection, as seen by the ack buffer.
pub(crate) trait AckTarget: Send + Sync {
    fn ack_key(&self) -> AckKey;

    /// `(max_receive_position, successive_received_position)` of a receive transmission.
    fn window_report(&self, transmission_id: u32) -> Option<(i32, i32)>;

    /// Seal and send one Ack frame.
    fn emit_ack_frame(&self, frame: &[u8]);
}

struct PendingAcks<T> {
    target: Arc<T>,
    bursts: Vec<u32>,
    blocks: Vec<(u32, Vec<i32>)>,
}

struct AckQueue<T> {
    order: VecDeque<(AckKey, Mics)>,
    pending: HashMap<AckKey, PendingAcks<T>>,
    free_bursts: Vec<Vec<u32>>,
    free_blocks: Vec<Vec<(u32, Vec<i32>)>>,
    free_positions: Vec<Vec<i32>>,
}

impl<T> AckQueue<T> {
    fn entry(&mut self, target: &Arc<T>, key: AckKey, due: Mics) -> &mut PendingAcks<T> {
        let Self {
            order,
            pending,
            free_bursts,
            free_blocks,
            ..
        } = self;
        pending.entry(key).or_insert_with(|| {
            order.push_back((key, due));
            PendingAcks {
                target: target.clone(),
                bursts: free_bursts.pop().unwrap_or_default(),
                blocks: free_blocks.pop().unwrap_or_default(),
            }
        })
    }

    fn recycle(&mut self, mut pending: PendingAcks<T>) {
        pending.bursts.clear();
        for (_, mut positions) in pending.blocks.drain(..) {
            positions.clear();
            self.free_positions.push(positions);
        }
        self.free_bursts.push(pending.bursts);
        self.free_blocks.push(pending.blocks);
    }
}

/// Terminal-wide queue of acknowledgments owed to peers.
pub(crate) struct AckBuffer<T> {
    delay: Mics,
    queue: Mutex<AckQueue<T>>,
}

impl<T: AckTarget> AckBuffer<T> {
    pub(crate) fn new(delay: Mics) -> Self {
        Self {
            delay,
            queue: Mutex::new(AckQueue {
                order: VecDeque::new(),
                pending: HashMap::new(),
                free_bursts: Vec::new(),
                free_blocks: Vec::new(),
                free_positions: Vec::new(),
            }),
        }
    }

    /// Queue an ack for a completed burst.
    pub(crate) fn ack_burst(&self, target: &Arc<T>, transmission_id: u32, now: Mics) {
        let key = target.ack_key();
        let mut queue = self.queue.lock();
        let pending = queue.entry(target, key, now + self.delay);
        if !pending.bursts.contains(&transmission_id) {
            pending.bursts.push(transmission_id);
        }
    }

    /// Queue an ack for a block or stream gene. `None` reports the window only.
    pub(crate) fn ack_block(
        &self,
        target: &Arc<T>,
        transmission_id: u32,
        position: Option<i32>,
        now: Mics,
    ) {
        let key = target.ack_key();
        let mut queue = self.queue.lock();
        let known = queue.pending.get(&key).is_some_and(|pending| {
            pending.blocks.iter().any(|(id, _)| *id == transmission_id)
        });
        let spare = (!known).then(|| queue.free_positions.pop().unwrap_or_default());

        let pending = queue.entry(target, key, now + self.delay);
        if let Some(spare) = spare {
            pending.blocks.push((transmission_id, spare));
        }
        if let Some(position) = position {
            if let Some((_, positions)) = pending
                .blocks
                .iter_mut()
                .find(|(id, _)| *id == transmission_id)
            {
                positions.push(position);
            }
        }
    }

    /// Connections with acks queued.
    pub(crate) fn pending_targets(&self) -> usize {
        self.queue.lock().pending.len()
    }

    /// Forget every queued ack.
    pub(crate) fn clear(&self) {
        let mut queue = self.queue.lock();
        queue.order.clear();
        queue.pending.clear();
    }

    /// Flush every connection whose ack delay has passed. Returns the number of frames sent.
    pub(crate) fn process_send(&self, now: Mics) -> usize {
        let due: Vec<PendingAcks<T>> = {
            let mut queue = self.queue.lock();
            let mut due = Vec::new();
            while let Some(&(key, at)) = queue.order.front() {
                if at > now {
                    break;
                }
                queue.order.pop_front();
                if let Some(pending) = queue.pending.remove(&key) {
                    due.push(pending);
                }
            }
            due
        };
        if due.is_empty() {
            return 0;
        }

        let mut frames = 0;
        let mut ranges: Vec<AckRange> = Vec::new();
        for mut pending in due {
            let mut writer = AckFrameWriter::new(MAX_FRAME_SIZE);
            for transmission_id in &pending.bursts {
                writer.write_burst(*transmission_id);
            }
            for (transmission_id, positions) in &mut pending.blocks {
                let Some((max_receive_position, successive)) =
                    pending.target.window_report(*transmission_id)
                else {
                    continue;
                };
                ranges.clear();
                coalesce(positions, successive, &mut ranges);
                writer.write_block(*transmission_id, max_receive_position, successive, &ranges);
            }

            for frame in writer.finish() {
                pending.target.emit_ack_frame(&frame);
                frames += 1;
            }
            trace!(
                connection_id = pending.target.ack_key().connection_id,
                bursts = pending.bursts.len(),
                blocks = pending.blocks.len(),
                "acks flushed"
            );
            self.queue.lock().recycle(pending);
        }
        frames
    }
}

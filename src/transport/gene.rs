//! Genes: the per-packet fragments of a transmission.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tracing::trace;

use super::buffer::RentMemory;
use super::clock::Mics;
use super::congestion::{CongestionControl, GeneKey};
use super::net::PacketLink;
use crate::protocol::{DataControl, NetError, NetResult, TerminalMetrics};

/// Send progress of a gene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendGeneState {
    /// Sealed, never sent
    Initial,
    /// Sent once
    Sent,
    /// Sent more than once
    Resent,
    /// Declared lost, waiting to be resent
    LossDetected,
}

/// Per-connection send counters.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    sends: AtomicU64,
    resends: AtomicU64,
}

impl DeliveryStats {
    fn record(&self, resend: bool) {
        if resend {
            self.resends.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sends.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Genes sent for the first time.
    #[must_use]
    pub fn sends(&self) -> u64 {
        self.sends.load(Ordering::Relaxed)
    }

    /// Genes sent again.
    #[must_use]
    pub fn resends(&self) -> u64 {
        self.resends.load(Ordering::Relaxed)
    }

    /// Share of first sends among all sends; 1.0 before any send.
    #[must_use]
    pub fn delivery_ratio(&self) -> f64 {
        let sends = self.sends();
        let total = sends + self.resends();
        if total == 0 {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = sends as f64 / total as f64;
        ratio
    }
}

/// Everything a gene needs to leave the terminal.
pub(crate) struct Outlet<'a> {
    pub link: &'a PacketLink,
    pub congestion: &'a dyn CongestionControl,
    pub stats: &'a DeliveryStats,
    pub metrics: &'a TerminalMetrics,
}

/// Outbound gene holding its sealed packet.
#[derive(Debug)]
pub struct SendGene {
    position: i32,
    packet: Option<RentMemory>,
    state: SendGeneState,
    sent_mics: Mics,
    send_count: u32,
    reported_loss: bool,
}

impl SendGene {
    /// Create an unsealed gene.
    #[must_use]
    pub fn new(position: i32) -> Self {
        Self {
            position,
            packet: None,
            state: SendGeneState::Initial,
            sent_mics: 0,
            send_count: 0,
            reported_loss: false,
        }
    }

    /// Bind the sealed packet. Returns `false` if one is already bound.
    pub fn set_send(&mut self, packet: RentMemory) -> bool {
        if self.packet.is_some() {
            return false;
        }
        self.packet = Some(packet);
        true
    }

    /// Gene position
    #[must_use]
    pub const fn position(&self) -> i32 {
        self.position
    }

    /// Send state
    #[must_use]
    pub const fn state(&self) -> SendGeneState {
        self.state
    }

    /// Times the gene left the socket.
    #[must_use]
    pub const fn send_count(&self) -> u32 {
        self.send_count
    }

    /// Time of the last send.
    #[must_use]
    pub const fn sent_mics(&self) -> Mics {
        self.sent_mics
    }

    /// Waiting for its first send or a resend.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.state, SendGeneState::Initial | SendGeneState::LossDetected)
    }

    /// Sent and not yet acknowledged or declared lost.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self.state, SendGeneState::Sent | SendGeneState::Resent)
    }

    /// A resend is allowed once the last send is older than the minimum RTT.
    #[must_use]
    pub fn can_resend(&self, now: Mics, minimum_rtt: Mics) -> bool {
        now - self.sent_mics > minimum_rtt
    }

    /// Transmit the packet.
    pub(crate) fn send(
        &mut self,
        transmission_id: u32,
        outlet: &Outlet<'_>,
        now: Mics,
    ) -> NetResult<()> {
        let packet = self.packet.as_ref().ok_or(NetError::InvalidData)?;
        outlet.link.emit(packet)?;

        let resend = self.send_count > 0;
        self.send_count += 1;
        self.sent_mics = now;
        self.reported_loss = false;
        self.state = if resend {
            SendGeneState::Resent
        } else {
            SendGeneState::Sent
        };

        outlet.stats.record(resend);
        outlet.metrics.record_gene_send(resend);
        outlet.congestion.add_in_flight(
            GeneKey {
                transmission_id,
                position: self.position,
            },
            packet.len(),
            now,
        );
        trace!(
            transmission_id,
            position = self.position,
            resend,
            "gene sent"
        );
        Ok(())
    }

    /// Mark the gene lost. Returns `false` if the loss was already reported since the last send.
    pub(crate) fn mark_lost(
        &mut self,
        transmission_id: u32,
        congestion: &dyn CongestionControl,
        now: Mics,
    ) -> bool {
        if !self.is_in_flight() || self.reported_loss {
            return false;
        }
        self.reported_loss = true;
        self.state = SendGeneState::LossDetected;
        congestion.loss_detected(
            GeneKey {
                transmission_id,
                position: self.position,
            },
            now,
        );
        true
    }

    /// Release the gene from congestion accounting.
    pub(crate) fn dispose(
        self,
        transmission_id: u32,
        acked: bool,
        congestion: &dyn CongestionControl,
        now: Mics,
    ) {
        if self.send_count > 0 {
            congestion.remove_in_flight(
                GeneKey {
                    transmission_id,
                    position: self.position,
                },
                acked,
                now,
            );
        }
    }
}

/// Inbound gene.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveGene {
    position: i32,
    payload: Option<Bytes>,
    control: DataControl,
}

impl ReceiveGene {
    /// Create an empty gene.
    #[must_use]
    pub fn new(position: i32) -> Self {
        Self {
            position,
            payload: None,
            control: DataControl::Valid,
        }
    }

    /// Store the payload. The first write wins; returns `false` for duplicates.
    pub fn set_recv(&mut self, payload: Bytes, control: DataControl) -> bool {
        if self.payload.is_some() {
            return false;
        }
        self.payload = Some(payload);
        self.control = control;
        true
    }

    /// Gene position
    #[must_use]
    pub const fn position(&self) -> i32 {
        self.position
    }

    /// Payload received
    #[must_use]
    pub const fn is_received(&self) -> bool {
        self.payload.is_some()
    }

    /// Received payload
    #[must_use]
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Control code
    #[must_use]
    pub const fn control(&self) -> DataControl {
        self.control
    }

    /// Consume the gene, returning the payload (empty if none arrived).
    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload.unwrap_or_default()
    }
}

//! Shared fixtures for transport unit tests.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::buffer::{BufferPool, RentMemory};
use super::congestion::CongestionControl;
use super::embryo::Embryo;
use super::gene::{DeliveryStats, Outlet};
use super::net::{NetSender, PacketLink};
use super::packet_crypto::{NonceSpace, PacketCipher, Sealer};
use crate::protocol::{MAX_PACKET_SIZE, TerminalMetrics};

/// Records every datagram handed to it.
#[derive(Default)]
pub(crate) struct Capture {
    pub sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl NetSender for Capture {
    fn send(&self, endpoint: SocketAddr, packet: RentMemory) {
        self.sent.lock().push((endpoint, packet.to_vec()));
    }
}

pub(crate) struct Fixture {
    pub pool: BufferPool,
    pub capture: Arc<Capture>,
    pub cipher: PacketCipher,
    pub peer_cipher: PacketCipher,
    pub link: PacketLink,
    pub stats: DeliveryStats,
    pub metrics: TerminalMetrics,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let pool = BufferPool::new(MAX_PACKET_SIZE, 64);
        let capture = Arc::new(Capture::default());
        let embryo = Embryo::derive(b"fixture");
        let cipher = PacketCipher::new(
            1,
            embryo.clone(),
            NonceSpace {
                initiator: true,
                response: false,
            },
        );
        let peer_cipher = PacketCipher::new(
            1,
            embryo,
            NonceSpace {
                initiator: false,
                response: true,
            },
        );
        let endpoint: SocketAddr = ([127, 0, 0, 1], 7000).into();
        let link = PacketLink::new(endpoint, 0, capture.clone(), None, pool.clone());
        Self {
            pool,
            capture,
            cipher,
            peer_cipher,
            link,
            stats: DeliveryStats::default(),
            metrics: TerminalMetrics::new(),
        }
    }

    pub(crate) fn sealer(&self) -> Sealer<'_> {
        Sealer {
            cipher: &self.cipher,
            pool: &self.pool,
        }
    }

    pub(crate) fn outlet<'a>(&'a self, congestion: &'a dyn CongestionControl) -> Outlet<'a> {
        Outlet {
            link: &self.link,
            congestion,
            stats: &self.stats,
            metrics: &self.metrics,
        }
    }

    /// Decrypted frames of every captured datagram, in send order.
    pub(crate) fn sent_frames(&self) -> Vec<bytes::Bytes> {
        self.capture
            .sent
            .lock()
            .iter()
            .filter_map(|(_, packet)| self.peer_cipher.open(packet).ok())
            .collect()
    }
}

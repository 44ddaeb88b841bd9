//! Outbound packet path: the datagram sink and optional relay wrapping.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::trace;

use super::buffer::{BufferPool, RentMemory};
use crate::protocol::{NetError, NetResult};

/// Datagram sink used by the terminal.
///
/// Implementations may hold on to `packet` (e.g. in a send queue); the pooled buffer is
/// released once every holder has dropped it.
pub trait NetSender: Send + Sync {
    /// Queue `packet` for delivery to `endpoint`.
    fn send(&self, endpoint: SocketAddr, packet: RentMemory);
}

/// Onion encryption applied to packets of relayed connections.
pub trait RelayEncryptor: Send + Sync {
    /// Wrap `payload` for `hop_count` relays towards `destination`, returning the wrapped
    /// packet and the first-hop endpoint.
    fn try_encrypt(
        &self,
        hop_count: u8,
        destination: SocketAddr,
        payload: &[u8],
    ) -> Option<(Vec<u8>, SocketAddr)>;
}

/// Where and how a connection's packets leave the terminal.
#[derive(Clone)]
pub(crate) struct PacketLink {
    endpoint: SocketAddr,
    relay_hop_count: u8,
    sender: Arc<dyn NetSender>,
    relay: Option<Arc<dyn RelayEncryptor>>,
    pool: BufferPool,
}

impl PacketLink {
    pub(crate) fn new(
        endpoint: SocketAddr,
        relay_hop_count: u8,
        sender: Arc<dyn NetSender>,
        relay: Option<Arc<dyn RelayEncryptor>>,
        pool: BufferPool,
    ) -> Self {
        Self {
            endpoint,
            relay_hop_count,
            sender,
            relay,
            pool,
        }
    }

    pub(crate) fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub(crate) fn relay_hop_count(&self) -> u8 {
        self.relay_hop_count
    }

    /// Hand a sealed packet to the sender, relay-wrapping it when required.
    pub(crate) fn emit(&self, packet: &RentMemory) -> NetResult<()> {
        if self.relay_hop_count == 0 {
            self.sender.send(self.endpoint, packet.increment_and_share());
            return Ok(());
        }

        let relay = self.relay.as_ref().ok_or(NetError::InvalidRelay)?;
        let (wrapped, first_hop) = relay
            .try_encrypt(self.relay_hop_count, self.endpoint, packet)
            .ok_or(NetError::InvalidRelay)?;
        trace!(
            hop_count = self.relay_hop_count,
            %first_hop,
            len = wrapped.len(),
            "packet relayed"
        );
        self.sender.send(first_hop, self.pool.rent_from(&wrapped));
        Ok(())
    }
}

impl std::fmt::Debug for PacketLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketLink")
            .field("endpoint", &self.endpoint)
            .field("relay_hop_count", &self.relay_hop_count)
            .finish_non_exhaustive()
    }
}

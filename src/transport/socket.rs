//! UDP datagram sink backed by a tokio socket.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

use super::buffer::RentMemory;
use super::net::NetSender;

/// Packets parked while the socket is not writable.
const MAX_BACKLOG: usize = 8192;

/// [`NetSender`] writing straight to a non-blocking UDP socket.
///
/// Sends never block the caller. A packet the socket refuses with `WouldBlock` is parked
/// and retried by [`UdpNetSender::flush`].
#[derive(Debug)]
pub struct UdpNetSender {
    socket: Arc<UdpSocket>,
    backlog: Mutex<VecDeque<(SocketAddr, RentMemory)>>,
}

impl UdpNetSender {
    /// Wrap a bound socket.
    #[must_use]
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    /// Underlying socket.
    #[must_use]
    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    /// Packets waiting for the socket.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.backlog.lock().len()
    }

    /// Retry parked packets until the socket refuses again. Returns the number sent.
    pub fn flush(&self) -> usize {
        let mut backlog = self.backlog.lock();
        let mut sent = 0;
        while let Some((endpoint, packet)) = backlog.front() {
            match self.socket.try_send_to(packet, *endpoint) {
                Ok(_) => {
                    backlog.pop_front();
                    sent += 1;
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    warn!(%endpoint, %error, "datagram dropped");
                    backlog.pop_front();
                }
            }
        }
        sent
    }
}

impl NetSender for UdpNetSender {
    fn send(&self, endpoint: SocketAddr, packet: RentMemory) {
        let mut backlog = self.backlog.lock();
        if backlog.is_empty() {
            match self.socket.try_send_to(&packet, endpoint) {
                Ok(_) => return,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
                Err(error) => {
                    warn!(%endpoint, %error, "datagram dropped");
                    return;
                }
            }
        }
        if backlog.len() >= MAX_BACKLOG {
            trace!(%endpoint, "send backlog full");
            return;
        }
        backlog.push_back((endpoint, packet));
    }
}

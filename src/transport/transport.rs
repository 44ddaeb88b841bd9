//! Terminal configuration and the tokio driver that runs a terminal on a UDP socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use super::agreement::Agreement;
use super::clock::{MICS_PER_MILLI, MICS_PER_SECOND, Mics, now_mics, to_mics};
use super::congestion::CongestionConfig;
use super::net::{NetSender, RelayEncryptor};
use super::socket::UdpNetSender;
use super::terminal::ConnectionTerminal;
use crate::protocol::MAX_PACKET_SIZE;

/// Terminal configuration options.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TerminalConfig {
    /// Size of each pooled packet buffer in bytes.
    pub buffer_size: usize,
    /// Idle buffers retained by the pool.
    pub max_buffers: usize,
    /// How long a receiver holds acknowledgments before flushing them.
    pub ack_delay_mics: Mics,
    /// Driver tick for sending.
    pub send_interval: Duration,
    /// Send-list passes per driver tick; the first one is [`ConnectionTerminal::process_send`].
    pub send_passes: usize,
    /// Driver tick for [`ConnectionTerminal::clean`].
    pub clean_interval: Duration,
    /// Spacing of retransmission-timeout checks.
    pub retransmission_check_mics: Mics,
    /// Silence from the peer after which a connection with unacked genes is closed.
    pub transmission_timeout_mics: Mics,
    /// Age of the last ack after which an unfinished send transmission is dropped.
    pub send_transmission_retention_mics: Mics,
    /// How long finished receive transmissions are kept to absorb duplicates.
    pub receive_transmission_retention_mics: Mics,
    /// Delay between closing a connection and disposing of it.
    pub connection_disposal_delay_mics: Mics,
    /// Default deadline for application calls.
    pub default_timeout: Duration,
    /// Cubic parameters.
    pub congestion: CongestionConfig,
    /// Widest agreement this terminal accepts.
    pub agreement_limit: Agreement,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            buffer_size: MAX_PACKET_SIZE,
            max_buffers: 4096,
            ack_delay_mics: MICS_PER_MILLI,
            send_interval: Duration::from_millis(1),
            send_passes: 16,
            clean_interval: Duration::from_secs(1),
            retransmission_check_mics: 100 * MICS_PER_MILLI,
            transmission_timeout_mics: 10 * MICS_PER_SECOND,
            send_transmission_retention_mics: 30 * MICS_PER_SECOND,
            receive_transmission_retention_mics: 5 * MICS_PER_SECOND,
            connection_disposal_delay_mics: 5 * MICS_PER_SECOND,
            default_timeout: Duration::from_secs(30),
            congestion: CongestionConfig::default(),
            agreement_limit: Agreement {
                max_transmissions: 1024,
                max_block_size: 64 * 1024 * 1024,
                max_stream_length: i64::MAX,
                stream_buffer_size: 16 * 1024 * 1024,
                min_connection_retention_mics: 24 * 3600 * MICS_PER_SECOND,
                enable_bidirectional_connection: true,
            },
        }
    }
}

/// A terminal bound to a UDP socket, with its send and receive loops running.
///
/// Dropping the driver stops both loops.
#[derive(Debug)]
pub struct TerminalDriver {
    terminal: Arc<ConnectionTerminal>,
    sender: Arc<UdpNetSender>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl TerminalDriver {
    /// Bind `addr` and start driving a new terminal.
    #[instrument(level = "info", skip(config))]
    pub async fn bind(addr: SocketAddr, config: TerminalConfig) -> io::Result<Self> {
        Self::bind_with(addr, config, None).await
    }

    /// Like [`TerminalDriver::bind`], for a terminal that carries relayed connections.
    #[instrument(level = "info", skip(config, relay))]
    pub async fn bind_with_relay(
        addr: SocketAddr,
        config: TerminalConfig,
        relay: Arc<dyn RelayEncryptor>,
    ) -> io::Result<Self> {
        Self::bind_with(addr, config, Some(relay)).await
    }

    async fn bind_with(
        addr: SocketAddr,
        config: TerminalConfig,
        relay: Option<Arc<dyn RelayEncryptor>>,
    ) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let sender = Arc::new(UdpNetSender::new(socket.clone()));
        let net_sender: Arc<dyn NetSender> = sender.clone();
        let terminal = Arc::new(match relay {
            Some(relay) => ConnectionTerminal::with_relay(config, net_sender, relay),
            None => ConnectionTerminal::new(config, net_sender),
        });

        let tasks = vec![
            tokio::spawn(tick_loop(terminal.clone(), sender.clone())),
            tokio::spawn(receive_loop(terminal.clone(), socket)),
        ];
        info!(%local_addr, "terminal bound");
        Ok(Self {
            terminal,
            sender,
            local_addr,
            tasks,
        })
    }

    /// The driven terminal.
    #[must_use]
    pub fn terminal(&self) -> &Arc<ConnectionTerminal> {
        &self.terminal
    }

    /// Bound socket address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Packets waiting for the socket to become writable.
    #[must_use]
    pub fn send_backlog(&self) -> usize {
        self.sender.backlog()
    }

    /// Close every connection and stop the loops.
    pub fn shutdown(self) {
        self.terminal.close_all(now_mics());
        self.sender.flush();
    }
}

impl Drop for TerminalDriver {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        debug!(local_addr = %self.local_addr, "terminal driver stopped");
    }
}

async fn tick_loop(terminal: Arc<ConnectionTerminal>, sender: Arc<UdpNetSender>) {
    let config = terminal.config().clone();
    let clean_every = to_mics(config.clean_interval);
    let mut ticker = tokio::time::interval(config.send_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_clean = now_mics();
    loop {
        ticker.tick().await;
        let now = now_mics();
        sender.flush();
        let mut sent = terminal.process_send(now);
        for _ in 1..config.send_passes {
            if sent == 0 {
                break;
            }
            sent = terminal.send_pass(now);
        }
        if now - last_clean >= clean_every {
            last_clean = now;
            terminal.clean(now);
        }
    }
}

async fn receive_loop(terminal: Arc<ConnectionTerminal>, socket: Arc<UdpSocket>) {
    let mut buffer = vec![0u8; terminal.config().buffer_size.max(MAX_PACKET_SIZE)];
    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, from)) => terminal.process_receive(from, &buffer[..len], now_mics()),
            Err(error) => {
                warn!(%error, "receive failed");
                tokio::task::yield_now().await;
            }
        }
    }
}

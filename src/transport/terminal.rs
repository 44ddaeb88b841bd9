//! The connection terminal: owns every connection of one local endpoint.
//!
//! A terminal is driven from outside. Datagrams read from the socket are handed to
//! [`ConnectionTerminal::process_receive`]; [`ConnectionTerminal::process_send`] flushes
//! acknowledgments and sends pending genes; [`ConnectionTerminal::clean`] retires idle
//! connections and expired transmissions. [`super::TerminalDriver`] runs all three on a
//! tokio UDP socket.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace};

use super::ack_buffer::AckBuffer;
use super::buffer::BufferPool;
use super::clock::Mics;
use super::congestion::{CongestionControl, CubicCongestion, NoCongestion};
use super::connection::{ClientConnection, Connection, ConnectionSeed, Role, ServerConnection};
use super::embryo::NegotiatedConnection;
use super::net::{NetSender, RelayEncryptor};
use super::scheduler::SendList;
use super::stream::ReceiveStream;
use super::transport::TerminalConfig;
use crate::protocol::{
    ConnectionState, Message, MetricsSnapshot, NetError, NetResult, PacketHeader, TerminalMetrics,
};

/// Something the peer sent that no local call was waiting for.
#[derive(Debug)]
pub enum Incoming {
    /// A complete burst or block message.
    Message(IncomingMessage),
    /// A newly opened stream.
    Stream(IncomingStream),
}

/// Unsolicited message received on a server connection.
#[derive(Debug)]
pub struct IncomingMessage {
    /// Connection the message arrived on.
    pub connection: ServerConnection,
    /// Transmission id; answer with the same id to reach the requester.
    pub transmission_id: u32,
    /// The message.
    pub message: Message,
}

impl IncomingMessage {
    /// Answer the request with `message`.
    pub async fn respond(&self, message: &Message) -> NetResult<()> {
        self.connection
            .respond(self.transmission_id, message)
            .await
    }
}

/// Stream opened by the peer.
#[derive(Debug)]
pub struct IncomingStream {
    /// Connection the stream arrived on.
    pub connection: ServerConnection,
    /// Reading half.
    pub stream: ReceiveStream,
}

/// Connections of one terminal, keyed by connection id per role.
#[derive(Default)]
pub(crate) struct Registry {
    clients: Mutex<HashMap<u64, Arc<Connection>>>,
    servers: Mutex<HashMap<u64, Arc<Connection>>>,
}

impl Registry {
    fn map(&self, role: Role) -> &Mutex<HashMap<u64, Arc<Connection>>> {
        match role {
            Role::Client => &self.clients,
            Role::Server => &self.servers,
        }
    }

    pub(crate) fn insert(&self, connection: &Arc<Connection>) {
        self.map(connection.role())
            .lock()
            .insert(connection.connection_id(), connection.clone());
    }

    fn get(&self, role: Role, connection_id: u64) -> Option<Arc<Connection>> {
        self.map(role).lock().get(&connection_id).cloned()
    }

    fn remove(&self, connection: &Arc<Connection>) {
        let mut map = self.map(connection.role()).lock();
        if map
            .get(&connection.connection_id())
            .is_some_and(|current| Arc::ptr_eq(current, connection))
        {
            map.remove(&connection.connection_id());
        }
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut all: Vec<Arc<Connection>> = self.clients.lock().values().cloned().collect();
        all.extend(self.servers.lock().values().cloned());
        all
    }

    fn len(&self, role: Role) -> usize {
        self.map(role).lock().len()
    }

    fn clear(&self) {
        self.clients.lock().clear();
        self.servers.lock().clear();
    }
}

/// State shared by a terminal and all of its connections.
pub(crate) struct TerminalContext {
    pub(crate) config: TerminalConfig,
    pub(crate) pool: BufferPool,
    pub(crate) sender: Arc<dyn NetSender>,
    pub(crate) relay: Option<Arc<dyn RelayEncryptor>>,
    pub(crate) ack_buffer: AckBuffer<Connection>,
    pub(crate) send_list: Mutex<SendList<Connection>>,
    pub(crate) congestion_list: Mutex<Vec<Arc<CubicCongestion>>>,
    pub(crate) no_congestion: Arc<NoCongestion>,
    pub(crate) registry: Registry,
    pub(crate) incoming: mpsc::UnboundedSender<Incoming>,
    pub(crate) metrics: TerminalMetrics,
}

/// Owner of the connections behind one UDP endpoint.
pub struct ConnectionTerminal {
    context: Arc<TerminalContext>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Incoming>>>,
    last_tick_mics: AtomicI64,
    last_retransmission_check_mics: AtomicI64,
}

impl ConnectionTerminal {
    /// Create a terminal sending through `sender`.
    #[must_use]
    pub fn new(config: TerminalConfig, sender: Arc<dyn NetSender>) -> Self {
        Self::build(config, sender, None)
    }

    /// Create a terminal that can carry relayed connections.
    #[must_use]
    pub fn with_relay(
        config: TerminalConfig,
        sender: Arc<dyn NetSender>,
        relay: Arc<dyn RelayEncryptor>,
    ) -> Self {
        Self::build(config, sender, Some(relay))
    }

    fn build(
        config: TerminalConfig,
        sender: Arc<dyn NetSender>,
        relay: Option<Arc<dyn RelayEncryptor>>,
    ) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let context = Arc::new(TerminalContext {
            pool: BufferPool::new(config.buffer_size, config.max_buffers),
            ack_buffer: AckBuffer::new(config.ack_delay_mics),
            config,
            sender,
            relay,
            send_list: Mutex::new(SendList::new()),
            congestion_list: Mutex::new(Vec::new()),
            no_congestion: Arc::new(NoCongestion),
            registry: Registry::default(),
            incoming: incoming_tx,
            metrics: TerminalMetrics::new(),
        });
        Self {
            context,
            incoming: Mutex::new(Some(incoming_rx)),
            last_tick_mics: AtomicI64::new(0),
            last_retransmission_check_mics: AtomicI64::new(0),
        }
    }

    /// Terminal configuration.
    #[must_use]
    pub fn config(&self) -> &TerminalConfig {
        &self.context.config
    }

    /// Packet buffer pool shared by every connection.
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.context.pool
    }

    fn prepare(
        &self,
        role: Role,
        negotiated: &NegotiatedConnection,
        endpoint: SocketAddr,
        relay_hop_count: u8,
        now: Mics,
    ) -> NetResult<Arc<Connection>> {
        if !self
            .context
            .config
            .agreement_limit
            .is_inclusive(&negotiated.agreement)
        {
            return Err(NetError::InvalidData);
        }
        if relay_hop_count > 0 && self.context.relay.is_none() {
            return Err(NetError::InvalidRelay);
        }

        if let Some(existing) = self.context.registry.get(role, negotiated.connection_id) {
            if existing.state() != ConnectionState::Disposed {
                return Ok(existing);
            }
        }

        let initiator = role == Role::Client;
        let (nonce, twin_nonce) = ConnectionSeed::nonce_counters(initiator, role);
        let connection = Connection::new(
            self.context.clone(),
            role,
            ConnectionSeed {
                connection_id: negotiated.connection_id,
                embryo: negotiated.embryo.clone(),
                agreement: negotiated.agreement,
                endpoint,
                relay_hop_count,
                initiator,
                nonce,
                twin_nonce,
            },
            now,
        );
        self.context.registry.insert(&connection);
        info!(
            connection_id = negotiated.connection_id,
            ?role,
            %endpoint,
            relay_hop_count,
            "connection prepared"
        );
        Ok(connection)
    }

    /// Register the client side of a negotiated connection.
    pub fn prepare_client_connection(
        &self,
        negotiated: &NegotiatedConnection,
        endpoint: SocketAddr,
        relay_hop_count: u8,
        now: Mics,
    ) -> NetResult<ClientConnection> {
        self.prepare(Role::Client, negotiated, endpoint, relay_hop_count, now)
            .map(ClientConnection::new)
    }

    /// Register the server side of a negotiated connection.
    pub fn prepare_server_connection(
        &self,
        negotiated: &NegotiatedConnection,
        endpoint: SocketAddr,
        relay_hop_count: u8,
        now: Mics,
    ) -> NetResult<ServerConnection> {
        self.prepare(Role::Server, negotiated, endpoint, relay_hop_count, now)
            .map(ServerConnection::new)
    }

    /// Open client connection towards `endpoint`, if any.
    #[must_use]
    pub fn find_client_connection(&self, endpoint: SocketAddr) -> Option<ClientConnection> {
        self.context
            .registry
            .clients
            .lock()
            .values()
            .find(|connection| connection.endpoint() == endpoint && connection.is_open())
            .cloned()
            .map(ClientConnection::new)
    }

    /// Take the queue of unsolicited messages and streams. Returns `None` after the first
    /// call.
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Incoming>> {
        self.incoming.lock().take()
    }

    /// Flush due acks, then give every active connection one gene-send attempt.
    ///
    /// Returns the number of genes sent. Drivers that want more throughput per tick follow
    /// up with [`ConnectionTerminal::send_pass`].
    pub fn process_send(&self, now: Mics) -> usize {
        let context = &self.context;
        let elapsed = now - self.last_tick_mics.swap(now, Ordering::Relaxed);
        context
            .congestion_list
            .lock()
            .retain(|cubic| cubic.process(now, elapsed));

        context.ack_buffer.process_send(now);

        let last_check = self.last_retransmission_check_mics.load(Ordering::Relaxed);
        if now - last_check >= context.config.retransmission_check_mics {
            self.last_retransmission_check_mics
                .store(now, Ordering::Relaxed);
            for connection in context.registry.snapshot() {
                connection.check_retransmission(now);
            }
        }

        self.send_pass(now)
    }

    /// One round-robin pass over the send list. Returns the number of genes sent.
    pub fn send_pass(&self, now: Mics) -> usize {
        self.context.send_list.lock().process(now)
    }

    /// Route one datagram received from `endpoint` to its connection.
    #[instrument(level = "trace", skip(self, datagram), fields(len = datagram.len()))]
    pub fn process_receive(&self, endpoint: SocketAddr, datagram: &[u8], now: Mics) {
        let metrics = &self.context.metrics;
        let header = match PacketHeader::from_bytes(datagram) {
            Ok(header) => header,
            Err(error) => {
                trace!(%error, "runt datagram");
                metrics.record_dropped();
                return;
            }
        };
        let Some(packet_type) = header.packet_type().filter(|kind| kind.is_protected()) else {
            trace!(
                packet_type = header.packet_type_raw(),
                "unhandled packet type"
            );
            metrics.record_dropped();
            return;
        };

        let role = if packet_type.is_response() {
            Role::Client
        } else {
            Role::Server
        };
        let Some(connection) = self.context.registry.get(role, header.id()) else {
            trace!(connection_id = header.id(), "unknown connection");
            metrics.record_dropped();
            return;
        };
        if connection.relay_hop_count() == 0 && connection.endpoint() != endpoint {
            debug!(
                connection_id = header.id(),
                %endpoint,
                "datagram from unexpected endpoint"
            );
            metrics.record_dropped();
            return;
        }
        if connection.salt() != header.salt() {
            trace!(connection_id = header.id(), "salt mismatch");
            metrics.record_dropped();
            return;
        }

        connection.process_datagram(datagram, now);
    }

    /// Sweep every connection. Returns the number of connections disposed.
    pub fn clean(&self, now: Mics) -> usize {
        let mut disposed = 0;
        for connection in self.context.registry.snapshot() {
            if connection.clean(now) == ConnectionState::Disposed {
                self.context.registry.remove(&connection);
                disposed += 1;
            }
        }
        if disposed > 0 {
            debug!(disposed, "connections disposed");
        }
        disposed
    }

    /// Close every connection, notifying the peers.
    pub fn close_all(&self, now: Mics) {
        for connection in self.context.registry.snapshot() {
            connection.close(now, true);
        }
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.context.metrics.snapshot()
    }

    /// Registered client connections.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.context.registry.len(Role::Client)
    }

    /// Registered server connections.
    #[must_use]
    pub fn server_count(&self) -> usize {
        self.context.registry.len(Role::Server)
    }

    /// Connections waiting in the send list as `(active, congested)`.
    #[must_use]
    pub fn send_list_len(&self) -> (usize, usize) {
        let send_list = self.context.send_list.lock();
        (send_list.active_len(), send_list.congested_len())
    }

    /// Connections with acknowledgments queued.
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.context.ack_buffer.pending_targets()
    }
}

impl Drop for ConnectionTerminal {
    fn drop(&mut self) {
        self.context.send_list.lock().clear();
        self.context.ack_buffer.clear();
        self.context.registry.clear();
        self.context.congestion_list.lock().clear();
    }
}

impl fmt::Debug for ConnectionTerminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTerminal")
            .field("clients", &self.client_count())
            .field("servers", &self.server_count())
            .finish_non_exhaustive()
    }
}

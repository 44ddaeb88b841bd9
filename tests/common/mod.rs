//! In-memory network shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use helix::transport::RentMemory;
use helix::{
    Agreement, ClientConnection, ConnectionTerminal, Incoming, NegotiatedConnection, NetSender,
    ServerConnection, TerminalConfig, now_mics,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const CLIENT_ADDR: ([u8; 4], u16) = ([10, 0, 0, 1], 4000);
pub const SERVER_ADDR: ([u8; 4], u16) = ([10, 0, 0, 2], 5000);

/// Datagrams in flight between the two terminals.
#[derive(Default)]
pub struct Wire {
    queue: Mutex<VecDeque<(SocketAddr, SocketAddr, Vec<u8>)>>,
    drop_every: AtomicUsize,
    counter: AtomicUsize,
    delivered: AtomicUsize,
}

impl Wire {
    /// Drop every `n`th datagram (0 disables loss).
    pub fn set_drop_every(&self, n: usize) {
        self.drop_every.store(n, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }

    fn push(&self, from: SocketAddr, to: SocketAddr, packet: &[u8]) {
        let n = self.drop_every.load(Ordering::Relaxed);
        let count = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        if n > 0 && count % n == 0 {
            return;
        }
        self.queue.lock().push_back((from, to, packet.to_vec()));
    }

    /// Remove every queued datagram as `(from, to, packet)`.
    pub fn take(&self) -> Vec<(SocketAddr, SocketAddr, Vec<u8>)> {
        self.queue.lock().drain(..).collect()
    }
}

/// One side's view of the wire.
pub struct Port {
    local: SocketAddr,
    wire: Arc<Wire>,
}

impl NetSender for Port {
    fn send(&self, endpoint: SocketAddr, packet: RentMemory) {
        self.wire.push(self.local, endpoint, &packet);
    }
}

/// Two terminals joined by a [`Wire`], pumped by a background task.
pub struct Pair {
    pub client: Arc<ConnectionTerminal>,
    pub server: Arc<ConnectionTerminal>,
    pub wire: Arc<Wire>,
    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pump: Option<JoinHandle<()>>,
}

impl Pair {
    pub fn new() -> Self {
        Self::with_config(TerminalConfig::default())
    }

    pub fn with_config(config: TerminalConfig) -> Self {
        Self::with_configs(config.clone(), config)
    }

    pub fn with_configs(client_config: TerminalConfig, server_config: TerminalConfig) -> Self {
        let wire = Arc::new(Wire::default());
        let client_addr = SocketAddr::from(CLIENT_ADDR);
        let server_addr = SocketAddr::from(SERVER_ADDR);
        let client = Arc::new(ConnectionTerminal::new(
            client_config,
            Arc::new(Port {
                local: client_addr,
                wire: wire.clone(),
            }),
        ));
        let server = Arc::new(ConnectionTerminal::new(
            server_config,
            Arc::new(Port {
                local: server_addr,
                wire: wire.clone(),
            }),
        ));
        Self {
            client,
            server,
            wire,
            client_addr,
            server_addr,
            pump: None,
        }
    }

    /// Deliver queued datagrams and run the configured send passes on both terminals.
    pub fn step(&self) {
        let now = now_mics();
        for (from, to, packet) in self.wire.take() {
            self.wire.delivered.fetch_add(1, Ordering::Relaxed);
            if to == self.server_addr {
                self.server.process_receive(from, &packet, now);
            } else if to == self.client_addr {
                self.client.process_receive(from, &packet, now);
            }
        }
        for terminal in [&self.client, &self.server] {
            let mut sent = terminal.process_send(now);
            for _ in 1..terminal.config().send_passes {
                if sent == 0 {
                    break;
                }
                sent = terminal.send_pass(now);
            }
        }
    }

    /// Start pumping every millisecond.
    pub fn start(&mut self) {
        let client = self.client.clone();
        let server = self.server.clone();
        let wire = self.wire.clone();
        let (client_addr, server_addr) = (self.client_addr, self.server_addr);
        self.pump = Some(tokio::spawn(async move {
            let pair = Pair {
                client,
                server,
                wire,
                client_addr,
                server_addr,
                pump: None,
            };
            loop {
                pair.step();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }));
    }

    /// Register both ends of one connection.
    pub fn connect(&self, agreement: Agreement) -> (ClientConnection, ServerConnection) {
        let negotiated = NegotiatedConnection::from_material(b"integration", agreement);
        let now = now_mics();
        let server = self
            .server
            .prepare_server_connection(&negotiated, self.client_addr, 0, now)
            .unwrap();
        let client = self
            .client
            .prepare_client_connection(&negotiated, self.server_addr, 0, now)
            .unwrap();
        (client, server)
    }

    pub fn server_incoming(&self) -> mpsc::UnboundedReceiver<Incoming> {
        self.server.take_incoming().unwrap()
    }

    pub fn client_incoming(&self) -> mpsc::UnboundedReceiver<Incoming> {
        self.client.take_incoming().unwrap()
    }
}

impl Drop for Pair {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

pub fn payload(length: usize) -> Vec<u8> {
    (0..length)
        .map(|index| u8::try_from(index % 251).unwrap())
        .collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

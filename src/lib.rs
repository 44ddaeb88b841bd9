//! Helix - connection-oriented reliable transport over UDP
//!
//! Helix multiplexes many independent *transmissions* over one encrypted connection. A
//! transmission carries either a whole message (a *burst* of up to three packets, or a
//! windowed *block*) or an open-ended *stream*, sliced into packet-sized *genes* that are
//! acknowledged, resent on loss and reassembled in order on the other side.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use helix::{Agreement, Message, NegotiatedConnection, TerminalConfig, TerminalDriver};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = TerminalDriver::bind("127.0.0.1:0".parse()?, TerminalConfig::default()).await?;
//! let client = TerminalDriver::bind("127.0.0.1:0".parse()?, TerminalConfig::default()).await?;
//!
//! // Both sides derive the same connection from the handshake material.
//! let negotiated = NegotiatedConnection::from_material(b"shared secret", Agreement::default());
//! let now = helix::now_mics();
//! server
//!     .terminal()
//!     .prepare_server_connection(&negotiated, client.local_addr(), 0, now)?;
//! let connection = client
//!     .terminal()
//!     .prepare_client_connection(&negotiated, server.local_addr(), 0, now)?;
//!
//! connection.send_block(&Message::new(1, 7, &b"hello"[..])).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Fragmentation and reassembly** - payloads are split into genes and rebuilt in order
//! - **Deferred, coalesced acknowledgments** - one Ack frame covers many genes
//! - **Loss detection and resend** - gap-based detection with a timeout fallback
//! - **Cubic congestion control** - switched on per connection under load
//! - **Backpressured streams** - the receiver's window throttles the sender
//! - **AEAD packet protection** - AES-256-GCM bound to the connection

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod protocol;
pub mod transport;

pub use protocol::{
    ConnectionState, DataControl, FrameError, FrameType, MAX_FRAME_SIZE, MAX_GENE_LENGTH,
    MAX_PACKET_SIZE, Message, MetricsSnapshot, NetError, NetResult, PacketHeader, PacketType,
    TransmissionMode,
};
pub use transport::{
    Agreement, ClientConnection, ConnectionTerminal, Incoming, IncomingMessage, IncomingStream,
    Mics, NegotiatedConnection, NetSender, ReceiveStream, RelayEncryptor, SendStream,
    ServerConnection, TerminalConfig, TerminalDriver, now_mics,
};

/// Helix protocol version
pub const VERSION: &str = "1.0.0";

/// Default Helix port
pub const DEFAULT_PORT: u16 = 9500;

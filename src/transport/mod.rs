//! Helix transport: connections, transmissions and the terminal that drives them.

mod ack;
mod ack_buffer;
mod aead;
mod agreement;
mod buffer;
mod clock;
mod congestion;
mod connection;
mod embryo;
mod error;
mod gene;
mod net;
mod packet_crypto;
mod receive_transmission;
mod rtt;
mod scheduler;
mod send_transmission;
mod socket;
mod stream;
mod terminal;
#[cfg(test)]
mod testing;
mod transport;
mod window;

pub use ack::{
    ACK_PAIR_SIZE, AckEntry, AckFrameWriter, AckRange, BLOCK_ENTRY_HEADER_SIZE, BURST_ENTRY_SIZE,
    coalesce, decode_ack_entries,
};
pub use aead::{AEAD_KEY_LEN, AEAD_NONCE_LEN, Aead, AesGcmAead};
pub use agreement::Agreement;
pub use buffer::{Buffer, BufferPool, RentMemory};
pub use clock::{MICS_PER_MILLI, MICS_PER_SECOND, Mics, now_mics, to_duration, to_mics};
pub use congestion::{
    CongestionConfig, CongestionControl, CubicCongestion, GeneKey, NoCongestion,
};
pub use connection::{ClientConnection, ServerConnection};
pub use embryo::{EMBRYO_SECRET_LEN, Embryo, NegotiatedConnection, derive_connection_id};
pub use error::CryptoError;
pub use gene::{DeliveryStats, ReceiveGene, SendGene, SendGeneState};
pub use net::{NetSender, RelayEncryptor};
pub use packet_crypto::PacketCipher;
pub use rtt::{INITIAL_RTT_MICS, MAX_RTT_MICS, MIN_RTT_MICS, RttStats};
pub use socket::UdpNetSender;
pub use stream::{ReceiveStream, SendStream};
pub use terminal::{ConnectionTerminal, Incoming, IncomingMessage, IncomingStream};
pub use transport::{TerminalConfig, TerminalDriver};
pub use window::{GeneStore, GeneWindow};

//! Helix packet, frame and transmission types

use std::fmt;

use super::FrameError;

/// Packet types carried in the packet header.
///
/// Client-originated types occupy `0x0000..0x8000`, server responses `0x8000..`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    /// Handshake request
    Connect = 0x0000,
    /// Reachability probe
    Ping = 0x0001,
    /// NAT hole punching probe
    Punch = 0x0002,
    /// Encrypted frame sent by the client side of a connection
    Protected = 0x0003,

    /// Handshake response
    ConnectResponse = 0x8000,
    /// Reachability probe response
    PingResponse = 0x8001,
    /// NAT hole punching response
    PunchResponse = 0x8002,
    /// Encrypted frame sent by the server side of a connection
    ProtectedResponse = 0x8003,
}

impl PacketType {
    /// First value of the server-response range.
    pub const RESPONSE_BASE: u16 = 0x8000;

    /// Convert from the wire value
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Connect),
            0x0001 => Some(Self::Ping),
            0x0002 => Some(Self::Punch),
            0x0003 => Some(Self::Protected),
            0x8000 => Some(Self::ConnectResponse),
            0x8001 => Some(Self::PingResponse),
            0x8002 => Some(Self::PunchResponse),
            0x8003 => Some(Self::ProtectedResponse),
            _ => None,
        }
    }

    /// Convert to the wire value
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Check if this type belongs to the server-response range
    #[must_use]
    pub const fn is_response(self) -> bool {
        self.as_u16() >= Self::RESPONSE_BASE
    }

    /// Check if this type carries an encrypted connection frame
    #[must_use]
    pub const fn is_protected(self) -> bool {
        matches!(self, Self::Protected | Self::ProtectedResponse)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "Connect",
            Self::Ping => "Ping",
            Self::Punch => "Punch",
            Self::Protected => "Protected",
            Self::ConnectResponse => "ConnectResponse",
            Self::PingResponse => "PingResponse",
            Self::PunchResponse => "PunchResponse",
            Self::ProtectedResponse => "ProtectedResponse",
        };
        write!(f, "{name}")
    }
}

/// Frame types inside a protected packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameType {
    /// Connection close
    Close = 0,
    /// Acknowledgment of genes
    Ack = 1,
    /// First gene of a transmission, carrying its header
    FirstGene = 2,
    /// Any subsequent gene
    FollowingGene = 3,
    /// Stream window probe
    Knock = 4,
    /// Immediate window report answering a knock
    KnockResponse = 5,
    /// Proposal to widen the connection agreement
    AgreementUpdate = 6,
    /// Peer's verdict on an agreement update
    AgreementResponse = 7,
}

impl FrameType {
    /// Convert from the wire value
    pub fn from_u16(value: u16) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Self::Close),
            1 => Ok(Self::Ack),
            2 => Ok(Self::FirstGene),
            3 => Ok(Self::FollowingGene),
            4 => Ok(Self::Knock),
            5 => Ok(Self::KnockResponse),
            6 => Ok(Self::AgreementUpdate),
            7 => Ok(Self::AgreementResponse),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }

    /// Convert to the wire value
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Transmission mode.
///
/// Only `Burst`, `Block` and `Stream` appear on the wire; the other states are local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TransmissionMode {
    /// Created but not yet carrying data
    Initial = 0,
    /// Up to three genes stored inline
    Burst = 1,
    /// Fixed-size message stored in a window
    Block = 2,
    /// Open-ended stream with flow control
    Stream = 3,
    /// Stream finished, waiting for disposal
    StreamCompleted = 4,
    /// Finished
    Disposed = 5,
}

impl TransmissionMode {
    /// Convert from the wire value, accepting only modes that travel on the wire
    pub fn from_wire(value: u16) -> Result<Self, FrameError> {
        match value {
            1 => Ok(Self::Burst),
            2 => Ok(Self::Block),
            3 => Ok(Self::Stream),
            other => Err(FrameError::InvalidMode(other)),
        }
    }

    /// Convert to the wire value
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Check if the transmission is still carrying data
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Burst | Self::Block | Self::Stream)
    }
}

impl fmt::Display for TransmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "Initial",
            Self::Burst => "Burst",
            Self::Block => "Block",
            Self::Stream => "Stream",
            Self::StreamCompleted => "StreamCompleted",
            Self::Disposed => "Disposed",
        };
        write!(f, "{name}")
    }
}

/// Per-gene control code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u16)]
pub enum DataControl {
    /// Regular payload
    #[default]
    Valid = 0,
    /// Last gene of a stream
    Complete = 1,
    /// Stream aborted by the sender
    Cancel = 2,
}

impl DataControl {
    /// Convert from the wire value
    pub fn from_u16(value: u16) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Self::Valid),
            1 => Ok(Self::Complete),
            2 => Ok(Self::Cancel),
            other => Err(FrameError::InvalidDataControl(other)),
        }
    }

    /// Convert to the wire value
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Check if this code terminates a stream
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Valid)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Carrying traffic
    Open,
    /// Closed, may reopen on inbound traffic until disposed
    Closed,
    /// Torn down, about to leave the registry
    Disposed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "Open",
            Self::Closed => "Closed",
            Self::Disposed => "Disposed",
        };
        write!(f, "{name}")
    }
}

//! Packet sealing and opening with the connection embryo.
//!
//! ```text
//! [PacketHeader (18)][Nonce:u64][ciphertext ...][tag (16)]
//! ```
//!
//! The AEAD nonce is `Salt:u32 ‖ Nonce:u64`; the associated data is the packet header, the
//! connection id and the embryo secret.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, Bytes, BytesMut};

use super::aead::{AEAD_NONCE_LEN, Aead, AesGcmAead};
use super::buffer::{BufferPool, RentMemory};
use super::embryo::{EMBRYO_SECRET_LEN, Embryo};
use super::error::CryptoError;
use crate::protocol::{
    MAX_PACKET_SIZE, NONCE_SIZE, NetResult, PACKET_HEADER_SIZE, PROTECTED_OVERHEAD,
    PacketHeader, PacketType, TAG_SIZE,
};

const AAD_LEN: usize = PACKET_HEADER_SIZE + 8 + EMBRYO_SECRET_LEN;

/// Separates the nonce spaces of the (up to four) senders sharing one embryo.
///
/// Both ends of a connection and both ends of its bidirectional twin use the same key, so
/// each sender owns a distinct top-two-bit prefix of the 64-bit packet nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NonceSpace {
    /// The side that originally prepared the connection as a client.
    pub initiator: bool,
    /// Sends response packet types.
    pub response: bool,
}

impl NonceSpace {
    const fn first_nonce(self) -> u64 {
        let initiator = if self.initiator { 1u64 << 63 } else { 0 };
        let response = if self.response { 1u64 << 62 } else { 0 };
        initiator | response
    }

    /// Fresh nonce counter at the start of this space.
    pub(crate) fn counter(self) -> Arc<AtomicU64> {
        Arc::new(AtomicU64::new(self.first_nonce()))
    }
}

/// Seals outbound frames and opens inbound packets for one connection.
pub struct PacketCipher {
    aead: Box<dyn Aead>,
    embryo: Embryo,
    connection_id: u64,
    packet_type: PacketType,
    next_nonce: Arc<AtomicU64>,
}

impl PacketCipher {
    pub(crate) fn new(connection_id: u64, embryo: Embryo, nonce_space: NonceSpace) -> Self {
        Self::with_counter(connection_id, embryo, nonce_space, nonce_space.counter())
    }

    /// Cipher drawing nonces from `next_nonce`.
    ///
    /// Ciphers that seal under the same key and nonce space must share the counter.
    pub(crate) fn with_counter(
        connection_id: u64,
        embryo: Embryo,
        nonce_space: NonceSpace,
        next_nonce: Arc<AtomicU64>,
    ) -> Self {
        let aead: Box<dyn Aead> = Box::new(AesGcmAead::new(embryo.key()));
        let packet_type = if nonce_space.response {
            PacketType::ProtectedResponse
        } else {
            PacketType::Protected
        };
        Self {
            aead,
            embryo,
            connection_id,
            packet_type,
            next_nonce,
        }
    }

    /// Counter the next sealed packet draws its nonce from.
    pub(crate) fn nonce_counter(&self) -> Arc<AtomicU64> {
        self.next_nonce.clone()
    }

    /// Packet type stamped on sealed packets.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Seal the frame produced by `write` into a pooled packet.
    ///
    /// # Panics
    ///
    /// Panics if the frame does not fit into [`MAX_PACKET_SIZE`].
    pub fn seal_frame(
        &self,
        pool: &BufferPool,
        write: impl FnOnce(&mut Vec<u8>),
    ) -> Result<RentMemory, CryptoError> {
        let mut buffer = pool.acquire();
        let data = buffer.data_mut();

        let header = PacketHeader::new(self.packet_type, self.embryo.salt(), self.connection_id);
        data.extend_from_slice(&header.to_bytes());
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        data.put_u64_le(nonce);
        let start = data.len();

        write(data);
        assert!(
            data.len() + TAG_SIZE <= MAX_PACKET_SIZE,
            "frame of {} bytes exceeds the packet size",
            data.len() - start
        );

        let aad = self.associated_data(&data[..PACKET_HEADER_SIZE]);
        let tag = self
            .aead
            .seal_in_place(&self.aead_nonce(nonce), &aad, &mut data[start..])?;
        data.extend_from_slice(&tag);

        Ok(buffer.freeze())
    }

    /// Authenticate and decrypt a whole datagram, returning the frame.
    pub fn open(&self, datagram: &[u8]) -> Result<Bytes, CryptoError> {
        if datagram.len() < PROTECTED_OVERHEAD {
            return Err(CryptoError::Truncated {
                needed: PROTECTED_OVERHEAD,
                got: datagram.len(),
            });
        }

        let (header_bytes, rest) = datagram.split_at(PACKET_HEADER_SIZE);
        let (nonce_bytes, body) = rest.split_at(NONCE_SIZE);
        let (ciphertext, tag) = body.split_at(body.len() - TAG_SIZE);

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);
        let nonce = u64::from_le_bytes(nonce);

        let aad = self.associated_data(header_bytes);
        let mut frame = BytesMut::from(ciphertext);
        self.aead
            .open_in_place(&self.aead_nonce(nonce), &aad, &mut frame, tag)?;
        Ok(frame.freeze())
    }

    fn aead_nonce(&self, nonce: u64) -> [u8; AEAD_NONCE_LEN] {
        let mut out = [0u8; AEAD_NONCE_LEN];
        out[..4].copy_from_slice(&self.embryo.salt().to_le_bytes());
        out[4..].copy_from_slice(&nonce.to_le_bytes());
        out
    }

    fn associated_data(&self, header: &[u8]) -> [u8; AAD_LEN] {
        let mut aad = [0u8; AAD_LEN];
        aad[..PACKET_HEADER_SIZE].copy_from_slice(header);
        aad[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + 8]
            .copy_from_slice(&self.connection_id.to_le_bytes());
        aad[PACKET_HEADER_SIZE + 8..].copy_from_slice(self.embryo.secret());
        aad
    }
}

/// Cipher and pool pair used to turn frames into sealed packets.
#[derive(Clone, Copy)]
pub(crate) struct Sealer<'a> {
    pub cipher: &'a PacketCipher,
    pub pool: &'a BufferPool,
}

impl Sealer<'_> {
    pub(crate) fn seal(&self, write: impl FnOnce(&mut Vec<u8>)) -> NetResult<RentMemory> {
        Ok(self.cipher.seal_frame(self.pool, write)?)
    }
}

impl std::fmt::Debug for PacketCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCipher")
            .field("connection_id", &self.connection_id)
            .field("packet_type", &self.packet_type)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (PacketCipher, PacketCipher) {
        let embryo = Embryo::derive(b"cipher test");
        let client = PacketCipher::new(
            9,
            embryo.clone(),
            NonceSpace {
                initiator: true,
                response: false,
            },
        );
        let server = PacketCipher::new(
            9,
            embryo,
            NonceSpace {
                initiator: false,
                response: true,
            },
        );
        (client, server)
    }

    #[test]
    fn sealed_packet_opens_on_the_other_side() {
        let pool = BufferPool::new(MAX_PACKET_SIZE, 4);
        let (client, server) = pair();

        let packet = client
            .seal_frame(&pool, |out| out.extend_from_slice(b"frame bytes"))
            .unwrap();
        assert_eq!(packet.len(), PROTECTED_OVERHEAD + 11);

        let header = PacketHeader::from_bytes(&packet).unwrap();
        assert_eq!(header.packet_type(), Some(PacketType::Protected));
        assert_eq!(header.id(), 9);

        let frame = server.open(&packet).unwrap();
        assert_eq!(&frame[..], b"frame bytes");
    }

    #[test]
    fn tampered_header_is_rejected() {
        let pool = BufferPool::new(MAX_PACKET_SIZE, 4);
        let (client, server) = pair();
        let packet = client
            .seal_frame(&pool, |out| out.extend_from_slice(b"frame"))
            .unwrap();

        let mut tampered = packet.to_vec();
        tampered[0] ^= 1;
        assert_eq!(server.open(&tampered), Err(CryptoError::Authentication));
    }

    #[test]
    fn nonce_spaces_do_not_overlap() {
        let spaces = [
            NonceSpace { initiator: false, response: false },
            NonceSpace { initiator: false, response: true },
            NonceSpace { initiator: true, response: false },
            NonceSpace { initiator: true, response: true },
        ];
        let starts: Vec<u64> = spaces.iter().map(|space| space.first_nonce()).collect();
        for (index, start) in starts.iter().enumerate() {
            for other in &starts[index + 1..] {
                assert!(start.abs_diff(*other) >= 1 << 62);
            }
        }
    }

    #[test]
    fn ciphers_sharing_a_counter_never_repeat_a_nonce() {
        let pool = BufferPool::new(MAX_PACKET_SIZE, 4);
        let space = NonceSpace {
            initiator: true,
            response: true,
        };
        let counter = space.counter();
        let embryo = Embryo::derive(b"shared counter");
        let nonce = |packet: &[u8]| {
            let mut bytes = [0u8; NONCE_SIZE];
            bytes.copy_from_slice(&packet[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + NONCE_SIZE]);
            u64::from_le_bytes(bytes)
        };

        let first = PacketCipher::with_counter(3, embryo.clone(), space, counter.clone());
        let a = first.seal_frame(&pool, |out| out.push(1)).unwrap();
        drop(first);
        let second = PacketCipher::with_counter(3, embryo, space, counter);
        let b = second.seal_frame(&pool, |out| out.push(2)).unwrap();

        assert_eq!(nonce(&a), space.first_nonce());
        assert_eq!(nonce(&b), nonce(&a) + 1);
        assert_eq!(second.packet_type(), PacketType::ProtectedResponse);
    }

    #[test]
    fn truncated_packet() {
        let (_, server) = pair();
        assert!(matches!(
            server.open(&[0u8; 20]),
            Err(CryptoError::Truncated { needed: 42, got: 20 })
        ));
    }

    #[test]
    #[should_panic(expected = "exceeds the packet size")]
    fn oversized_frame_panics() {
        let pool = BufferPool::new(MAX_PACKET_SIZE, 1);
        let (client, _) = pair();
        let _ = client.seal_frame(&pool, |out| out.resize(out.len() + MAX_PACKET_SIZE, 0));
    }
}

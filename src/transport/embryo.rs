//! Connection key material produced by the handshake.

use std::fmt;

use sha2::{Digest, Sha256};

use super::aead::AEAD_KEY_LEN;
use super::agreement::Agreement;

/// Length of the embryo secret bound into every packet's associated data.
pub const EMBRYO_SECRET_LEN: usize = 16;

/// Per-connection key, salt and secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Embryo {
    key: [u8; AEAD_KEY_LEN],
    salt: u32,
    secret: [u8; EMBRYO_SECRET_LEN],
}

impl Embryo {
    /// Assemble an embryo from raw parts.
    #[must_use]
    pub const fn new(key: [u8; AEAD_KEY_LEN], salt: u32, secret: [u8; EMBRYO_SECRET_LEN]) -> Self {
        Self { key, salt, secret }
    }

    /// Derive an embryo from shared handshake material.
    #[must_use]
    pub fn derive(material: &[u8]) -> Self {
        let key = labeled_digest(b"helix embryo key", material);
        let salt_digest = labeled_digest(b"helix embryo salt", material);
        let secret_digest = labeled_digest(b"helix embryo secret", material);

        let mut secret = [0u8; EMBRYO_SECRET_LEN];
        secret.copy_from_slice(&secret_digest[..EMBRYO_SECRET_LEN]);

        Self {
            key,
            salt: u32::from_le_bytes([
                salt_digest[0],
                salt_digest[1],
                salt_digest[2],
                salt_digest[3],
            ]),
            secret,
        }
    }

    /// AEAD key.
    #[must_use]
    pub const fn key(&self) -> &[u8; AEAD_KEY_LEN] {
        &self.key
    }

    /// Salt carried in every packet header.
    #[must_use]
    pub const fn salt(&self) -> u32 {
        self.salt
    }

    /// Secret mixed into the associated data.
    #[must_use]
    pub const fn secret(&self) -> &[u8; EMBRYO_SECRET_LEN] {
        &self.secret
    }
}

impl fmt::Debug for Embryo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embryo")
            .field("salt", &format_args!("{:#010x}", self.salt))
            .finish_non_exhaustive()
    }
}

/// Derive the routing connection id from shared handshake material.
#[must_use]
pub fn derive_connection_id(material: &[u8]) -> u64 {
    let digest = labeled_digest(b"helix connection id", material);
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(id)
}

fn labeled_digest(label: &[u8], material: &[u8]) -> [u8; 32] {
    Sha256::new()
        .chain_update(label)
        .chain_update(material)
        .finalize()
        .into()
}

/// Outcome of a completed handshake, turned into a connection by the terminal.
#[derive(Debug, Clone)]
pub struct NegotiatedConnection {
    /// Routing key shared by both sides.
    pub connection_id: u64,
    /// Packet protection material.
    pub embryo: Embryo,
    /// Negotiated limits.
    pub agreement: Agreement,
}

impl NegotiatedConnection {
    /// Derive id and embryo from shared handshake material.
    #[must_use]
    pub fn from_material(material: &[u8], agreement: Agreement) -> Self {
        Self {
            connection_id: derive_connection_id(material),
            embryo: Embryo::derive(material),
            agreement,
        }
    }
}

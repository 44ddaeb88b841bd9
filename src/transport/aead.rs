//! Authenticated encryption used to protect connection packets.

use aes_gcm::aead::AeadInPlace;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{Aes256Gcm, KeyInit};

use super::error::CryptoError;
use crate::protocol::TAG_SIZE;

/// AEAD key length in bytes.
pub const AEAD_KEY_LEN: usize = 32;

/// AEAD nonce length in bytes (`Salt:u32 ‖ Nonce:u64`).
pub const AEAD_NONCE_LEN: usize = 12;

/// Seal/open primitive consumed by [`PacketCipher`](super::PacketCipher).
pub trait Aead: Send + Sync {
    /// Encrypt `in_out` in place and return the detached tag.
    fn seal_in_place(
        &self,
        nonce: &[u8; AEAD_NONCE_LEN],
        aad: &[u8],
        in_out: &mut [u8],
    ) -> Result<[u8; TAG_SIZE], CryptoError>;

    /// Verify `tag` and decrypt `in_out` in place.
    fn open_in_place(
        &self,
        nonce: &[u8; AEAD_NONCE_LEN],
        aad: &[u8],
        in_out: &mut [u8],
        tag: &[u8],
    ) -> Result<(), CryptoError>;
}

/// AES-256-GCM implementation of [`Aead`].
#[derive(Clone)]
pub struct AesGcmAead {
    cipher: Aes256Gcm,
}

impl AesGcmAead {
    /// Create a cipher from a 256-bit key.
    #[must_use]
    pub fn new(key: &[u8; AEAD_KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(GenericArray::from_slice(key)),
        }
    }
}

impl std::fmt::Debug for AesGcmAead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesGcmAead")
    }
}

impl Aead for AesGcmAead {
    fn seal_in_place(
        &self,
        nonce: &[u8; AEAD_NONCE_LEN],
        aad: &[u8],
        in_out: &mut [u8],
    ) -> Result<[u8; TAG_SIZE], CryptoError> {
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, in_out)
            .map_err(|_| CryptoError::Seal)?;
        let mut out = [0u8; TAG_SIZE];
        out.copy_from_slice(tag.as_slice());
        Ok(out)
    }

    fn open_in_place(
        &self,
        nonce: &[u8; AEAD_NONCE_LEN],
        aad: &[u8],
        in_out: &mut [u8],
        tag: &[u8],
    ) -> Result<(), CryptoError> {
        if tag.len() != TAG_SIZE {
            return Err(CryptoError::Authentication);
        }
        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                aad,
                in_out,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| CryptoError::Authentication)
    }
}

//! XChaCha20-Poly1305 record sealing
//!
//! The plaintext packet header travels as associated data, so a flipped
//! header bit fails authentication the same way a flipped payload bit does.
//! Sealing appends `ciphertext || tag` to a caller buffer so a record can be
//! built without an intermediate allocation.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    Tag, XChaCha20Poly1305, XNonce,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::{CryptoError, AEAD_NONCE_SIZE, AEAD_TAG_SIZE};

/// Size of one directional key.
pub const SESSION_KEY_SIZE: usize = 32;

/// One direction's symmetric key. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Wrap raw key material.
    pub fn from_bytes(key: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(key)
    }

    /// Raw key bytes. Only tests and key derivation should need this.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&self.0).into())
    }

    /// Encrypt `plaintext` and append `ciphertext || tag` to `out`.
    pub fn seal_into(
        &self,
        nonce: &[u8; AEAD_NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        let start = out.len();
        out.extend_from_slice(plaintext);
        let tag = self
            .cipher()
            .encrypt_in_place_detached(XNonce::from_slice(nonce), aad, &mut out[start..])
            .map_err(|_| {
                out.truncate(start);
                CryptoError::EncryptionFailed
            })?;
        out.extend_from_slice(&tag);
        Ok(())
    }

    /// Authenticate and decrypt `sealed` (`ciphertext || tag`) in place.
    ///
    /// Returns the plaintext length; the plaintext occupies the front of
    /// `sealed`. On failure the buffer contents are unspecified.
    pub fn open_in_place(
        &self,
        nonce: &[u8; AEAD_NONCE_SIZE],
        aad: &[u8],
        sealed: &mut [u8],
    ) -> Result<usize, CryptoError> {
        let Some(body_len) = sealed.len().checked_sub(AEAD_TAG_SIZE) else {
            return Err(CryptoError::DecryptionFailed);
        };
        let (body, tag) = sealed.split_at_mut(body_len);
        self.cipher()
            .decrypt_in_place_detached(XNonce::from_slice(nonce), aad, body, Tag::from_slice(tag))
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(body_len)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

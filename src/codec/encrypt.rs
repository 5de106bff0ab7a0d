use chacha20::{
    cipher::{KeyIvInit, StreamCipher, StreamCipherSeek},
    ChaCha20,
};

use super::ExtentNonce;
use crate::config::SECTOR_SIZE;

/// Filesystem-wide symmetric key.
///
/// The Debug impl never prints key material.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Encrypts (or, being a stream cipher, decrypts) `buf` in place.
///
/// Each write version owns one keystream; an extent's chunk nonce and
/// `byte_offset` position `buf` within it.  A caller holding a sub-range
/// of the stored payload therefore applies exactly the keystream bytes the
/// full payload used at that position, and splicing or narrowing an extent
/// preserves per-byte keystream identity as long as it carries the chunk
/// nonce through.  Versions are never reused, so keystream bytes are never
/// applied to two different plaintexts.
pub fn encrypt(key: &EncryptionKey, nonce: ExtentNonce, byte_offset: u64, buf: &mut [u8]) {
    let mut cipher = ChaCha20::new(key.as_bytes().into(), (&nonce.data_nonce()).into());
    cipher.seek(u64::from(nonce.chunk) * SECTOR_SIZE as u64 + byte_offset);
    cipher.apply_keystream(buf);
}

/// Derives the Poly1305 key for an extent: the first keystream block of
/// the extent's MAC nonce, which binds the tag to `(version, chunk)` while
/// staying disjoint from the data keystream.
pub(crate) fn poly_key(key: &EncryptionKey, nonce: ExtentNonce) -> [u8; 32] {
    let mut derived = [0u8; 32];
    let mut cipher = ChaCha20::new(key.as_bytes().into(), (&nonce.mac_nonce()).into());
    cipher.apply_keystream(&mut derived);
    derived
}

//! Stateless transforms over byte ranges: checksumming, compression, and
//! authenticated encryption.
//!
//! Nothing in this module owns durable state.  Every function takes the
//! payload, the extent coordinates (`version`, per-chunk nonce, byte
//! offset), and produces either transformed bytes or an explicit error the
//! pipelines turn into retry decisions.

mod checksum;
mod compress;
mod encrypt;

use snafu::Snafu;

pub use checksum::{checksum, rechecksum, verify};
pub use compress::{compress, decompress, decompress_inplace};
pub use encrypt::{encrypt, EncryptionKey};

/// Checksum algorithm stored in an extent's CRC descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CsumType {
    #[default]
    None,
    Crc32c,
    Crc64,
    /// Poly1305 over the ciphertext, keyed from the extent's ChaCha20
    /// keystream.  Only valid when encryption is enabled.
    ChachaPoly,
}

impl CsumType {
    /// Whether data carrying this checksum type is encrypted.
    pub fn is_authenticated(self) -> bool {
        matches!(self, CsumType::ChachaPoly)
    }
}

/// Compression algorithm stored in an extent's CRC descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompressionType {
    #[default]
    None,
    Lz4,
    Gzip,
    Zstd,
}

/// A checksum value.  Smaller checksum types occupy `lo` only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Csum {
    pub lo: u64,
    pub hi: u64,
}

impl Csum {
    pub(crate) fn from_u32(value: u32) -> Self {
        Csum {
            lo: u64::from(value),
            hi: 0,
        }
    }

    pub(crate) fn from_u64(value: u64) -> Self {
        Csum { lo: value, hi: 0 }
    }

    pub(crate) fn from_tag(tag: [u8; 16]) -> Self {
        Csum {
            lo: u64::from_le_bytes(tag[..8].try_into().expect("8-byte half")),
            hi: u64::from_le_bytes(tag[8..].try_into().expect("8-byte half")),
        }
    }
}

/// Coordinates that locate an extent's bytes in its write's keystream.
///
/// `version` is the filesystem-wide write version, never reused; every
/// version owns one keystream.  `chunk` is the sector offset of this
/// extent's stored payload within that keystream, advanced per encoded
/// chunk at write time, so splitting one payload into several extents
/// never reuses a keystream position.  Splicing and narrowing operations
/// must carry both through (adjusting `chunk` by exactly the sectors they
/// drop from the front).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtentNonce {
    pub version: u64,
    pub chunk: u32,
}

impl ExtentNonce {
    pub fn new(version: u64, chunk: u32) -> Self {
        Self { version, chunk }
    }

    /// 96-bit ChaCha20 nonce of the version's data keystream; `chunk`
    /// contributes a position within the stream, not a distinct nonce.
    pub(crate) fn data_nonce(self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.version.to_le_bytes());
        nonce
    }

    /// Nonce for deriving the Poly1305 key.  Binds the chunk position and
    /// tags the top byte so MAC key material never overlaps the data
    /// keystream.
    pub(crate) fn mac_nonce(self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.version.to_le_bytes());
        nonce[8..].copy_from_slice(&self.chunk.to_le_bytes());
        nonce[11] |= 0x80;
        nonce
    }
}

/// Error produced by codec operations.
#[derive(Debug, Snafu)]
pub enum CodecError {
    /// The computed checksum did not match the stored one.  The caller
    /// decides whether to retry against a different replica.
    #[snafu(display(
        "checksum mismatch: calculated {:x?}, stored {:x?}",
        calculated,
        stored
    ))]
    ChecksumMismatch { calculated: Csum, stored: Csum },

    /// The payload could not be decompressed.  Fatal for the request.
    #[snafu(display("failed to decompress {:?} payload: {}", kind, reason))]
    Decompress {
        kind: CompressionType,
        reason: String,
    },

    /// An authenticated checksum was requested without an encryption key.
    #[snafu(display("chacha-poly checksum requires an encryption key"))]
    MissingKey,
}

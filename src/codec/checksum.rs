use std::ops::Range;

use crc::{Crc, CRC_64_XZ};
use poly1305::{
    universal_hash::{KeyInit, UniversalHash},
    Poly1305,
};

use super::{encrypt, Csum, CsumType, EncryptionKey};
use crate::codec::{CodecError, ExtentNonce};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Computes the checksum of `data` under the given type.
///
/// For the authenticated type the MAC key is derived from the extent nonce,
/// binding the value to `(version, chunk)`; the plain CRC types ignore the
/// nonce and key entirely.
pub fn checksum(
    kind: CsumType,
    key: Option<&EncryptionKey>,
    nonce: ExtentNonce,
    data: &[u8],
) -> Result<Csum, CodecError> {
    match kind {
        CsumType::None => Ok(Csum::default()),
        CsumType::Crc32c => {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(data);
            Ok(Csum::from_u32(hasher.finalize()))
        }
        CsumType::Crc64 => Ok(Csum::from_u64(CRC64.checksum(data))),
        CsumType::ChachaPoly => {
            let key = key.ok_or(CodecError::MissingKey)?;
            let mac_key = encrypt::poly_key(key, nonce);
            let mac = Poly1305::new((&mac_key).into());
            let tag: [u8; 16] = mac.compute_unpadded(data).into();
            Ok(Csum::from_tag(tag))
        }
    }
}

/// Verifies `data` against a stored checksum.
pub fn verify(
    kind: CsumType,
    key: Option<&EncryptionKey>,
    nonce: ExtentNonce,
    data: &[u8],
    stored: Csum,
) -> Result<(), CodecError> {
    let calculated = checksum(kind, key, nonce, data)?;
    if calculated == stored {
        Ok(())
    } else {
        Err(CodecError::ChecksumMismatch { calculated, stored })
    }
}

/// Recomputes a checksum over a subset of an already-encoded payload
/// without touching the ciphertext.
///
/// `data` is the full stored payload covered by `old_csum`; `live` is the
/// byte range the narrowed extent will keep, and `new_nonce` its keystream
/// coordinates after narrowing.  The old checksum is reverified first:
/// `data` was just read and verified once, so a mismatch here means the
/// bytes changed underneath us in memory, which the caller must treat as
/// fatal rather than retry.
pub fn rechecksum(
    data: &[u8],
    old_kind: CsumType,
    old_csum: Csum,
    old_nonce: ExtentNonce,
    new_kind: CsumType,
    new_nonce: ExtentNonce,
    key: Option<&EncryptionKey>,
    live: Range<usize>,
) -> Result<Csum, CodecError> {
    verify(old_kind, key, old_nonce, data, old_csum)?;
    checksum(new_kind, key, new_nonce, &data[live])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_types_are_stable() {
        let nonce = ExtentNonce::new(1, 0);
        let a = checksum(CsumType::Crc32c, None, nonce, b"hello").unwrap();
        let b = checksum(CsumType::Crc32c, None, nonce, b"hello").unwrap();
        assert_eq!(a, b);
        assert_ne!(
            a,
            checksum(CsumType::Crc32c, None, nonce, b"hellp").unwrap()
        );

        let c = checksum(CsumType::Crc64, None, nonce, b"hello").unwrap();
        assert_ne!(c, Csum::default());
    }

    #[test]
    fn chacha_poly_binds_nonce() {
        let key = EncryptionKey::from_bytes([3; 32]);
        let a = checksum(
            CsumType::ChachaPoly,
            Some(&key),
            ExtentNonce::new(1, 0),
            b"payload",
        )
        .unwrap();
        let b = checksum(
            CsumType::ChachaPoly,
            Some(&key),
            ExtentNonce::new(2, 0),
            b"payload",
        )
        .unwrap();
        assert_ne!(a, b, "different versions must produce different tags");
    }

    #[test]
    fn chacha_poly_requires_key() {
        let err = checksum(CsumType::ChachaPoly, None, ExtentNonce::new(1, 0), b"x").unwrap_err();
        assert!(matches!(err, CodecError::MissingKey));
    }

    #[test]
    fn rechecksum_narrows() {
        let nonce = ExtentNonce::new(9, 4);
        let narrowed_nonce = ExtentNonce::new(9, 5);
        let data = b"0123456789abcdef";
        let old = checksum(CsumType::Crc32c, None, nonce, data).unwrap();
        let narrowed = rechecksum(
            data,
            CsumType::Crc32c,
            old,
            nonce,
            CsumType::Crc32c,
            narrowed_nonce,
            None,
            4..12,
        )
        .unwrap();
        let direct = checksum(CsumType::Crc32c, None, narrowed_nonce, &data[4..12]).unwrap();
        assert_eq!(narrowed, direct);
    }

    #[test]
    fn rechecksum_detects_corruption() {
        let nonce = ExtentNonce::new(9, 4);
        let data = b"0123456789abcdef";
        let old = checksum(CsumType::Crc32c, None, nonce, data).unwrap();
        let mut tampered = *data;
        tampered[0] ^= 0xff;
        let err = rechecksum(
            &tampered,
            CsumType::Crc32c,
            old,
            nonce,
            CsumType::Crc32c,
            nonce,
            None,
            4..12,
        )
        .unwrap_err();
        assert!(matches!(err, CodecError::ChecksumMismatch { .. }));
    }
}

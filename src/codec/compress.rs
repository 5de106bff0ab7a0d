use std::io::{Cursor, Read, Write};

use super::{CodecError, CompressionType};
use crate::config::SECTOR_SIZE;

// Encoded payloads carry their exact compressed byte length ahead of the
// stream, since on-disk sizes are rounded up to sectors.
const LEN_PREFIX: usize = 4;

/// Compresses `src` into `dst`, producing a sector-padded stored payload.
///
/// Returns the payload length on success, or `None` when the data is
/// incompressible: the output (including the length prefix and sector
/// padding) would not fit `dst` or would not be smaller than the input.
/// The caller then stores the data uncompressed.
pub fn compress(
    src: &[u8],
    dst: &mut [u8],
    kind: CompressionType,
) -> Result<Option<usize>, CodecError> {
    if kind == CompressionType::None || dst.len() <= LEN_PREFIX {
        return Ok(None);
    }

    let stream_len = match kind {
        CompressionType::None => unreachable!(),
        CompressionType::Lz4 => match lz4_flex::block::compress_into(src, &mut dst[LEN_PREFIX..]) {
            Ok(n) => n,
            Err(_) => return Ok(None),
        },
        CompressionType::Gzip => {
            let cursor = Cursor::new(&mut dst[LEN_PREFIX..]);
            let mut encoder = flate2::write::GzEncoder::new(cursor, flate2::Compression::default());
            if encoder.write_all(src).is_err() {
                return Ok(None);
            }
            match encoder.finish() {
                Ok(cursor) => cursor.position() as usize,
                Err(_) => return Ok(None),
            }
        }
        CompressionType::Zstd => {
            match zstd::bulk::compress_to_buffer(src, &mut dst[LEN_PREFIX..], 0) {
                Ok(n) => n,
                Err(_) => return Ok(None),
            }
        }
    };

    let padded = sector_round_up(LEN_PREFIX + stream_len);
    if padded >= src.len() || padded > dst.len() {
        return Ok(None);
    }

    dst[..LEN_PREFIX]
        .copy_from_slice(&u32::try_from(stream_len).expect("bounded by dst").to_le_bytes());
    dst[LEN_PREFIX + stream_len..padded].fill(0);
    Ok(Some(padded))
}

/// Decompresses a stored payload into `dst`.
///
/// `dst.len()` must equal the uncompressed size recorded in the extent's
/// CRC descriptor; anything else is a descriptor/payload mismatch and is
/// reported as a decompression failure.
pub fn decompress(dst: &mut [u8], src: &[u8], kind: CompressionType) -> Result<(), CodecError> {
    let mismatch = |reason: String| CodecError::Decompress { kind, reason };

    if src.len() < LEN_PREFIX {
        return Err(mismatch("payload shorter than length prefix".to_string()));
    }
    let len = u32::from_le_bytes(src[..LEN_PREFIX].try_into().expect("4-byte prefix")) as usize;
    let stream = src
        .get(LEN_PREFIX..LEN_PREFIX + len)
        .ok_or_else(|| mismatch(format!("length prefix {} exceeds payload", len)))?;

    match kind {
        CompressionType::None => {
            return Err(mismatch("payload is not compressed".to_string()));
        }
        CompressionType::Lz4 => {
            let n = lz4_flex::block::decompress_into(stream, dst)
                .map_err(|e| mismatch(e.to_string()))?;
            if n != dst.len() {
                return Err(mismatch(format!(
                    "expected {} uncompressed bytes, got {}",
                    dst.len(),
                    n
                )));
            }
        }
        CompressionType::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(stream);
            decoder
                .read_exact(dst)
                .map_err(|e| mismatch(e.to_string()))?;
        }
        CompressionType::Zstd => {
            let out = zstd::bulk::decompress(stream, dst.len())
                .map_err(|e| mismatch(e.to_string()))?;
            if out.len() != dst.len() {
                return Err(mismatch(format!(
                    "expected {} uncompressed bytes, got {}",
                    dst.len(),
                    out.len()
                )));
            }
            dst.copy_from_slice(&out);
        }
    }

    Ok(())
}

/// Decompresses a stored payload in place, replacing `buf`'s contents with
/// the plaintext.
pub fn decompress_inplace(
    buf: &mut Vec<u8>,
    uncompressed_len: usize,
    kind: CompressionType,
) -> Result<(), CodecError> {
    let mut dst = vec![0u8; uncompressed_len];
    decompress(&mut dst, buf, kind)?;
    *buf = dst;
    Ok(())
}

fn sector_round_up(bytes: usize) -> usize {
    bytes.div_ceil(SECTOR_SIZE) * SECTOR_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible_payload(len: usize) -> Vec<u8> {
        // Repetitive enough for every codec to win.
        (0..len).map(|i| (i / 64) as u8).collect()
    }

    #[test]
    fn round_trips_every_kind() {
        for kind in [
            CompressionType::Lz4,
            CompressionType::Gzip,
            CompressionType::Zstd,
        ] {
            let src = compressible_payload(8192);
            let mut encoded = vec![0u8; src.len()];
            let len = compress(&src, &mut encoded, kind)
                .unwrap()
                .unwrap_or_else(|| panic!("{:?} should compress repetitive data", kind));
            assert_eq!(len % SECTOR_SIZE, 0);
            assert!(len < src.len());

            let mut dst = vec![0u8; src.len()];
            decompress(&mut dst, &encoded[..len], kind).expect("decompress");
            assert_eq!(dst, src);
        }
    }

    #[test]
    fn incompressible_data_falls_back() {
        let src: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let mut dst = vec![0u8; src.len()];
        let result = compress(&src, &mut dst, CompressionType::Lz4).unwrap();
        assert!(result.is_none(), "pseudo-random bytes should not shrink");
    }

    #[test]
    fn tiny_destination_falls_back() {
        // Four bits of entropy per byte compresses, but nowhere near into
        // a single sector.
        let src: Vec<u8> = (0..8192u32)
            .map(|i| ((i.wrapping_mul(2654435761) >> 13) & 0x0f) as u8)
            .collect();
        let mut dst = vec![0u8; SECTOR_SIZE];
        let result = compress(&src, &mut dst, CompressionType::Lz4).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn zeroes_compress_to_under_two_sectors() {
        let src = vec![0u8; 8192];
        let mut dst = vec![0u8; src.len()];
        let len = compress(&src, &mut dst, CompressionType::Lz4)
            .unwrap()
            .expect("zeroes compress");
        assert!(len <= 2 * SECTOR_SIZE);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let src = compressible_payload(4096);
        let mut encoded = vec![0u8; src.len()];
        compress(&src, &mut encoded, CompressionType::Gzip)
            .unwrap()
            .expect("compresses");
        let mut dst = vec![0u8; src.len()];
        let err = decompress(&mut dst, &encoded[..LEN_PREFIX], CompressionType::Gzip).unwrap_err();
        assert!(matches!(err, CodecError::Decompress { .. }));
    }

    #[test]
    fn inplace_matches_copying() {
        let src = compressible_payload(4096);
        let mut encoded = vec![0u8; src.len()];
        let len = compress(&src, &mut encoded, CompressionType::Zstd)
            .unwrap()
            .expect("compresses");
        encoded.truncate(len);
        let mut buf = encoded;
        decompress_inplace(&mut buf, src.len(), CompressionType::Zstd).expect("inplace");
        assert_eq!(buf, src);
    }
}

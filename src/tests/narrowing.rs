use pretty_assertions::assert_eq;

use super::{compressible_payload, config_with, encrypted_config, random_payload, TestFs};
use crate::{CompressionType, CsumType, SECTOR_SIZE};

#[tokio::test]
async fn partial_overwrite_narrows_the_survivors_checksum() {
    let t = TestFs::new(1, config_with(CsumType::Crc32c, CompressionType::None));
    let old = random_payload(8192, 1);
    let new = random_payload(2048, 2);
    t.write(1, 0, old.clone()).await;
    t.write(1, 0, new.clone()).await; // overwrite [0, 4)

    let survivor = t.fs.index.snapshot(1, 4, 16).remove(0);
    let crc = survivor.crc.unwrap();
    assert!(crc.covers_more_than_live(), "trim left a wide checksum");
    assert_eq!((crc.offset, crc.live_size, crc.uncompressed_size), (4, 12, 16));

    let before = t.read(1, 4, 12).await;
    assert_eq!(&before[..], &old[4 * SECTOR_SIZE..]);

    // The read fetched and verified the whole stored payload, so it had
    // everything needed to rewrite the checksum over just the live range.
    let narrowed = t.fs.index.snapshot(1, 4, 16).remove(0);
    let crc = narrowed.crc.unwrap();
    assert!(!crc.covers_more_than_live());
    assert_eq!((crc.offset, crc.live_size, crc.uncompressed_size), (0, 12, 12));
    assert_eq!(
        narrowed.ptrs[0].offset,
        survivor.ptrs[0].offset + 4,
        "stored payload start advances past the dead sectors"
    );

    // Every subrange reads the same bytes as before the rewrite.
    let after = t.read(1, 4, 12).await;
    assert_eq!(before, after);
    let sub = t.read(1, 8, 2).await;
    assert_eq!(&sub[..], &old[8 * SECTOR_SIZE..10 * SECTOR_SIZE]);

    assert_eq!(
        t.fs.counters()
            .read_realloc_races
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );
}

#[tokio::test]
async fn narrowing_preserves_encrypted_keystream_identity() {
    let t = TestFs::new(1, encrypted_config());
    let old = random_payload(16 * 1024, 3);
    t.write(2, 0, old.clone()).await;
    t.write(2, 0, random_payload(4096, 4)).await; // overwrite [0, 8)

    // First read narrows; both it and the post-narrow reads must decrypt
    // to the original plaintext.
    let first = t.read(2, 8, 24).await;
    assert_eq!(&first[..], &old[8 * SECTOR_SIZE..]);

    let narrowed = t.fs.index.snapshot(2, 8, 32).remove(0);
    assert!(!narrowed.crc.unwrap().covers_more_than_live());

    let again = t.read(2, 10, 4).await;
    assert_eq!(&again[..], &old[10 * SECTOR_SIZE..14 * SECTOR_SIZE]);
}

#[tokio::test]
async fn compressed_extents_are_not_narrowed() {
    let t = TestFs::new(1, config_with(CsumType::Crc32c, CompressionType::Lz4));
    t.write(3, 0, compressible_payload(16 * 1024)).await;
    t.write(3, 0, random_payload(4096, 5)).await; // trim the front

    let before = t.fs.index.snapshot(3, 8, 32).remove(0);
    assert!(before.crc.unwrap().covers_more_than_live());

    t.read(3, 8, 24).await;

    let after = t.fs.index.snapshot(3, 8, 32).remove(0);
    assert_eq!(
        before.crc, after.crc,
        "compressed payloads cannot drop their dead sectors"
    );
}

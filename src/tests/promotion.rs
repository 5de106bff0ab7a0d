use std::sync::atomic::Ordering;

use pretty_assertions::assert_eq;

use super::{config, random_payload, wait_until, TestFs};
use crate::{CsumType, Pos, ReadFlags, ReadRequest, WriteOp};

fn tiered_config() -> crate::DataPathConfig {
    config()
        .csum_type(CsumType::Crc32c)
        .promote_tier(0)
        .build()
        .unwrap()
}

#[tokio::test]
async fn reads_from_slow_tiers_promote_a_cached_copy() {
    let t = TestFs::with_tiers(&[0, 1], tiered_config());
    let payload = random_payload(8192, 1);

    let mut op = WriteOp::new(Pos::new(1, 0), t.fs.cfg.io_opts());
    op.tier = Some(1);
    t.fs.write(op, payload.clone()).await.unwrap();

    // Promotes ride the bounced path: the whole stored payload is in
    // hand there, ready to be written back out.
    let mut req = ReadRequest::new(1, 0, 16);
    req.flags = ReadFlags::MAY_PROMOTE | ReadFlags::MUST_BOUNCE;
    assert_eq!(t.fs.read(req).await.unwrap(), payload);
    assert_eq!(t.fs.counters().promotes.load(Ordering::Relaxed), 1);

    // The cached pointer joins the same key at the same coordinates.
    wait_until(
        || {
            t.fs.index
                .snapshot(1, 0, 16)
                .first()
                .is_some_and(|key| key.ptrs.iter().any(|p| p.dev == 0 && p.cached))
        },
        "promoted pointer to appear",
    )
    .await;

    let key = t.fs.index.snapshot(1, 0, 16).remove(0);
    assert_eq!(key.ptrs.len(), 2);
    assert_eq!(key.dirty_ptrs(), 1, "the promoted copy is cached, not dirty");

    // Subsequent reads prefer the fast tier and still verify.
    assert_eq!(t.read(1, 0, 16).await, payload);
}

#[tokio::test]
async fn promotes_without_a_fast_replica_target_are_dropped() {
    // Tier 0 exists but is out of bucket space once a filler write lands.
    let cfg = config()
        .csum_type(CsumType::Crc32c)
        .promote_tier(0)
        .build()
        .unwrap();
    let t = TestFs::with_tiers(&[0, 1], cfg);

    // Exhaust device 0: its whole capacity is consumed by open buckets.
    let dev0_sectors = t.fs.devices()[0].capacity_sectors();
    let filler_bytes = dev0_sectors as usize * crate::SECTOR_SIZE;
    let mut op = WriteOp::new(Pos::new(9, 0), t.fs.cfg.io_opts());
    op.tier = Some(0);
    let _ = t
        .fs
        .write(op, bytes::Bytes::from(vec![1u8; filler_bytes]))
        .await;

    let mut op = WriteOp::new(Pos::new(1, 0), t.fs.cfg.io_opts());
    op.tier = Some(1);
    let payload = random_payload(8192, 2);
    t.fs.write(op, payload.clone()).await.unwrap();

    let mut req = ReadRequest::new(1, 0, 16);
    req.flags = ReadFlags::MAY_PROMOTE | ReadFlags::MUST_BOUNCE;
    assert_eq!(t.fs.read(req).await.unwrap(), payload);

    wait_until(
        || t.fs.counters().promotes_skipped.load(Ordering::Relaxed) >= 1,
        "promote to be dropped",
    )
    .await;
    let key = t.fs.index.snapshot(1, 0, 16).remove(0);
    assert_eq!(key.ptrs.len(), 1, "no cached copy appeared");
}

#[tokio::test]
async fn reads_without_the_flag_do_not_promote() {
    let t = TestFs::with_tiers(&[0, 1], tiered_config());
    let mut op = WriteOp::new(Pos::new(1, 0), t.fs.cfg.io_opts());
    op.tier = Some(1);
    t.fs.write(op, random_payload(4096, 3)).await.unwrap();

    t.read(1, 0, 8).await;
    assert_eq!(t.fs.counters().promotes.load(Ordering::Relaxed), 0);
}

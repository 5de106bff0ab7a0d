use std::sync::atomic::Ordering;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use super::{config, config_with, random_payload, TestFs};
use crate::{
    relocate::migrate_index_update,
    write::{self, WriteFlags},
    CompressionType, CsumType, DataJob, JobStats, KeyRange, MoveError, MoveOptions, Pos,
    ReadRequest, WriteOp, SECTOR_SIZE,
};

#[tokio::test]
async fn migrate_empties_the_device() {
    let cfg = config()
        .csum_type(CsumType::Crc32c)
        .replicas(2)
        .build()
        .unwrap();
    let t = TestFs::new(3, cfg);

    let mut payloads = Vec::new();
    for i in 0..4u64 {
        let payload = random_payload(8192, i as u32);
        t.write(1, i * 16, payload.clone()).await;
        payloads.push(payload);
    }
    let candidates = t
        .fs
        .index
        .snapshot(1, 0, u64::MAX)
        .iter()
        .filter(|k| k.has_device(0))
        .count() as u64;
    assert!(candidates > 0, "some extents must land on device 0");

    let stats = t
        .fs
        .data_job(
            DataJob::Migrate {
                dev: 0,
                range: KeyRange::inode(1),
            },
            MoveOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(stats.keys_moved, candidates);
    assert_eq!(stats.sectors_raced, 0);
    for key in t.fs.index.snapshot(1, 0, u64::MAX) {
        assert!(!key.has_device(0), "device 0 must be empty");
        assert_eq!(key.dirty_ptrs(), 2, "replication level preserved");
    }
    let done = t.fs.counters().extent_migrate_done.load(Ordering::Relaxed);
    let raced = t.fs.counters().extent_migrate_raced.load(Ordering::Relaxed);
    assert_eq!(done + raced, candidates);

    for (i, payload) in payloads.iter().enumerate() {
        assert_eq!(&t.read(1, i as u64 * 16, 16).await, payload);
    }
}

#[tokio::test]
async fn migrate_with_concurrent_foreground_writes_loses_nothing() {
    let cfg = config()
        .csum_type(CsumType::Crc32c)
        .replicas(2)
        .build()
        .unwrap();
    let t = TestFs::new(3, cfg);

    for i in 0..8u64 {
        t.write(1, i * 16, random_payload(8192, i as u32)).await;
    }

    // The pass also sets this, but flipping it first makes the foreground
    // writes below deterministic about avoiding device 0.
    t.fs.devices()[0].set_evacuating(true);

    let job = {
        let fs = t.fs.clone();
        tokio::spawn(async move {
            fs.data_job(
                DataJob::Migrate {
                    dev: 0,
                    range: KeyRange::inode(1),
                },
                MoveOptions::default(),
            )
            .await
        })
    };

    let mut latest = Vec::new();
    for i in 0..8u64 {
        let payload = random_payload(4096, 1000 + i as u32);
        let op = WriteOp::new(Pos::new(1, i * 16 + 4), t.fs.cfg.io_opts());
        t.fs.write(op, payload.clone()).await.unwrap();
        latest.push(payload);
    }

    job.await.unwrap().unwrap();

    for key in t.fs.index.snapshot(1, 0, u64::MAX) {
        assert!(!key.has_device(0));
    }
    // Every byte reads back as the latest write at that offset.
    for i in 0..8u64 {
        let read = t
            .fs
            .read(ReadRequest::new(1, i * 16 + 4, 8))
            .await
            .unwrap();
        assert_eq!(&read[..], &latest[i as usize][..]);
    }
}

#[tokio::test]
async fn splice_preserves_a_foreground_write_that_won() {
    let t = TestFs::new(2, config_with(CsumType::Crc32c, CompressionType::None));
    let old = random_payload(8192, 1);
    t.write(1, 0, old.clone()).await;
    let snapshot = t.fs.index.snapshot(1, 0, 16).remove(0);
    let payload = crate::read::read_stored(&t.fs, &snapshot, None).await.unwrap();

    // A foreground write overwrites the middle before our index update.
    let won = random_payload(2048, 2);
    t.write(1, 4, won.clone()).await;

    // Write the replacement replica and attempt the splice.
    let mut op = WriteOp::new(Pos::new(1, 0), t.fs.cfg.io_opts());
    op.version = snapshot.version;
    op.flags = WriteFlags::DATA_ENCODED
        | WriteFlags::PAGES_STABLE
        | WriteFlags::PAGES_OWNED
        | WriteFlags::NOMARK_REPLICAS;
    op.exclude = [snapshot.ptrs[0].dev].into_iter().collect();
    op.have = snapshot.ptrs.iter().map(|p| p.dev).collect();
    op.encoded = snapshot.crc;
    let submitted = write::encode_and_submit(&t.fs, &op, payload).await.unwrap();
    assert!(submitted.error.is_none());
    let new_key = &submitted.keys[0];

    let mut stats = JobStats::default();
    let moved = migrate_index_update(
        &t.fs,
        new_key,
        &snapshot,
        snapshot.ptrs[0].dev,
        Some(snapshot.ptrs[0].dev),
        &mut stats,
    );

    assert!(moved, "the untouched regions still splice");
    assert_eq!(stats.sectors_raced, 4, "the overwritten region raced");
    assert_eq!(stats.sectors_moved, 12);

    // The winning write is untouched and all data reads correctly.
    let read = t.read(1, 0, 16).await;
    assert_eq!(&read[..4 * SECTOR_SIZE], &old[..4 * SECTOR_SIZE]);
    assert_eq!(&read[4 * SECTOR_SIZE..8 * SECTOR_SIZE], &won[..]);
    assert_eq!(&read[8 * SECTOR_SIZE..], &old[8 * SECTOR_SIZE..]);
}

#[tokio::test]
async fn fully_raced_update_moves_nothing() {
    let t = TestFs::new(2, config_with(CsumType::Crc32c, CompressionType::None));
    t.write(1, 0, random_payload(8192, 1)).await;
    let snapshot = t.fs.index.snapshot(1, 0, 16).remove(0);
    let payload = crate::read::read_stored(&t.fs, &snapshot, None).await.unwrap();

    let won = random_payload(8192, 2);
    t.write(1, 0, won.clone()).await;

    let mut op = WriteOp::new(Pos::new(1, 0), t.fs.cfg.io_opts());
    op.version = snapshot.version;
    op.flags = WriteFlags::DATA_ENCODED
        | WriteFlags::PAGES_STABLE
        | WriteFlags::PAGES_OWNED
        | WriteFlags::NOMARK_REPLICAS;
    op.have = snapshot.ptrs.iter().map(|p| p.dev).collect();
    op.encoded = snapshot.crc;
    let submitted = write::encode_and_submit(&t.fs, &op, payload).await.unwrap();

    let mut stats = JobStats::default();
    let moved = migrate_index_update(
        &t.fs,
        &submitted.keys[0],
        &snapshot,
        snapshot.ptrs[0].dev,
        None,
        &mut stats,
    );

    assert!(!moved);
    assert_eq!(stats.sectors_moved, 0);
    assert_eq!(stats.sectors_raced, 16);
    assert_eq!(&t.read(1, 0, 16).await[..], &won[..]);
}

#[tokio::test]
async fn rereplicate_restores_the_replication_goal() {
    let cfg = config()
        .csum_type(CsumType::Crc32c)
        .replicas(2)
        .build()
        .unwrap();
    let t = TestFs::new(3, cfg);

    // Degraded writes: one replica each.
    let mut op = WriteOp::new(Pos::new(1, 0), t.fs.cfg.io_opts());
    op.opts.replicas = 1;
    let payload = random_payload(16 * 1024, 1);
    t.fs.write(op, payload.clone()).await.unwrap();

    let stats = t
        .fs
        .data_job(
            DataJob::Rereplicate {
                range: KeyRange::inode(1),
            },
            MoveOptions::default(),
        )
        .await
        .unwrap();
    assert!(stats.keys_moved > 0);

    for key in t.fs.index.snapshot(1, 0, u64::MAX) {
        assert_eq!(key.dirty_ptrs(), 2);
        let mut devs: Vec<_> = key.ptrs.iter().map(|p| p.dev).collect();
        devs.sort_unstable();
        devs.dedup();
        assert_eq!(devs.len(), key.ptrs.len());
    }
    assert_eq!(&t.read(1, 0, 32).await, &payload);
}

#[tokio::test]
async fn tier_job_adds_a_copy_on_the_target_tier() {
    let cfg = config_with(CsumType::Crc32c, CompressionType::None);
    let t = TestFs::with_tiers(&[0, 1], cfg);

    let mut op = WriteOp::new(Pos::new(1, 0), t.fs.cfg.io_opts());
    op.tier = Some(0);
    let payload = random_payload(8192, 1);
    t.fs.write(op, payload.clone()).await.unwrap();

    let stats = t
        .fs
        .data_job(
            DataJob::Tier {
                tier: 1,
                range: KeyRange::inode(1),
            },
            MoveOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(stats.keys_moved, 1);

    let key = t.fs.index.snapshot(1, 0, 16).remove(0);
    assert!(key.ptrs.iter().any(|p| p.dev == 1), "copy on tier 1");
    assert!(key.ptrs.iter().any(|p| p.dev == 0), "original retained");
    assert_eq!(&t.read(1, 0, 16).await, &payload);
}

#[tokio::test]
async fn cancelled_pass_stops_between_extents() {
    let t = TestFs::new(2, config().replicas(2).build().unwrap());
    for i in 0..4u64 {
        t.write(1, i * 16, random_payload(8192, i as u32)).await;
    }

    let token = CancellationToken::new();
    token.cancel();
    let stats = t
        .fs
        .data_job(
            DataJob::Migrate {
                dev: 0,
                range: KeyRange::inode(1),
            },
            MoveOptions {
                cancel: Some(token),
                rate_limit_bytes_per_sec: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(stats, JobStats::default(), "stopped before touching anything");
}

#[tokio::test]
async fn migrating_an_unknown_device_is_rejected() {
    let t = TestFs::new(1, config().build().unwrap());
    let err = t
        .fs
        .data_job(
            DataJob::Migrate {
                dev: 9,
                range: KeyRange::inode(1),
            },
            MoveOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MoveError::InvalidTarget { dev: 9 }));
}

#[tokio::test]
async fn rate_limited_pass_is_throttled() {
    let cfg = config()
        .csum_type(CsumType::Crc32c)
        .replicas(2)
        .build()
        .unwrap();
    let t = TestFs::new(3, cfg);
    for i in 0..4u64 {
        t.write(1, i * 16, random_payload(8192, i as u32)).await;
    }

    let started = std::time::Instant::now();
    let stats = t
        .fs
        .data_job(
            DataJob::Migrate {
                dev: 0,
                range: KeyRange::inode(1),
            },
            MoveOptions {
                cancel: None,
                // 32KiB of payload at 256KiB/s puts the pass around 125ms.
                rate_limit_bytes_per_sec: Some(256 * 1024),
            },
        )
        .await
        .unwrap();
    assert_eq!(stats.keys_moved, 4);
    assert!(
        started.elapsed() >= std::time::Duration::from_millis(50),
        "the limiter must slow the pass down"
    );
}

use std::{sync::Arc, time::Duration};

use bytes::Bytes;

use crate::{
    CompressionType, CsumType, DataPathConfig, DataPathConfigBuilder, Device, EncryptionKey,
    Filesystem, MemoryBackend, Pos, ReadRequest, WriteOp,
};

mod narrowing;
mod promotion;
mod relocation;

const TEST_DEVICE_CAPACITY: u64 = 32 << 20;

/// A mounted filesystem plus handles to its backends for fault injection.
pub(crate) struct TestFs {
    pub fs: Arc<Filesystem>,
    pub backends: Vec<Arc<MemoryBackend>>,
}

impl TestFs {
    /// `n` identical tier-0 devices.
    pub fn new(n: u8, cfg: DataPathConfig) -> Self {
        Self::with_tiers(&vec![0; n as usize], cfg)
    }

    /// One device per entry, with the given tier.
    pub fn with_tiers(tiers: &[u8], cfg: DataPathConfig) -> Self {
        let backends: Vec<_> = tiers
            .iter()
            .map(|_| MemoryBackend::new(TEST_DEVICE_CAPACITY))
            .collect();
        let devices = backends
            .iter()
            .zip(tiers)
            .enumerate()
            .map(|(id, (backend, &tier))| {
                Device::new(
                    id as u8,
                    tier,
                    backend.clone(),
                    Duration::from_millis(100),
                )
            })
            .collect();
        let fs = Filesystem::mount(cfg, devices).expect("valid test configuration");
        Self { fs, backends }
    }

    pub async fn write(&self, inode: u64, offset: u64, payload: Bytes) -> crate::WriteOutcome {
        let op = WriteOp::new(Pos::new(inode, offset), self.fs.cfg.io_opts());
        self.fs.write(op, payload).await.expect("test write")
    }

    pub async fn read(&self, inode: u64, offset: u64, sectors: u32) -> Bytes {
        self.fs
            .read(ReadRequest::new(inode, offset, sectors))
            .await
            .expect("test read")
    }
}

pub(crate) fn config() -> DataPathConfigBuilder {
    DataPathConfig::builder()
}

pub(crate) fn config_with(csum: CsumType, compression: CompressionType) -> DataPathConfig {
    config()
        .csum_type(csum)
        .compression(compression)
        .build()
        .expect("valid test configuration")
}

pub(crate) fn encrypted_config() -> DataPathConfig {
    config()
        .csum_type(CsumType::ChachaPoly)
        .encryption_key(EncryptionKey::from_bytes([0x5a; 32]))
        .build()
        .expect("valid test configuration")
}

/// Payload every codec shrinks: long runs with a slow drift.
pub(crate) fn compressible_payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i / 128) as u8).collect::<Vec<u8>>())
}

/// Deterministic payload no codec shrinks.
pub(crate) fn random_payload(len: usize, seed: u32) -> Bytes {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
    Bytes::from(
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect::<Vec<u8>>(),
    )
}

/// Spins until `predicate` holds, for observing background tasks.
pub(crate) async fn wait_until<F: Fn() -> bool>(predicate: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

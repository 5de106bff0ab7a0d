//! The foreground data path of the tidefs copy-on-write, multi-device
//! filesystem: reads, writes, and background data movement between the
//! page-cache layer above and the extent index below.
//!
//! # Shape
//!
//! The engine is five cooperating pieces, leaves first:
//!
//! - the bounce pool: page-granular scratch memory with a reserved
//!   fallback so reads and writes can always make progress;
//! - the codec: stateless checksum/compression/encryption transforms with
//!   keystream coordinates derived from `(version, chunk)`;
//! - the write pipeline: reservation, chunked encode, parallel replica
//!   fan-out, copy-on-write index insert;
//! - the read pipeline: extent resolution, replica pick, verify/decode in
//!   a cost-chosen completion context, retry across replicas, promotion,
//!   opportunistic checksum narrowing;
//! - the move engine: background passes (rereplicate, migrate, tiering)
//!   that rewrite extents and splice new pointers in without ever losing
//!   a concurrent foreground write.
//!
//! The extent index, allocator, and journal are collaborators behind
//! narrow seams ([`ExtentIndex`], [`Allocator`], [`Journal`]); reference
//! implementations live in-crate so the engine is self-contained, but no
//! durable state is owned here.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tidefs_datapath::{
//!     DataPathConfig, Device, Filesystem, MemoryBackend, Pos, ReadRequest, WriteOp,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cfg = DataPathConfig::builder().build().unwrap();
//! let devices = (0..2)
//!     .map(|id| Device::new(id, 0, MemoryBackend::new(16 << 20), Duration::from_millis(100)))
//!     .collect();
//! let fs = Filesystem::mount(cfg, devices).unwrap();
//!
//! let payload = bytes::Bytes::from(vec![7u8; 4096]);
//! let op = WriteOp::new(Pos::new(1, 0), fs.config().io_opts());
//! fs.write(op, payload.clone()).await.unwrap();
//!
//! let read = fs.read(ReadRequest::new(1, 0, 8)).await.unwrap();
//! assert_eq!(read, payload);
//! # }
//! ```

mod alloc;
mod bounce;
mod codec;
mod config;
mod counters;
mod device;
mod ewma;
mod extent;
mod index;
mod journal;
mod read;
mod relocate;
mod write;

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    collections::BTreeSet,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::info;

pub use crate::{
    alloc::{AllocError, Allocator, Reservation, WritePoint},
    bounce::{BounceBuf, BouncePool},
    codec::{
        checksum, compress, decompress, decompress_inplace, encrypt, rechecksum, verify,
        CodecError, CompressionType, Csum, CsumType, EncryptionKey, ExtentNonce,
    },
    config::{
        BuildError, DataPathConfig, DataPathConfigBuilder, IoOpts, PAGE_SIZE, SECTOR_SIZE,
    },
    counters::{Counters, DataType},
    device::{BlockBackend, Device, DeviceError, FileBackend, MemoryBackend},
    extent::{
        CrcDescriptor, DeviceId, DeviceSet, ExtentKey, Pointer, Pos, StoredRange, MAX_REPLICAS,
    },
    index::{ExtentIndex, IndexError, InsertFlags, MemoryIndex},
    journal::{Journal, JournalRes},
    read::{ReadError, ReadFlags, ReadRequest},
    relocate::{DataJob, JobStats, KeyRange, MoveError, MoveOptions},
    write::{WriteError, WriteFlags, WriteOp, WriteOutcome},
};

/// A mounted data path: devices, collaborator seams, pools, and counters.
///
/// Counters and pools live for the mount and are torn down with it; all
/// durable state belongs to the index, journal, and replicas table.
#[derive(Debug)]
pub struct Filesystem {
    pub(crate) cfg: DataPathConfig,
    pub(crate) devices: Vec<Arc<Device>>,
    pub(crate) index: Arc<dyn ExtentIndex>,
    pub(crate) alloc: Allocator,
    pub(crate) journal: Journal,
    pub(crate) bounce: BouncePool,
    pub(crate) counters: Counters,
    version: AtomicU64,
    read_only: AtomicBool,
    /// Which replica sets exist on which devices, as the superblock
    /// records it.
    replicas_table: Mutex<BTreeSet<Vec<DeviceId>>>,
    #[cfg(test)]
    race_fault: AtomicBool,
}

impl Filesystem {
    /// Mounts the data path over the given devices with the reference
    /// index.
    pub fn mount(
        cfg: DataPathConfig,
        devices: Vec<Arc<Device>>,
    ) -> Result<Arc<Self>, BuildError> {
        Self::mount_with_index(cfg, devices, Arc::new(MemoryIndex::new()))
    }

    /// Mounts the data path with a caller-provided extent index engine.
    pub fn mount_with_index(
        cfg: DataPathConfig,
        devices: Vec<Arc<Device>>,
        index: Arc<dyn ExtentIndex>,
    ) -> Result<Arc<Self>, BuildError> {
        if devices.is_empty() {
            return Err(BuildError::InvalidParameter {
                param_name: "devices",
                reason: "at least one device is required".to_string(),
            });
        }
        let mut seen = DeviceSet::default();
        for dev in &devices {
            if dev.id() >= 64 {
                return Err(BuildError::InvalidParameter {
                    param_name: "devices",
                    reason: "device ids must be below 64".to_string(),
                });
            }
            if seen.contains(dev.id()) {
                return Err(BuildError::InvalidParameter {
                    param_name: "devices",
                    reason: format!("duplicate device id {}", dev.id()),
                });
            }
            seen.insert(dev.id());
        }

        let alloc = Allocator::new(devices.clone(), cfg.bucket_size);
        let bounce = BouncePool::new(cfg.encoded_extent_max, cfg.bounce_reserve_slabs);
        info!(
            devices = devices.len(),
            replicas = cfg.replicas,
            "mounting data path"
        );
        Ok(Arc::new(Self {
            cfg,
            devices,
            index,
            alloc,
            journal: Journal::new(),
            bounce,
            counters: Counters::new(),
            version: AtomicU64::new(1),
            read_only: AtomicBool::new(false),
            replicas_table: Mutex::new(BTreeSet::new()),
            #[cfg(test)]
            race_fault: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &DataPathConfig {
        &self.cfg
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn index(&self) -> &Arc<dyn ExtentIndex> {
        &self.index
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Writes `payload` at the op's position, returning once the extent
    /// index covers the range with durable replicas.
    pub async fn write(
        self: &Arc<Self>,
        op: WriteOp,
        payload: Bytes,
    ) -> Result<WriteOutcome, WriteError> {
        write::execute(self, op, payload).await
    }

    /// Reads plaintext for the requested range; absent regions are
    /// zero-filled.
    pub async fn read(self: &Arc<Self>, req: ReadRequest) -> Result<Bytes, ReadError> {
        read::execute(self, req).await
    }

    /// Runs one background data job to completion and returns its stats.
    pub async fn data_job(
        self: &Arc<Self>,
        job: DataJob,
        opts: MoveOptions,
    ) -> Result<JobStats, MoveError> {
        relocate::run(self, job, opts).await
    }

    /// Whether the data path accepts writes.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    /// Stops accepting writes and waits for in-flight device I/O.
    pub async fn unmount(&self) {
        self.set_read_only(true);
        for dev in &self.devices {
            dev.drain().await;
        }
        info!("data path unmounted");
    }

    /// Per-tier extent usage, derived from the index.
    pub fn usage(&self) -> BTreeMap<u8, TierUsage> {
        let mut usage: BTreeMap<u8, TierUsage> = BTreeMap::new();
        self.index.for_each(&mut |key| {
            for ptr in &key.ptrs {
                let tier = self.device(ptr.dev).tier();
                let entry = usage.entry(tier).or_default();
                if key.is_compressed() {
                    entry.compressed_extents += 1;
                    entry.compressed_sectors += u64::from(key.stored_sectors());
                } else {
                    entry.uncompressed_extents += 1;
                    entry.uncompressed_sectors += u64::from(key.stored_sectors());
                }
            }
        });
        usage
    }

    /// Whether the superblock replicas table records an entry covering
    /// exactly these devices.
    pub fn replicas_marked(&self, devs: &[DeviceId]) -> bool {
        let mut devs = devs.to_vec();
        devs.sort_unstable();
        devs.dedup();
        self.replicas_table.lock().contains(&devs)
    }

    pub(crate) fn device(&self, id: DeviceId) -> Arc<Device> {
        self.devices
            .iter()
            .find(|d| d.id() == id)
            .cloned()
            .expect("extent pointer references an unknown device")
    }

    pub(crate) fn has_device(&self, id: DeviceId) -> bool {
        self.devices.iter().any(|d| d.id() == id)
    }

    /// Allocates a fresh write version.  Monotonic, never reused.
    pub(crate) fn fresh_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel)
    }

    /// Records which devices hold a copy of this key's dirty data.
    pub(crate) fn mark_replicas(&self, key: &ExtentKey) {
        let mut devs: Vec<DeviceId> = key
            .ptrs
            .iter()
            .filter(|p| p.is_dirty())
            .map(|p| p.dev)
            .collect();
        if devs.is_empty() {
            return;
        }
        devs.sort_unstable();
        devs.dedup();
        self.replicas_table.lock().insert(devs);
    }

    /// Test hook: pretend the next cached-pointer check hit the stale
    /// race.  Distinct from real device-generation mismatch.
    #[cfg(test)]
    pub(crate) fn arm_race_fault(&self) {
        self.race_fault.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn race_fault_fired(&self) -> bool {
        self.race_fault.swap(false, Ordering::AcqRel)
    }

    #[cfg(not(test))]
    pub(crate) fn race_fault_fired(&self) -> bool {
        false
    }
}

/// Usage of one storage tier, as exposed to observability tooling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TierUsage {
    pub compressed_extents: u64,
    pub uncompressed_extents: u64,
    pub compressed_sectors: u64,
    pub uncompressed_sectors: u64,
}

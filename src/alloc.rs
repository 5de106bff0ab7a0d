//! The allocator seam: reservations, open buckets, and write points.
//!
//! The data path consumes allocation as `reserve -> write point ->
//! append/done`; bucket selection policy lives behind this interface.  The
//! implementation here is a bump allocator over the member devices, enough
//! to exercise the pipelines and their accounting.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};

use snafu::Snafu;
use tracing::trace;

use crate::{
    config::SECTOR_SIZE,
    device::Device,
    extent::{DeviceId, DeviceSet, Pointer},
};

/// Error produced by reservation and allocation.
#[derive(Debug, Snafu)]
pub enum AllocError {
    /// Not enough unreserved space for the requested replicas.
    #[snafu(display(
        "out of space: {} sectors x {} replicas requested",
        sectors,
        replicas
    ))]
    NoSpace { sectors: u64, replicas: u32 },

    /// No eligible device could provide an open bucket without waiting,
    /// and the caller forbade waiting.
    #[snafu(display("allocation would block"))]
    WouldBlock,

    /// No device satisfies the placement constraints at all.
    #[snafu(display("no eligible devices for allocation"))]
    NoDevices,
}

struct AllocatorInner {
    devices: Vec<Arc<Device>>,
    /// Next unallocated sector per device.
    cursors: Vec<AtomicU64>,
    /// Sectors handed out to reservations and not yet released.
    reserved: AtomicU64,
    /// Sectors attached to extent pointers.
    committed: AtomicU64,
    capacity: u64,
    bucket_sectors: u64,
}

/// Allocates device space for the write pipeline.
pub struct Allocator {
    inner: Arc<AllocatorInner>,
}

impl Allocator {
    pub fn new(devices: Vec<Arc<Device>>, bucket_size: usize) -> Self {
        let capacity = devices.iter().map(|d| d.capacity_sectors()).sum();
        let cursors = devices.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            inner: Arc::new(AllocatorInner {
                devices,
                cursors,
                reserved: AtomicU64::new(0),
                committed: AtomicU64::new(0),
                capacity,
                bucket_sectors: (bucket_size / SECTOR_SIZE) as u64,
            }),
        }
    }

    /// Sectors not yet spoken for by a reservation or a pointer.
    pub fn sectors_available(&self) -> u64 {
        let inner = &self.inner;
        inner
            .capacity
            .saturating_sub(inner.reserved.load(Ordering::Acquire))
            .saturating_sub(inner.committed.load(Ordering::Acquire))
    }

    /// Reserves space for `sectors` of payload written `replicas` times.
    ///
    /// The reservation is released on drop; the write pipeline consumes it
    /// as pointers are attached.
    pub fn reserve(&self, sectors: u64, replicas: u32) -> Result<Reservation, AllocError> {
        let total = sectors * u64::from(replicas);
        let inner = &self.inner;
        let mut reserved = inner.reserved.load(Ordering::Acquire);
        loop {
            let in_use = reserved + inner.committed.load(Ordering::Acquire);
            if in_use + total > inner.capacity {
                return Err(AllocError::NoSpace { sectors, replicas });
            }
            match inner.reserved.compare_exchange_weak(
                reserved,
                reserved + total,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(Reservation {
                        remaining: total,
                        inner: Arc::clone(inner),
                    })
                }
                Err(actual) => reserved = actual,
            }
        }
    }

    /// Opens a write point: one open bucket on each of up to `nr_replicas`
    /// eligible devices.
    ///
    /// Placement honors `only` (restrict to these devices, when non-empty),
    /// `exclude`, `have` (devices already holding a copy), and `tier`.
    /// Returns fewer buckets than asked when the cluster cannot do better;
    /// the caller decides whether a degraded write is acceptable.
    pub fn alloc_sectors_start(
        &self,
        nr_replicas: u32,
        only: &[DeviceId],
        exclude: DeviceSet,
        have: DeviceSet,
        tier: Option<u8>,
        nowait: bool,
    ) -> Result<WritePoint, AllocError> {
        let inner = &self.inner;
        let mut candidates: Vec<usize> = (0..inner.devices.len())
            .filter(|&i| {
                let dev = &inner.devices[i];
                !dev.is_dying()
                    && !dev.is_evacuating()
                    && !exclude.contains(dev.id())
                    && !have.contains(dev.id())
                    && (only.is_empty() || only.contains(&dev.id()))
                    && tier.is_none_or(|t| dev.tier() == t)
            })
            .collect();

        // Fill the emptiest devices first; break ties by id so placement
        // is deterministic.
        candidates.sort_by_key(|&i| {
            (
                inner.cursors[i].load(Ordering::Acquire),
                inner.devices[i].id(),
            )
        });

        let mut buckets = Vec::new();
        for i in candidates {
            if buckets.len() as u32 == nr_replicas {
                break;
            }
            let dev = &inner.devices[i];
            let capacity = dev.capacity_sectors();
            let start = inner.cursors[i].fetch_add(inner.bucket_sectors, Ordering::AcqRel);
            if start >= capacity {
                // Device is full; the cursor stays past the end.
                continue;
            }
            let len = inner.bucket_sectors.min(capacity - start);
            buckets.push(OpenBucket {
                dev: dev.id(),
                gen: dev.generation(),
                start,
                used: 0,
                capacity: len,
            });
        }

        if buckets.is_empty() {
            return Err(if nowait {
                AllocError::WouldBlock
            } else {
                AllocError::NoDevices
            });
        }

        trace!(
            buckets = buckets.len(),
            requested = nr_replicas,
            "opened write point"
        );
        Ok(WritePoint { buckets })
    }

    /// Attaches one pointer per open bucket for a chunk of `sectors`
    /// stored sectors, advancing each bucket.
    pub fn alloc_sectors_append_ptrs(
        &self,
        write_point: &mut WritePoint,
        sectors: u32,
        cached: bool,
    ) -> Vec<Pointer> {
        let mut ptrs = Vec::with_capacity(write_point.buckets.len());
        for bucket in &mut write_point.buckets {
            debug_assert!(bucket.used + u64::from(sectors) <= bucket.capacity);
            ptrs.push(Pointer {
                dev: bucket.dev,
                offset: bucket.start + bucket.used,
                cached,
                gen: bucket.gen,
            });
            bucket.used += u64::from(sectors);
        }
        self.inner
            .committed
            .fetch_add(u64::from(sectors) * ptrs.len() as u64, Ordering::AcqRel);
        ptrs
    }

    /// Closes a write point.  Unused bucket tails are discarded.
    pub fn alloc_sectors_done(&self, write_point: WritePoint) {
        drop(write_point);
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("capacity", &self.inner.capacity)
            .field("reserved", &self.inner.reserved.load(Ordering::Relaxed))
            .field("committed", &self.inner.committed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Space set aside for a write.  Consumed as pointers are attached;
/// whatever remains is released on drop.
pub struct Reservation {
    remaining: u64,
    inner: Arc<AllocatorInner>,
}

impl Reservation {
    /// Marks `sectors` of the reservation as turned into real pointers.
    pub fn consume(&mut self, sectors: u64) {
        let taken = sectors.min(self.remaining);
        self.remaining -= taken;
        self.inner.reserved.fetch_sub(taken, Ordering::AcqRel);
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.remaining > 0 {
            self.inner.reserved.fetch_sub(self.remaining, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("remaining", &self.remaining)
            .finish()
    }
}

/// An open bucket: a contiguous run of free sectors on one device.
#[derive(Clone, Debug)]
pub struct OpenBucket {
    pub dev: DeviceId,
    gen: u64,
    start: u64,
    used: u64,
    capacity: u64,
}

/// A set of open buckets a write streams into, one per replica.
#[derive(Clone, Debug)]
pub struct WritePoint {
    buckets: Vec<OpenBucket>,
}

impl WritePoint {
    /// Sectors every bucket can still take.
    pub fn free_sectors(&self) -> u64 {
        self.buckets
            .iter()
            .map(|b| b.capacity - b.used)
            .min()
            .unwrap_or(0)
    }

    pub fn nr_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.buckets.iter().map(|b| b.dev)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::device::MemoryBackend;

    fn devices(n: u8, capacity: u64) -> Vec<Arc<Device>> {
        (0..n)
            .map(|id| Device::new(id, 0, MemoryBackend::new(capacity), Duration::from_millis(100)))
            .collect()
    }

    #[test]
    fn reserve_accounts_replicas() {
        let alloc = Allocator::new(devices(2, 1 << 20), 128 * 1024);
        let available = alloc.sectors_available();
        let res = alloc.reserve(100, 2).unwrap();
        assert_eq!(alloc.sectors_available(), available - 200);
        drop(res);
        assert_eq!(alloc.sectors_available(), available);
    }

    #[test]
    fn reserve_fails_past_capacity() {
        let alloc = Allocator::new(devices(1, 1 << 16), 4096);
        let err = alloc.reserve(1 << 20, 1).unwrap_err();
        assert!(matches!(err, AllocError::NoSpace { .. }));
    }

    #[test]
    fn write_point_spans_distinct_devices() {
        let alloc = Allocator::new(devices(3, 1 << 20), 128 * 1024);
        let mut wp = alloc
            .alloc_sectors_start(2, &[], DeviceSet::default(), DeviceSet::default(), None, false)
            .unwrap();
        assert_eq!(wp.nr_buckets(), 2);

        let ptrs = alloc.alloc_sectors_append_ptrs(&mut wp, 8, false);
        assert_eq!(ptrs.len(), 2);
        assert_ne!(ptrs[0].dev, ptrs[1].dev);

        let more = alloc.alloc_sectors_append_ptrs(&mut wp, 8, false);
        assert_eq!(more[0].offset, ptrs[0].offset + 8);
    }

    #[test]
    fn placement_honors_exclusions() {
        let alloc = Allocator::new(devices(3, 1 << 20), 128 * 1024);
        let mut exclude = DeviceSet::default();
        exclude.insert(0);
        exclude.insert(1);
        let wp = alloc
            .alloc_sectors_start(3, &[], exclude, DeviceSet::default(), None, false)
            .unwrap();
        let devs: Vec<_> = wp.devices().collect();
        assert_eq!(devs, vec![2]);
    }

    #[test]
    fn nowait_reports_would_block() {
        let alloc = Allocator::new(devices(1, 1 << 20), 128 * 1024);
        let mut exclude = DeviceSet::default();
        exclude.insert(0);
        let err = alloc
            .alloc_sectors_start(1, &[], exclude, DeviceSet::default(), None, true)
            .unwrap_err();
        assert!(matches!(err, AllocError::WouldBlock));
    }
}

use std::{
    fmt, io,
    path::Path,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_utils::CachePadded;
use snafu::{ResultExt, Snafu};
use tokio::sync::Notify;
use tracing::trace;

use crate::{
    config::SECTOR_SIZE,
    ewma::LatencyEwma,
    extent::DeviceId,
};

/// Error produced by device submissions.
#[derive(Debug, Snafu)]
pub enum DeviceError {
    /// The device is being torn down; the I/O completed with a synthetic
    /// removed status without touching the backend.
    #[snafu(display("device {} is being removed", dev))]
    Removed { dev: DeviceId },

    /// The backend failed the I/O.
    #[snafu(display("device {} I/O error: {}", dev, source))]
    Io { dev: DeviceId, source: io::Error },
}

/// Generalized interface to a backing store.
///
/// The device layer above handles accounting, failure status, and latency;
/// backends only move bytes.  Parameterizing the backend is also how tests
/// inject corruption and failures.
#[async_trait]
pub trait BlockBackend: Send + Sync + fmt::Debug {
    /// Fills `buf` from `offset`.  The destination is caller-provided so
    /// reads land directly in the caller's buffer or bounce pages.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes `data` at `offset`.  `fua` requests that the write reach
    /// stable media before completion, for devices without a journal-flush
    /// arrangement.
    async fn write_at(&self, offset: u64, data: Bytes, fua: bool) -> io::Result<()>;

    async fn flush(&self) -> io::Result<()>;

    /// Usable capacity in bytes.
    fn capacity(&self) -> u64;
}

/// A member device of the filesystem.
pub struct Device {
    id: DeviceId,
    tier: u8,
    backend: Arc<dyn BlockBackend>,
    /// Bumped whenever cached contents on this device become suspect;
    /// cached pointers stamped with an older generation are stale.
    generation: AtomicU64,
    dying: AtomicBool,
    /// Set while a migrate pass evacuates this device; the allocator
    /// stops placing new data on it so the pass can converge.
    evacuating: AtomicBool,
    in_flight: CachePadded<AtomicU64>,
    io_errors: AtomicU64,
    latency: LatencyEwma,
    drained: Notify,
}

impl Device {
    pub fn new(
        id: DeviceId,
        tier: u8,
        backend: Arc<dyn BlockBackend>,
        latency_window: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            tier,
            backend,
            generation: AtomicU64::new(1),
            dying: AtomicBool::new(false),
            evacuating: AtomicBool::new(false),
            in_flight: CachePadded::new(AtomicU64::new(0)),
            io_errors: AtomicU64::new(0),
            latency: LatencyEwma::new(latency_window),
            drained: Notify::new(),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn tier(&self) -> u8 {
        self.tier
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.backend.capacity() / SECTOR_SIZE as u64
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidates every cached pointer stamped with the current
    /// generation.
    pub fn advance_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    /// Marks the device as being torn down.  In-flight I/O completes;
    /// new submissions complete with a synthetic removed status.
    pub fn set_dying(&self) {
        self.dying.store(true, Ordering::Release);
    }

    pub fn is_evacuating(&self) -> bool {
        self.evacuating.load(Ordering::Acquire)
    }

    pub fn set_evacuating(&self, evacuating: bool) {
        self.evacuating.store(evacuating, Ordering::Release);
    }

    pub fn io_errors(&self) -> u64 {
        self.io_errors.load(Ordering::Relaxed)
    }

    /// Charges an I/O error discovered above the transport, such as a
    /// checksum mismatch on data this device returned successfully.
    pub(crate) fn note_io_error(&self) {
        self.io_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn latency_micros(&self) -> u64 {
        self.latency.current_micros()
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Waits until no I/O is in flight against this device.
    pub async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Reads whole sectors into `buf`, which must be sector-sized.
    pub async fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        debug_assert!(buf.len() % SECTOR_SIZE == 0);
        let _guard = self.begin_io()?;
        let started = Instant::now();
        let result = self.backend.read_at(sector * SECTOR_SIZE as u64, buf).await;
        self.complete_io(started, result.is_err());
        result.context(IoSnafu { dev: self.id })
    }

    pub async fn write_sectors(
        &self,
        sector: u64,
        data: Bytes,
        fua: bool,
    ) -> Result<(), DeviceError> {
        debug_assert!(data.len() % SECTOR_SIZE == 0);
        let _guard = self.begin_io()?;
        let started = Instant::now();
        let result = self
            .backend
            .write_at(sector * SECTOR_SIZE as u64, data, fua)
            .await;
        self.complete_io(started, result.is_err());
        result.context(IoSnafu { dev: self.id })
    }

    pub async fn flush(&self) -> Result<(), DeviceError> {
        let _guard = self.begin_io()?;
        let result = self.backend.flush().await;
        self.complete_io(Instant::now(), result.is_err());
        result.context(IoSnafu { dev: self.id })
    }

    fn begin_io(&self) -> Result<InFlightGuard<'_>, DeviceError> {
        if self.is_dying() {
            trace!(dev = self.id, "completing I/O with synthetic removed status");
            return Err(DeviceError::Removed { dev: self.id });
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(InFlightGuard { device: self })
    }

    fn complete_io(&self, started: Instant, failed: bool) {
        if failed {
            self.io_errors.fetch_add(1, Ordering::Relaxed);
        } else {
            let sample = started.elapsed().as_micros() as u64;
            self.latency.sample(sample, now_micros());
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .field("dying", &self.is_dying())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

struct InFlightGuard<'a> {
    device: &'a Device,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.device.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.device.drained.notify_waiters();
        }
    }
}

fn now_micros() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Backend over a regular file, using positioned I/O off the async
/// runtime's blocking pool.
pub struct FileBackend {
    file: Arc<std::fs::File>,
    capacity: u64,
}

impl FileBackend {
    pub async fn open<P: AsRef<Path>>(path: P, capacity: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?;
            file.set_len(capacity)?;
            Ok::<_, io::Error>(file)
        })
        .await
        .expect("blocking open task panicked")?;

        Ok(Self {
            file: Arc::new(file),
            capacity,
        })
    }
}

impl fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBackend")
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[async_trait]
impl BlockBackend for FileBackend {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        let len = buf.len();
        let read = tokio::task::spawn_blocking(move || {
            use std::os::unix::fs::FileExt;
            let mut scratch = vec![0u8; len];
            file.read_exact_at(&mut scratch, offset)?;
            Ok::<_, io::Error>(scratch)
        })
        .await
        .expect("blocking read task panicked")?;
        buf.copy_from_slice(&read);
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: Bytes, fua: bool) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            use std::os::unix::fs::FileExt;
            file.write_all_at(&data, offset)?;
            if fua {
                file.sync_data()?;
            }
            Ok(())
        })
        .await
        .expect("blocking write task panicked")
    }

    async fn flush(&self) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.sync_data())
            .await
            .expect("blocking flush task panicked")
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// In-memory backend used by tests and examples.
///
/// Exposes knobs for corrupting stored bytes and failing I/O so the
/// pipelines' retry and error paths can be exercised deterministically.
pub struct MemoryBackend {
    data: parking_lot::Mutex<Vec<u8>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            data: parking_lot::Mutex::new(vec![0u8; capacity as usize]),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Flips every bit in `[offset, offset + len)`.
    pub fn corrupt(&self, offset: u64, len: usize) {
        let mut data = self.data.lock();
        for byte in &mut data[offset as usize..offset as usize + len] {
            *byte ^= 0xff;
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("capacity", &self.data.lock().len())
            .finish()
    }
}

#[async_trait]
impl BlockBackend for MemoryBackend {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read failure"));
        }
        let data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past device capacity",
            ));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: Bytes, _fua: bool) -> io::Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        let mut stored = self.data.lock();
        let start = offset as usize;
        let end = start + data.len();
        if end > stored.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "write past device capacity",
            ));
        }
        stored[start..end].copy_from_slice(&data);
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(backend: Arc<dyn BlockBackend>) -> Arc<Device> {
        Device::new(0, 0, backend, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn round_trips_sectors() {
        let dev = device(MemoryBackend::new(1 << 20));
        let payload = Bytes::from(vec![0xabu8; SECTOR_SIZE * 2]);
        dev.write_sectors(4, payload.clone(), false).await.unwrap();
        let mut read = vec![0u8; SECTOR_SIZE * 2];
        dev.read_sectors(4, &mut read).await.unwrap();
        assert_eq!(read, payload);
        assert_eq!(dev.in_flight(), 0);
    }

    #[tokio::test]
    async fn dying_device_completes_with_removed_status() {
        let dev = device(MemoryBackend::new(1 << 20));
        dev.set_dying();
        let mut buf = vec![0u8; SECTOR_SIZE];
        let err = dev.read_sectors(0, &mut buf).await.unwrap_err();
        assert!(matches!(err, DeviceError::Removed { dev: 0 }));
        assert_eq!(dev.io_errors(), 0, "synthetic status is not an I/O error");
    }

    #[tokio::test]
    async fn io_errors_are_counted() {
        let backend = MemoryBackend::new(1 << 20);
        let dev = device(backend.clone());
        backend.fail_reads(true);
        let mut buf = vec![0u8; SECTOR_SIZE];
        assert!(dev.read_sectors(0, &mut buf).await.is_err());
        assert_eq!(dev.io_errors(), 1);
    }

    #[tokio::test]
    async fn generation_advance_marks_stale() {
        let dev = device(MemoryBackend::new(1 << 20));
        let stamped = dev.generation();
        dev.advance_generation();
        assert!(dev.generation() > stamped);
    }
}

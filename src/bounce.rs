use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::config::PAGE_SIZE;

/// Where the backing memory of a [`BounceBuf`] came from.
///
/// Release must route pool-backed memory to the pool free list and let
/// directly-allocated memory drop, so provenance travels with the buffer.
enum Backing {
    Direct(BytesMut),
    Pooled { slab: Option<Box<[u8]>>, pool: Arc<PoolInner> },
}

/// Scratch memory for one bounced I/O.
///
/// Holds whole pages; `len` is the portion the caller asked for.  Dropping
/// the buffer releases the memory back to wherever it came from.
pub struct BounceBuf {
    backing: Backing,
    len: usize,
}

impl BounceBuf {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of whole pages this buffer pins.
    pub fn pages(&self) -> usize {
        let backing_len = match &self.backing {
            Backing::Direct(buf) => buf.len(),
            Backing::Pooled { slab, .. } => slab.as_ref().map_or(0, |s| s.len()),
        };
        backing_len / PAGE_SIZE
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Direct(buf) => &buf[..self.len],
            Backing::Pooled { slab, .. } => {
                &slab.as_ref().expect("slab present until drop")[..self.len]
            }
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        match &mut self.backing {
            Backing::Direct(buf) => &mut buf[..len],
            Backing::Pooled { slab, .. } => {
                &mut slab.as_mut().expect("slab present until drop")[..len]
            }
        }
    }

    /// Shrinks the visible length.  The pages stay pinned until drop.
    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.len);
        self.len = len;
    }

    /// Turns the buffer into an immutable, reference-counted payload for
    /// submission, so replica writes can share it without copying.
    ///
    /// Directly-allocated memory is handed over as-is; a reserved slab is
    /// copied out and returned to the pool, since the emergency path must
    /// never leak pool pages into long-lived payloads.
    pub fn freeze(mut self) -> Bytes {
        let len = self.len;
        match &mut self.backing {
            Backing::Direct(buf) => {
                let mut buf = std::mem::take(buf);
                buf.truncate(len);
                buf.freeze()
            }
            Backing::Pooled { slab, .. } => {
                let slab = slab.as_ref().expect("slab present until drop");
                Bytes::copy_from_slice(&slab[..len])
            }
        }
    }
}

impl Drop for BounceBuf {
    fn drop(&mut self) {
        if let Backing::Pooled { slab, pool } = &mut self.backing {
            let slab = slab.take().expect("slab released twice");
            pool.release(slab);
        }
    }
}

impl std::fmt::Debug for BounceBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pooled = matches!(self.backing, Backing::Pooled { .. });
        f.debug_struct("BounceBuf")
            .field("len", &self.len)
            .field("pooled", &pooled)
            .finish()
    }
}

struct PoolInner {
    free: Mutex<Vec<Box<[u8]>>>,
    available: Notify,
}

impl PoolInner {
    fn release(&self, slab: Box<[u8]>) {
        self.free.lock().push(slab);
        self.available.notify_one();
    }
}

/// Page-granular scratch pool with a reserved fallback.
///
/// Acquisition first tries a direct allocation.  When that fails (or is
/// forced to fail under test), it falls back to a fixed set of reserved
/// slabs, each `slab_size` bytes, waiting for one to be released if all
/// are in use.  Requests at or below `slab_size` therefore always succeed
/// eventually; larger requests can only be satisfied directly and report
/// out-of-memory on failure.
pub struct BouncePool {
    inner: Arc<PoolInner>,
    slab_size: usize,
    #[cfg(test)]
    fail_direct: std::sync::atomic::AtomicBool,
}

impl BouncePool {
    /// Creates a pool of `reserve_slabs` slabs of `slab_size` bytes each.
    ///
    /// `slab_size` is the `encoded_extent_max` of the filesystem: the
    /// largest request the pool guarantees.
    pub fn new(slab_size: usize, reserve_slabs: usize) -> Self {
        assert!(slab_size % PAGE_SIZE == 0, "slab size must be page-aligned");
        let free = (0..reserve_slabs)
            .map(|_| vec![0u8; slab_size].into_boxed_slice())
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                available: Notify::new(),
            }),
            slab_size,
            #[cfg(test)]
            fail_direct: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Acquires a zero-filled buffer of at least `bytes` bytes, rounded up
    /// to whole pages.
    ///
    /// Never fails for requests up to the slab size; above that, returns
    /// `None` if direct allocation is unavailable and the caller must
    /// retry with a smaller request.
    pub async fn acquire(&self, bytes: usize) -> Option<BounceBuf> {
        let pages = bytes.div_ceil(PAGE_SIZE);

        if let Some(buf) = self.try_direct(pages * PAGE_SIZE) {
            return Some(BounceBuf {
                backing: Backing::Direct(buf),
                len: bytes,
            });
        }

        if bytes > self.slab_size {
            return None;
        }

        trace!(bytes, "direct allocation failed, falling back to reserved pool");
        loop {
            if let Some(mut slab) = self.inner.free.lock().pop() {
                slab.fill(0);
                return Some(BounceBuf {
                    backing: Backing::Pooled {
                        slab: Some(slab),
                        pool: Arc::clone(&self.inner),
                    },
                    len: bytes,
                });
            }
            self.inner.available.notified().await;
        }
    }

    fn try_direct(&self, bytes: usize) -> Option<BytesMut> {
        #[cfg(test)]
        if self.fail_direct.load(std::sync::atomic::Ordering::Relaxed) {
            return None;
        }
        let mut buf = BytesMut::with_capacity(bytes);
        buf.resize(bytes, 0);
        Some(buf)
    }

    /// Forces every direct allocation to fail, exercising the reserved
    /// pool.
    #[cfg(test)]
    pub fn fail_direct_allocations(&self, fail: bool) {
        self.fail_direct
            .store(fail, std::sync::atomic::Ordering::Relaxed);
    }
}

impl std::fmt::Debug for BouncePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BouncePool")
            .field("slab_size", &self.slab_size)
            .field("free_slabs", &self.inner.free.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn direct_acquisition() {
        let pool = BouncePool::new(4 * PAGE_SIZE, 1);
        let mut buf = pool.acquire(100).await.expect("direct grab");
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.pages(), 1);
        buf.as_mut_slice()[99] = 7;
        assert_eq!(buf.as_slice()[99], 7);
    }

    #[tokio::test]
    async fn freeze_is_cheap_for_direct_buffers() {
        let pool = BouncePool::new(PAGE_SIZE, 1);
        let mut buf = pool.acquire(64).await.expect("direct grab");
        buf.as_mut_slice().fill(0xaa);
        let frozen = buf.freeze();
        assert_eq!(frozen.len(), 64);
        assert!(frozen.iter().all(|&b| b == 0xaa));
    }

    #[tokio::test]
    async fn fallback_is_identity_tracked() {
        let pool = BouncePool::new(2 * PAGE_SIZE, 1);
        pool.fail_direct_allocations(true);

        let buf = pool.acquire(PAGE_SIZE).await.expect("pool slab");
        assert_eq!(buf.pages(), 2);
        assert!(pool.inner.free.lock().is_empty());

        drop(buf);
        assert_eq!(pool.inner.free.lock().len(), 1);
    }

    #[tokio::test]
    async fn freezing_a_slab_returns_it_to_the_pool() {
        let pool = BouncePool::new(PAGE_SIZE, 1);
        pool.fail_direct_allocations(true);
        let mut buf = pool.acquire(32).await.expect("pool slab");
        buf.as_mut_slice().fill(3);
        let frozen = buf.freeze();
        assert_eq!(frozen.as_ref(), &[3u8; 32]);
        assert_eq!(pool.inner.free.lock().len(), 1);
    }

    #[tokio::test]
    async fn oversize_requests_fail_without_direct_memory() {
        let pool = BouncePool::new(2 * PAGE_SIZE, 1);
        pool.fail_direct_allocations(true);
        assert!(pool.acquire(3 * PAGE_SIZE).await.is_none());
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let pool = Arc::new(BouncePool::new(PAGE_SIZE, 1));
        pool.fail_direct_allocations(true);

        let held = pool.acquire(PAGE_SIZE).await.expect("first slab");
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(PAGE_SIZE).await.is_some() })
        };

        tokio::task::yield_now().await;
        drop(held);
        assert!(waiter.await.expect("waiter completes"));
    }
}

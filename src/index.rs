//! The extent index seam.
//!
//! The data path consumes the index as an abstract ordered map of extent
//! keys with transactional insert and compare-and-swap replace; the node
//! storage engine behind it is not this crate's concern.  [`MemoryIndex`]
//! is the reference implementation: a sharded in-memory tree with the same
//! contract, used by the tests and by embedders without their own engine.

use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;
use parking_lot::RwLock;
use snafu::Snafu;
use tracing::error;

use crate::extent::ExtentKey;

bitflags! {
    /// Behavior flags for index updates.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InsertFlags: u32 {
        /// Fail with [`IndexError::Raced`] instead of retrying internally
        /// if the update observed a stale snapshot.
        const ATOMIC = 1 << 0;
        /// Never surface out-of-space from the commit itself.
        const NOFAIL = 1 << 1;
        /// Do not block waiting for index resources.
        const NOWAIT = 1 << 2;
        /// Draw commit space from the caller's reservation.
        const USE_RESERVE = 1 << 3;
    }
}

/// Error produced by index operations.
#[derive(Debug, Snafu)]
pub enum IndexError {
    /// The stored key changed between snapshot and commit.  The caller
    /// retries the affected region with a fresh snapshot.
    #[snafu(display("index update raced with a concurrent writer"))]
    Raced,

    /// The index could not hold the new key.
    #[snafu(display("index out of space"))]
    NoSpace,

    /// A key failed validation.  This indicates corruption or a bug and is
    /// fatal for the request.
    #[snafu(display("malformed extent key: {}", reason))]
    Unpack { reason: String },
}

/// Ordered index of extents, keyed `(inode, start_offset)`.
///
/// Implementations must keep stored extents non-overlapping: `insert`
/// performs the copy-on-write trim of everything the new keys cover.
/// Reads take snapshots; nothing handed out borrows index memory.
pub trait ExtentIndex: Send + Sync + fmt::Debug {
    /// Returns the first extent overlapping `[from, to)`, whole.  The
    /// caller cuts it to the range it cares about.
    fn peek_next(&self, inode: u64, from: u64, to: u64) -> Option<ExtentKey>;

    /// Snapshot of every extent overlapping `[from, to)`, in offset order.
    fn snapshot(&self, inode: u64, from: u64, to: u64) -> Vec<ExtentKey>;

    /// Copy-on-write insert: for each key, trims away every overlapping
    /// stored extent, then stores the key.
    fn insert(&self, keys: &[ExtentKey], flags: InsertFlags) -> Result<(), IndexError>;

    /// Atomically replaces `expected` with `replacement` (or deletes it
    /// when `replacement` is `None`) if the stored extent is still exactly
    /// `expected`.
    fn try_replace(
        &self,
        expected: &ExtentKey,
        replacement: Option<ExtentKey>,
    ) -> Result<(), IndexError>;

    /// Removes every whole extent fully contained in `[from, to)` and
    /// trims partial overlaps.
    fn delete_range(&self, inode: u64, from: u64, to: u64);

    /// Visits every stored extent.  Used for usage accounting.
    fn for_each(&self, f: &mut dyn FnMut(&ExtentKey));
}

const SHARDS: usize = 16;

type Shard = RwLock<BTreeMap<(u64, u64), ExtentKey>>;

/// Reference index: per-inode-sharded `BTreeMap`s behind reader-writer
/// locks.  Every mutation takes one shard's write lock, which makes each
/// call atomic with respect to the keys of that inode.
pub struct MemoryIndex {
    shards: Vec<Shard>,
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(BTreeMap::new())).collect(),
        }
    }

    fn shard(&self, inode: u64) -> &Shard {
        &self.shards[(inode as usize) % SHARDS]
    }

    /// Keys overlapping `[from, to)` for `inode`, starting the scan at the
    /// last key at or before `from` since at most one stored extent can
    /// straddle it.
    fn overlapping(
        map: &BTreeMap<(u64, u64), ExtentKey>,
        inode: u64,
        from: u64,
        to: u64,
    ) -> Vec<(u64, u64)> {
        let scan_from = map
            .range(..=(inode, from))
            .next_back()
            .map(|(&(i, s), _)| if i == inode { (i, s) } else { (inode, from) })
            .unwrap_or((inode, from));

        map.range(scan_from..(inode, to))
            .filter(|(&(i, _), key)| i == inode && key.overlaps(from, to))
            .map(|(&k, _)| k)
            .collect()
    }

    fn validate(key: &ExtentKey) -> Result<(), IndexError> {
        let mut fail = |reason: &str| {
            error!(inode = key.inode, offset = key.offset, reason, "refusing malformed extent key");
            Err(IndexError::Unpack {
                reason: reason.to_string(),
            })
        };

        if key.size == 0 {
            return fail("zero-size extent");
        }
        if key.ptrs.len() > crate::extent::MAX_REPLICAS as usize {
            return fail("too many pointers");
        }
        if let Some(crc) = &key.crc {
            if crc.live_size != key.size {
                return fail("crc live size does not match key size");
            }
            if crc.live_size > crc.uncompressed_size
                || crc.offset + crc.live_size > crc.uncompressed_size
            {
                return fail("crc live window exceeds uncompressed size");
            }
        }
        Ok(())
    }

    fn trim_covered(map: &mut BTreeMap<(u64, u64), ExtentKey>, inode: u64, from: u64, to: u64) {
        for at in Self::overlapping(map, inode, from, to) {
            let stored = map.remove(&at).expect("key just listed");
            if stored.start() < from {
                let mut front = stored.clone();
                front.cut_back(from);
                map.insert((inode, front.start()), front);
            }
            if stored.end() > to {
                let mut back = stored;
                back.cut_front(to);
                map.insert((inode, back.start()), back);
            }
        }
    }
}

impl ExtentIndex for MemoryIndex {
    fn peek_next(&self, inode: u64, from: u64, to: u64) -> Option<ExtentKey> {
        let map = self.shard(inode).read();
        Self::overlapping(&map, inode, from, to)
            .first()
            .map(|at| map[at].clone())
    }

    fn snapshot(&self, inode: u64, from: u64, to: u64) -> Vec<ExtentKey> {
        let map = self.shard(inode).read();
        Self::overlapping(&map, inode, from, to)
            .iter()
            .map(|at| map[at].clone())
            .collect()
    }

    fn insert(&self, keys: &[ExtentKey], _flags: InsertFlags) -> Result<(), IndexError> {
        for key in keys {
            Self::validate(key)?;
        }
        for key in keys {
            let mut map = self.shard(key.inode).write();
            Self::trim_covered(&mut map, key.inode, key.start(), key.end());
            map.insert((key.inode, key.start()), key.clone());
        }
        Ok(())
    }

    fn try_replace(
        &self,
        expected: &ExtentKey,
        replacement: Option<ExtentKey>,
    ) -> Result<(), IndexError> {
        if let Some(replacement) = &replacement {
            Self::validate(replacement)?;
        }

        let mut map = self.shard(expected.inode).write();
        match map.get(&(expected.inode, expected.start())) {
            Some(stored) if stored == expected => {}
            _ => return Err(IndexError::Raced),
        }
        map.remove(&(expected.inode, expected.start()));
        if let Some(replacement) = replacement {
            // The replacement may cover a narrower range than what it
            // replaces; it must never widen past it.
            debug_assert!(replacement.start() >= expected.start());
            debug_assert!(replacement.end() <= expected.end());
            map.insert((replacement.inode, replacement.start()), replacement);
        }
        Ok(())
    }

    fn delete_range(&self, inode: u64, from: u64, to: u64) {
        let mut map = self.shard(inode).write();
        Self::trim_covered(&mut map, inode, from, to);
    }

    fn for_each(&self, f: &mut dyn FnMut(&ExtentKey)) {
        for shard in &self.shards {
            let map = shard.read();
            for key in map.values() {
                f(key);
            }
        }
    }
}

impl fmt::Debug for MemoryIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: usize = self.shards.iter().map(|s| s.read().len()).sum();
        f.debug_struct("MemoryIndex").field("keys", &keys).finish()
    }
}

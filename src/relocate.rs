//! The move engine: rewriting live extents without losing concurrent
//! foreground updates.
//!
//! A pass iterates a key range, decides per extent whether it should move
//! (rereplicate, evacuate a device, tiering), reads the stored payload
//! verified-but-encoded, rewrites it through the write pipeline, and then
//! splices the new pointers into whatever the index holds now.  A
//! foreground write that got there first simply makes the region count as
//! raced; nothing a foreground writer did is ever overwritten.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use snafu::Snafu;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::{
    config::SECTOR_SIZE,
    counters::DataType,
    extent::{DeviceId, DeviceSet, ExtentKey, Pointer, Pos},
    read::{self, ReadError},
    write::{self, WriteFlags, WriteOp},
    Filesystem, IoOpts,
};

/// A key range over one inode's extents.
#[derive(Clone, Copy, Debug)]
pub struct KeyRange {
    pub inode: u64,
    pub start: u64,
    pub end: u64,
}

impl KeyRange {
    pub fn new(inode: u64, start: u64, end: u64) -> Self {
        Self { inode, start, end }
    }

    /// The whole of one inode's extents.
    pub fn inode(inode: u64) -> Self {
        Self::new(inode, 0, u64::MAX)
    }
}

/// A background data job, driven by [`Filesystem::data_job`].
#[derive(Clone, Copy, Debug)]
pub enum DataJob {
    /// Write missing replicas for extents below the replication goal.
    Rereplicate { range: KeyRange },
    /// Evacuate every extent pointing at a device so it can be removed.
    Migrate { dev: DeviceId, range: KeyRange },
    /// Ensure extents have a copy on the given tier.
    Tier { tier: u8, range: KeyRange },
}

impl DataJob {
    fn range(&self) -> KeyRange {
        match self {
            DataJob::Rereplicate { range }
            | DataJob::Migrate { range, .. }
            | DataJob::Tier { range, .. } => *range,
        }
    }
}

/// Knobs for one move pass.
#[derive(Clone, Debug, Default)]
pub struct MoveOptions {
    /// Observed between extents; in-flight work is drained, not aborted.
    pub cancel: Option<CancellationToken>,
    /// Throughput ceiling for payload bytes entering the pass.
    pub rate_limit_bytes_per_sec: Option<u64>,
}

/// Statistics for one completed pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobStats {
    /// Extents whose rewrite committed (at least one spliced region).
    pub keys_moved: u64,
    /// Live sectors whose pointers were updated.
    pub sectors_moved: u64,
    /// Live sectors of every candidate extent the pass observed.
    pub sectors_seen: u64,
    /// Live sectors discarded because the index changed underneath us.
    pub sectors_raced: u64,
}

/// Error produced by a move pass.
#[derive(Debug, Snafu)]
pub enum MoveError {
    #[snafu(display("invalid migrate target: no device {}", dev))]
    InvalidTarget { dev: DeviceId },

    #[snafu(display("filesystem is read-only"))]
    ReadOnly,
}

/// What a candidate extent needs done, decided at snapshot time.
struct MovePlan {
    nr_replicas: u32,
    have: DeviceSet,
    exclude: DeviceSet,
    tier: Option<u8>,
    /// Device whose pointer the splice drops.
    drop_dev: Option<DeviceId>,
    /// The pointer this move is based on; the splice requires it to still
    /// be present at its expected offset.
    expect_ptr: Pointer,
    /// A cached pointer on the way out needs no rewrite, just a drop.
    drop_in_place: bool,
}

fn plan_for(fs: &Filesystem, job: &DataJob, key: &ExtentKey) -> Option<MovePlan> {
    let devs: DeviceSet = key.ptrs.iter().map(|p| p.dev).collect();
    match job {
        DataJob::Rereplicate { .. } => {
            let goal = fs.cfg.io_opts().replicas;
            let dirty = key.dirty_ptrs();
            if dirty == 0 || dirty >= goal {
                return None;
            }
            let expect_ptr = *key.ptrs.iter().find(|p| p.is_dirty())?;
            Some(MovePlan {
                nr_replicas: goal - dirty,
                have: devs,
                exclude: DeviceSet::default(),
                tier: None,
                drop_dev: None,
                expect_ptr,
                drop_in_place: false,
            })
        }
        DataJob::Migrate { dev, .. } => {
            let ptr = *key.ptr_for_device(*dev)?;
            let mut exclude = DeviceSet::default();
            exclude.insert(*dev);
            // A cached copy on the outgoing device has nothing to
            // preserve; dirty data gets a replacement replica first.
            let drop_in_place = ptr.cached && key.ptrs.len() > 1;
            Some(MovePlan {
                nr_replicas: 1,
                have: devs,
                exclude,
                tier: None,
                drop_dev: Some(*dev),
                expect_ptr: ptr,
                drop_in_place,
            })
        }
        DataJob::Tier { tier, .. } => {
            if key
                .ptrs
                .iter()
                .any(|p| fs.device(p.dev).tier() == *tier)
            {
                return None;
            }
            let expect_ptr = *key.ptrs.first()?;
            Some(MovePlan {
                nr_replicas: 1,
                have: devs,
                exclude: DeviceSet::default(),
                tier: Some(*tier),
                drop_dev: None,
                expect_ptr,
                drop_in_place: false,
            })
        }
    }
}

struct MovingIo {
    key: ExtentKey,
    plan: MovePlan,
    payload: Result<bytes::Bytes, ReadError>,
}

/// Runs one pass over the job's range.
#[instrument(skip_all, fields(job = ?job), level = "debug")]
pub(crate) async fn run(
    fs: &Arc<Filesystem>,
    job: DataJob,
    opts: MoveOptions,
) -> Result<JobStats, MoveError> {
    if fs.is_read_only() {
        return ReadOnlySnafu.fail();
    }
    if let DataJob::Migrate { dev, .. } = &job {
        if !fs.has_device(*dev) {
            return InvalidTargetSnafu { dev: *dev }.fail();
        }
        // New foreground writes must not land on the device while we
        // empty it, or the pass can never converge.
        fs.device(*dev).set_evacuating(true);
    }

    let range = job.range();
    let budget = fs.cfg.move_bytes_in_flight as u64;
    let limiter = opts.rate_limit_bytes_per_sec.map(RateLimiter::new);
    let in_flight = Arc::new(AtomicU64::new(0));
    // Reads ahead of their writes, in read-start order.  Writes are
    // drained from the front so index updates happen in ascending key
    // order.
    let mut pending: VecDeque<(u64, JoinHandle<MovingIo>)> = VecDeque::new();
    let mut stats = JobStats::default();

    let mut pos = range.start;
    while pos < range.end {
        if opts.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            debug!("move pass observed stop request; draining in-flight work");
            break;
        }

        let Some(key) = fs.index.peek_next(range.inode, pos, range.end) else {
            break;
        };
        pos = key.end();

        let Some(plan) = plan_for(fs, &job, &key) else {
            continue;
        };
        stats.sectors_seen += u64::from(key.size);

        if plan.drop_in_place {
            drop_cached_pointer(fs, &key, &plan, &mut stats);
            continue;
        }

        let bytes = u64::from(key.stored_sectors()) * SECTOR_SIZE as u64;
        while in_flight.load(Ordering::Acquire) + bytes > budget && !pending.is_empty() {
            drain_one(fs, &mut pending, &in_flight, &mut stats).await;
        }
        if let Some(limiter) = &limiter {
            limiter.increment(bytes);
            let delay = limiter.delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        in_flight.fetch_add(bytes, Ordering::AcqRel);
        let read_fs = Arc::clone(fs);
        let prefer = Some(plan.expect_ptr.dev);
        let read_key = key.clone();
        let handle = tokio::spawn(async move {
            let payload = read::read_stored(&read_fs, &read_key, prefer).await;
            MovingIo {
                key: read_key,
                plan,
                payload,
            }
        });
        pending.push_back((bytes, handle));
    }

    while !pending.is_empty() {
        drain_one(fs, &mut pending, &in_flight, &mut stats).await;
    }

    Ok(stats)
}

/// Completes the oldest outstanding read and runs its write.
async fn drain_one(
    fs: &Arc<Filesystem>,
    pending: &mut VecDeque<(u64, JoinHandle<MovingIo>)>,
    in_flight: &Arc<AtomicU64>,
    stats: &mut JobStats,
) {
    let (bytes, handle) = pending.pop_front().expect("caller checked non-empty");
    let io = handle.await.expect("move read task panicked");
    match io.payload {
        Ok(payload) => {
            move_one(fs, &io.key, &io.plan, payload, stats).await;
        }
        Err(e) => {
            debug!(inode = io.key.inode, offset = io.key.offset, error = %e, "move read failed; skipping extent");
        }
    }
    in_flight.fetch_sub(bytes, Ordering::AcqRel);
}

/// Writes the replacement replicas for one extent and splices them in.
async fn move_one(
    fs: &Arc<Filesystem>,
    key: &ExtentKey,
    plan: &MovePlan,
    payload: bytes::Bytes,
    stats: &mut JobStats,
) {
    let mut op = WriteOp::new(
        Pos::new(key.inode, key.start()),
        IoOpts {
            csum: key.csum_type(),
            compression: key
                .crc
                .map_or(crate::codec::CompressionType::None, |crc| crc.compression),
            replicas: plan.nr_replicas,
        },
    );
    op.version = key.version;
    op.flags = WriteFlags::DATA_ENCODED
        | WriteFlags::PAGES_STABLE
        | WriteFlags::PAGES_OWNED
        | WriteFlags::NOMARK_REPLICAS;
    op.exclude = plan.exclude;
    op.have = plan.have;
    op.tier = plan.tier;
    op.encoded = key.crc;
    op.data_type = DataType::Relocated;

    let submitted = match write::encode_and_submit(fs, &op, payload).await {
        Ok(submitted) => submitted,
        Err(e) => {
            debug!(error = %e, "move write failed; skipping extent");
            return;
        }
    };
    if let Some(e) = submitted.error {
        debug!(error = %e, "move write degraded; skipping extent");
        return;
    }
    let Some(new_key) = submitted.keys.into_iter().next() else {
        return;
    };

    let moved = migrate_index_update(
        fs,
        &new_key,
        key,
        plan.expect_ptr.dev,
        plan.drop_dev,
        stats,
    );
    if moved {
        stats.keys_moved += 1;
        fs.counters.extent_migrate_done();
    } else {
        fs.counters.extent_migrate_raced();
    }
}

/// Drops a cached pointer from an extent without rewriting data.
fn drop_cached_pointer(fs: &Filesystem, key: &ExtentKey, plan: &MovePlan, stats: &mut JobStats) {
    let Some(drop_dev) = plan.drop_dev else { return };
    let mut updated = key.clone();
    updated.ptrs.retain(|p| p.dev != drop_dev);
    match fs.index.try_replace(key, Some(updated)) {
        Ok(()) => {
            stats.keys_moved += 1;
            stats.sectors_moved += u64::from(key.size);
            fs.counters.extent_migrate_done();
        }
        Err(_) => {
            stats.sectors_raced += u64::from(key.size);
            fs.counters.extent_migrate_raced();
        }
    }
}

/// Splices freshly-written pointers into the index without losing
/// concurrent foreground writes.
///
/// For each stored extent overlapping the new key: a changed version, a
/// non-data region, or a missing source pointer means a foreground write
/// got there first, and that region is accounted raced rather than
/// failed.  Otherwise both keys are cut to the overlap, the outgoing
/// pointer is dropped, and every new pointer whose device the stored
/// extent lacks is appended.  The commit is a compare-and-swap; a stale
/// snapshot retries the splice on that region only.
pub(crate) fn migrate_index_update(
    fs: &Filesystem,
    new_key: &ExtentKey,
    expect: &ExtentKey,
    expect_dev: DeviceId,
    drop_dev: Option<DeviceId>,
    stats: &mut JobStats,
) -> bool {
    let mut cur = new_key.start();
    let end = new_key.end();
    let mut any_moved = false;

    while cur < end {
        let Some(stored) = fs.index.peek_next(new_key.inode, cur, end) else {
            stats.sectors_raced += end - cur;
            break;
        };
        if stored.start() > cur {
            // The region in between was deleted out from under us.
            stats.sectors_raced += stored.start() - cur;
        }
        let overlap_start = cur.max(stored.start());
        let overlap_end = end.min(stored.end());
        let overlap = overlap_end - overlap_start;

        let expect_cut = expect.cut_to(overlap_start, overlap_end);
        let expected_ptr = expect_cut.ptr_for_device(expect_dev);
        let still_ours = stored.version == expect.version
            && expected_ptr.is_some_and(|exp| {
                stored
                    .ptr_for_device(exp.dev)
                    .is_some_and(|p| p.offset == exp.offset)
            });
        if !still_ours {
            trace!(
                offset = overlap_start,
                sectors = overlap,
                "migrate raced with foreground write"
            );
            stats.sectors_raced += overlap;
            cur = overlap_end;
            continue;
        }

        let new_piece = new_key.cut_to(overlap_start, overlap_end);
        let mut updated = stored.clone();
        if let Some(drop_dev) = drop_dev {
            updated.ptrs.retain(|p| p.dev != drop_dev);
        }
        let mut added = false;
        for ptr in &new_piece.ptrs {
            if !updated.has_device(ptr.dev) {
                updated.ptrs.push(*ptr);
                added = true;
            }
        }
        if !added {
            // A concurrent writer (or another pass) already produced our
            // replica.
            stats.sectors_raced += overlap;
            cur = overlap_end;
            continue;
        }

        fs.mark_replicas(&updated);
        let res = fs.journal.res_get();
        fs.journal.add_keys(&res, std::slice::from_ref(&updated));
        let committed = fs.index.try_replace(&stored, Some(updated));
        fs.journal.res_put(res);

        match committed {
            Ok(()) => {
                stats.sectors_moved += overlap;
                any_moved = true;
                cur = overlap_end;
            }
            Err(_) => {
                // Stale snapshot; retry the splice on this region.
                trace!(offset = overlap_start, "migrate commit raced, retrying region");
            }
        }
    }

    any_moved
}

/// Token-bucket throughput limiter for move passes.
struct RateLimiter {
    bytes_per_sec: u64,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    /// Bytes owed beyond the budget.
    debt: f64,
    last: Instant,
}

impl RateLimiter {
    fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec.max(1),
            state: Mutex::new(LimiterState {
                debt: 0.0,
                last: Instant::now(),
            }),
        }
    }

    fn increment(&self, bytes: u64) {
        self.state.lock().debt += bytes as f64;
    }

    /// How long to wait before the budget covers the debt.
    fn delay(&self) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();
        let earned = now.duration_since(state.last).as_secs_f64() * self.bytes_per_sec as f64;
        state.debt = (state.debt - earned).max(0.0);
        state.last = now;
        Duration::from_secs_f64(state.debt / self.bytes_per_sec as f64)
    }
}

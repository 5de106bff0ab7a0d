//! The read pipeline.
//!
//! A read walks the extent index across the requested range, and per
//! extent: picks a replica, decides whether the I/O can land in the
//! caller's buffer or must bounce, verifies and decodes in a completion
//! context chosen by cost, and drives a small retry state machine when a
//! replica lets it down.  Absent regions read as zeroes.

use std::sync::Arc;

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use snafu::Snafu;
use tracing::{debug, instrument, trace};

use crate::{
    codec::{self, CodecError, Csum, CsumType, EncryptionKey, ExtentNonce},
    config::SECTOR_SIZE,
    counters::DataType,
    extent::{DeviceId, DeviceSet, ExtentKey, Pointer, Pos},
    write::{WriteFlags, WriteOp},
    Filesystem,
};

bitflags! {
    /// Behavior flags carried by a [`ReadRequest`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ReadFlags: u32 {
        /// Allow promoting what was read to a faster tier.
        const MAY_PROMOTE = 1 << 0;
        /// The destination may be modified concurrently by its owner;
        /// verification results over it cannot be trusted on mismatch.
        const USER_MAPPED = 1 << 1;
        /// Always read through a bounce buffer.
        const MUST_BOUNCE = 1 << 2;
        /// Verify the checksum but deliver the stored payload without
        /// decrypting or decompressing (move-engine reads).
        const NODECODE = 1 << 3;
        /// Retry when a cached pointer turns out stale instead of
        /// treating the region as absent.
        const RETRY_IF_STALE = 1 << 4;
        /// This request is itself a retry; loop in place rather than
        /// re-enqueueing.
        const IN_RETRY = 1 << 5;
    }
}

/// A read request over one inode's logical range.
#[derive(Clone, Debug)]
pub struct ReadRequest {
    pub inode: u64,
    /// First sector to read.
    pub offset: u64,
    pub sectors: u32,
    pub flags: ReadFlags,
    /// Devices to steer around, merged with those the retry machine
    /// learns about.
    pub avoid: DeviceSet,
}

impl ReadRequest {
    pub fn new(inode: u64, offset: u64, sectors: u32) -> Self {
        Self {
            inode,
            offset,
            sectors,
            flags: ReadFlags::default(),
            avoid: DeviceSet::default(),
        }
    }
}

/// Error produced by the read pipeline.
#[derive(Debug, Snafu)]
pub enum ReadError {
    /// Every replica was dying, stale, or avoided.
    #[snafu(display("no usable replica for inode {} sector {}", inode, offset))]
    NoReplica { inode: u64, offset: u64 },

    /// Every replica failed verification or I/O.
    #[snafu(display("read failed on every replica; devices tried: {:?}", failed))]
    Io { failed: DeviceSet },

    /// The payload would not decompress.  Fatal: retrying another replica
    /// of byte-identical ciphertext cannot help.
    #[snafu(display("decompression failed: {}", source))]
    Decompress { source: CodecError },

    /// A cached pointer stayed stale across retries.
    #[snafu(display("cached pointer stale for inode {} sector {}", inode, offset))]
    Stale { inode: u64, offset: u64 },

    /// Bounce memory above the pool-backed maximum was unavailable.
    #[snafu(display("bounce memory exhausted"))]
    BounceExhausted,
}

/// Retry disposition after a failed attempt at one extent.
enum Retry {
    /// Re-pick against a fresh snapshot (stale cached pointer).
    Again,
    /// Avoid this device and re-pick.
    Avoid(DeviceId),
    /// Re-read the same replica through a bounce buffer (user-mapped
    /// destination failed verification in place).
    Bounce,
    /// Give up on the request.
    Fatal(ReadError),
}

/// Completion context for post-I/O work, ordered by cost.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompletionContext {
    /// Nothing to undo; run on the submitting task.
    Inline,
    /// Checksummed but plain; cheap enough to stay latency-sensitive.
    HighPriority,
    /// Compressed or encrypted payloads go to the unbound pool.
    Unbound,
}

fn completion_context(key: &ExtentKey, encrypted: bool) -> CompletionContext {
    if key.is_compressed() || encrypted {
        CompletionContext::Unbound
    } else if key.csum_type() != CsumType::None {
        CompletionContext::HighPriority
    } else {
        CompletionContext::Inline
    }
}

/// Reads `req.sectors` sectors of plaintext, assembling fragments in
/// logical-offset order regardless of per-extent completion order.
#[instrument(skip_all, fields(inode = req.inode, offset = req.offset, sectors = req.sectors), level = "debug")]
pub(crate) async fn execute(fs: &Arc<Filesystem>, req: ReadRequest) -> Result<Bytes, ReadError> {
    let end = req.offset + u64::from(req.sectors);
    let mut out = BytesMut::zeroed(req.sectors as usize * SECTOR_SIZE);
    let mut pos = req.offset;

    while pos < end {
        // Snapshot one extent at a time; the index is unlocked while the
        // device read is in flight.
        let Some(key) = fs.index.peek_next(req.inode, pos, end) else {
            break;
        };
        let from = pos.max(key.start());
        let to = end.min(key.end());
        let dst_start = ((from - req.offset) as usize) * SECTOR_SIZE;
        let dst_end = ((to - req.offset) as usize) * SECTOR_SIZE;

        read_extent(fs, &req, key, from, to, &mut out[dst_start..dst_end]).await?;
        pos = to;
    }

    fs.counters
        .account_read(DataType::User, u64::from(req.sectors) * SECTOR_SIZE as u64);
    Ok(out.freeze())
}

/// Reads the live sectors `[from, to)` of one extent into `dst`, retrying
/// across replicas as the state machine dictates.
async fn read_extent(
    fs: &Arc<Filesystem>,
    req: &ReadRequest,
    first_snapshot: ExtentKey,
    from: u64,
    to: u64,
    dst: &mut [u8],
) -> Result<(), ReadError> {
    let mut key = first_snapshot;
    let mut avoid = req.avoid;
    let mut failed = DeviceSet::default();
    let mut force_bounce = false;
    // A stale snapshot can repeat at most once per generation bump;
    // bound the in-place loop by the replica population.
    let mut stale_retries = fs.devices.len() + 1;

    loop {
        let ptr = match pick_replica(fs, &key, avoid, req.flags) {
            Ok(ptr) => ptr,
            Err(PickError::Stale) => {
                if stale_retries == 0 {
                    return StaleSnafu {
                        inode: req.inode,
                        offset: from,
                    }
                    .fail();
                }
                stale_retries -= 1;
                match fs.index.peek_next(req.inode, from, to) {
                    Some(fresh) if fresh.overlaps(from, to) => {
                        key = fresh;
                        continue;
                    }
                    // The stale extent was dropped; the region now reads
                    // as zeroes.
                    _ => {
                        dst.fill(0);
                        return Ok(());
                    }
                }
            }
            Err(PickError::Exhausted) => {
                return if failed.is_empty() {
                    NoReplicaSnafu {
                        inode: req.inode,
                        offset: from,
                    }
                    .fail()
                } else {
                    IoSnafu { failed }.fail()
                };
            }
        };

        match read_replica(fs, req, &key, &ptr, from, to, dst, force_bounce).await {
            Ok(()) => return Ok(()),
            Err(Retry::Bounce) => {
                trace!(dev = ptr.dev, "reverifying user-mapped read through a bounce buffer");
                force_bounce = true;
            }
            Err(Retry::Avoid(dev)) => {
                debug!(dev, "read retrying on another replica");
                avoid.insert(dev);
                failed.insert(dev);
            }
            Err(Retry::Again) => {}
            Err(Retry::Fatal(e)) => return Err(e),
        }
    }
}

enum PickError {
    /// Only stale cached pointers remain and the caller asked to retry.
    Stale,
    /// Nothing pickable at all.
    Exhausted,
}

/// Chooses a replica: skip dying devices and stale cached pointers, honor
/// the avoid-set, tie-break on lowest device index.
fn pick_replica(
    fs: &Filesystem,
    key: &ExtentKey,
    avoid: DeviceSet,
    flags: ReadFlags,
) -> Result<Pointer, PickError> {
    let mut saw_stale = false;
    let mut best: Option<&Pointer> = None;

    for ptr in &key.ptrs {
        let dev = fs.device(ptr.dev);
        if dev.is_dying() || avoid.contains(ptr.dev) {
            continue;
        }
        if ptr.cached && (ptr.gen != dev.generation() || fs.race_fault_fired()) {
            // Generation mismatch and the injected race fault are distinct
            // signals, but both mean the cached copy cannot be trusted.
            saw_stale = true;
            continue;
        }
        match best {
            Some(b) if b.dev <= ptr.dev => {}
            _ => best = Some(ptr),
        }
    }

    match best {
        Some(ptr) => Ok(*ptr),
        None if saw_stale && flags.contains(ReadFlags::RETRY_IF_STALE) => Err(PickError::Stale),
        None => Err(PickError::Exhausted),
    }
}

/// One attempt against one replica: submit, verify, decode, deliver, and
/// opportunistically narrow or promote.
#[allow(clippy::too_many_arguments)]
async fn read_replica(
    fs: &Arc<Filesystem>,
    req: &ReadRequest,
    key: &ExtentKey,
    ptr: &Pointer,
    from: u64,
    to: u64,
    dst: &mut [u8],
    force_bounce: bool,
) -> Result<(), Retry> {
    let dev = fs.device(ptr.dev);
    let stored = key.stored_read_range(from, to);
    let fs_key = fs.cfg.encryption_key.clone();
    let encrypted = fs_key.is_some() && key.crc.is_some();

    let direct = !force_bounce
        && !req.flags.contains(ReadFlags::MUST_BOUNCE)
        && !req.flags.contains(ReadFlags::NODECODE)
        && !key.is_compressed()
        && !encrypted
        && (key.crc.is_none() || stored.sectors as usize * SECTOR_SIZE == dst.len());

    if direct {
        // The caller's buffer takes the I/O; at most a checksum to verify
        // afterwards.
        if let Err(e) = dev
            .read_sectors(ptr.offset + stored.payload_offset, dst)
            .await
        {
            debug!(dev = ptr.dev, error = %e, "replica read failed");
            return Err(Retry::Avoid(ptr.dev));
        }
        if let Some(crc) = &key.crc {
            if codec::verify(crc.csum_type, None, key.nonce(), dst, crc.csum).is_err() {
                // An in-place verification failure over memory the caller
                // can touch says nothing about the device yet.
                if req.flags.contains(ReadFlags::USER_MAPPED) && !force_bounce {
                    return Err(Retry::Bounce);
                }
                dev.note_io_error();
                return Err(Retry::Avoid(ptr.dev));
            }
        }
        return Ok(());
    }

    // Bounced path: read the checksummed payload (or the requested slice
    // of a plain one) into scratch pages.
    let payload_bytes = stored.sectors as usize * SECTOR_SIZE;
    let mut bounce = fs
        .bounce
        .acquire(payload_bytes)
        .await
        .ok_or(Retry::Fatal(ReadError::BounceExhausted))?;
    if let Err(e) = dev
        .read_sectors(ptr.offset + stored.payload_offset, bounce.as_mut_slice())
        .await
    {
        debug!(dev = ptr.dev, error = %e, "replica read failed");
        return Err(Retry::Avoid(ptr.dev));
    }

    // A promote re-encrypts the plaintext back to the same keystream
    // coordinates, i.e. writes these exact stored bytes; keep them before
    // the decode consumes the bounce buffer.
    let promote_eligible = req.flags.contains(ReadFlags::MAY_PROMOTE)
        && !req.flags.contains(ReadFlags::NODECODE)
        && stored.payload_offset == 0
        && stored.sectors == key.stored_sectors()
        && fs.cfg.promote_tier.is_some_and(|tier| dev.tier() > tier);
    let promote_payload = promote_eligible.then(|| Bytes::copy_from_slice(bounce.as_slice()));

    if req.flags.contains(ReadFlags::NODECODE) {
        // Verify only; the caller wants the stored bytes as-is.
        if let Some(crc) = &key.crc {
            if codec::verify(crc.csum_type, fs_key.as_ref(), key.nonce(), bounce.as_slice(), crc.csum)
                .is_err()
            {
                dev.note_io_error();
                return Err(Retry::Avoid(ptr.dev));
            }
        }
        dst.copy_from_slice(&bounce.as_slice()[..dst.len()]);
        return Ok(());
    }

    let wants_narrow = key
        .crc
        .is_some_and(|crc| !crc.is_compressed() && crc.covers_more_than_live());
    let decode_input = DecodeInput {
        key: key.clone(),
        fs_key: fs_key.clone(),
        want_narrow: wants_narrow,
    };

    let decoded = match completion_context(key, encrypted) {
        CompletionContext::Unbound => {
            let handle =
                tokio::task::spawn_blocking(move || decode_payload(bounce, decode_input));
            handle.await.expect("decode task panicked")
        }
        CompletionContext::HighPriority | CompletionContext::Inline => {
            decode_payload(bounce, decode_input)
        }
    };

    let decoded = match decoded {
        Ok(decoded) => decoded,
        Err(CodecError::ChecksumMismatch { .. }) => {
            dev.note_io_error();
            return Err(Retry::Avoid(ptr.dev));
        }
        Err(source @ CodecError::Decompress { .. }) => {
            return Err(Retry::Fatal(ReadError::Decompress { source }));
        }
        Err(_) => return Err(Retry::Avoid(ptr.dev)),
    };

    // Deliver the live slice in logical order.
    let live_start = stored.live_offset as usize * SECTOR_SIZE;
    dst.copy_from_slice(&decoded.plaintext[live_start..live_start + dst.len()]);

    if let Some(narrowed) = decoded.narrowed_csum {
        narrow_crcs(fs, key, narrowed);
    }

    if let Some(payload) = promote_payload {
        promote(fs, key, ptr, payload);
    }

    Ok(())
}

struct DecodeInput {
    key: ExtentKey,
    fs_key: Option<EncryptionKey>,
    want_narrow: bool,
}

struct DecodedPayload {
    /// Full uncompressed plaintext of the stored payload.
    plaintext: Vec<u8>,
    /// Checksum over the live ciphertext range, when narrowing applies.
    narrowed_csum: Option<Csum>,
}

/// CPU half of a bounced read: verify, optionally compute the narrowed
/// checksum, decrypt, decompress.
fn decode_payload(
    mut bounce: crate::bounce::BounceBuf,
    input: DecodeInput,
) -> Result<DecodedPayload, CodecError> {
    let key = &input.key;
    let crc = key.crc.as_ref();
    let fs_key = input.fs_key.as_ref();
    let nonce = key.nonce();

    if let Some(crc) = crc {
        codec::verify(crc.csum_type, fs_key, nonce, bounce.as_slice(), crc.csum)?;
    }

    // The narrowed checksum is over ciphertext the verify just covered, so
    // this cannot observe different bytes than the verification did.
    let narrowed_csum = match (input.want_narrow, crc) {
        (true, Some(crc)) => {
            let live_start = crc.offset as usize * SECTOR_SIZE;
            let live_len = crc.live_size as usize * SECTOR_SIZE;
            let narrowed_nonce = ExtentNonce::new(key.version, crc.nonce + crc.offset);
            Some(codec::checksum(
                crc.csum_type,
                fs_key,
                narrowed_nonce,
                &bounce.as_slice()[live_start..live_start + live_len],
            )?)
        }
        _ => None,
    };

    if let Some(fs_key) = fs_key {
        if crc.is_some() {
            codec::encrypt(fs_key, nonce, 0, bounce.as_mut_slice());
        }
    }

    let plaintext = match crc {
        Some(crc) if crc.is_compressed() => {
            let mut plain = vec![0u8; crc.uncompressed_size as usize * SECTOR_SIZE];
            codec::decompress(&mut plain, bounce.as_slice(), crc.compression)?;
            plain
        }
        _ => bounce.as_slice().to_vec(),
    };

    Ok(DecodedPayload {
        plaintext,
        narrowed_csum,
    })
}

/// Rewrites the extent with a checksum covering exactly its live range, so
/// future reads stop fetching dead sectors.  Best-effort: a concurrent
/// update to the key simply wins and the attempt is accounted.
fn narrow_crcs(fs: &Filesystem, key: &ExtentKey, narrowed_csum: Csum) {
    let Some(crc) = key.crc else { return };

    let mut replacement = key.clone();
    for ptr in &mut replacement.ptrs {
        ptr.offset += u64::from(crc.offset);
    }
    replacement.crc = Some(crate::extent::CrcDescriptor {
        compressed_size: crc.live_size,
        uncompressed_size: crc.live_size,
        live_size: crc.live_size,
        offset: 0,
        csum_type: crc.csum_type,
        csum: narrowed_csum,
        compression: crc.compression,
        nonce: crc.nonce + crc.offset,
    });

    if fs.index.try_replace(key, Some(replacement)).is_err() {
        fs.counters.read_realloc_race();
    }
}

/// Reads an extent's whole stored payload, verified but not decoded: the
/// move engine rewrites ciphertext byte-for-byte.
///
/// Prefers `prefer` as the source when it is usable, then falls back
/// through the remaining replicas like any other read.
pub(crate) async fn read_stored(
    fs: &Arc<Filesystem>,
    key: &ExtentKey,
    prefer: Option<DeviceId>,
) -> Result<Bytes, ReadError> {
    let mut avoid = DeviceSet::default();
    let mut failed = DeviceSet::default();
    let payload_bytes = key.stored_sectors() as usize * SECTOR_SIZE;
    let fs_key = fs.cfg.encryption_key.as_ref();

    loop {
        let preferred = prefer
            .filter(|dev| !avoid.contains(*dev) && !fs.device(*dev).is_dying())
            .and_then(|dev| key.ptr_for_device(dev))
            .copied();
        let ptr = match preferred {
            Some(ptr) => ptr,
            None => match pick_replica(fs, key, avoid, ReadFlags::NODECODE) {
                Ok(ptr) => ptr,
                Err(_) => {
                    return if failed.is_empty() {
                        NoReplicaSnafu {
                            inode: key.inode,
                            offset: key.start(),
                        }
                        .fail()
                    } else {
                        IoSnafu { failed }.fail()
                    };
                }
            },
        };

        let mut bounce = fs
            .bounce
            .acquire(payload_bytes)
            .await
            .ok_or(ReadError::BounceExhausted)?;
        let dev = fs.device(ptr.dev);
        if let Err(e) = dev.read_sectors(ptr.offset, bounce.as_mut_slice()).await {
            debug!(dev = ptr.dev, error = %e, "move read failed");
            avoid.insert(ptr.dev);
            failed.insert(ptr.dev);
            continue;
        }

        if let Some(crc) = &key.crc {
            if codec::verify(crc.csum_type, fs_key, key.nonce(), bounce.as_slice(), crc.csum)
                .is_err()
            {
                dev.note_io_error();
                avoid.insert(ptr.dev);
                failed.insert(ptr.dev);
                continue;
            }
        }

        fs.counters
            .account_read(DataType::Relocated, payload_bytes as u64);
        return Ok(bounce.freeze());
    }
}

/// Queues a cache-write of the freshly-read extent to the promote tier.
///
/// The payload is the extent's stored bytes, so the cached pointer joins
/// the key at the same `(version, crc)` coordinates as every other
/// replica.  The splice into the index is the same protocol a move pass
/// uses; a foreground write that beats it simply wins.
fn promote(fs: &Arc<Filesystem>, key: &ExtentKey, ptr: &Pointer, payload: Bytes) {
    let Some(promote_tier) = fs.cfg.promote_tier else {
        return;
    };

    let mut op = WriteOp::new(
        Pos::new(key.inode, key.start()),
        crate::IoOpts {
            csum: key.csum_type(),
            compression: key
                .crc
                .map_or(codec::CompressionType::None, |crc| crc.compression),
            replicas: 1,
        },
    );
    op.version = key.version;
    op.flags = WriteFlags::CACHED
        | WriteFlags::ALLOC_NOWAIT
        | WriteFlags::DATA_ENCODED
        | WriteFlags::PAGES_STABLE
        | WriteFlags::PAGES_OWNED
        | WriteFlags::NOMARK_REPLICAS;
    op.have = key.ptrs.iter().map(|p| p.dev).collect();
    op.tier = Some(promote_tier);
    op.encoded = key.crc;
    op.data_type = DataType::Cached;

    fs.counters.promote();
    let fs = Arc::clone(fs);
    let key = key.clone();
    let expect_dev = ptr.dev;
    tokio::spawn(async move {
        match crate::write::encode_and_submit(&fs, &op, payload).await {
            Ok(submitted) => {
                if submitted.error.is_some() {
                    // Cached copies are best-effort; a nowait allocation
                    // miss just drops the promote.
                    fs.counters.promote_skipped();
                    return;
                }
                let Some(new_key) = submitted.keys.into_iter().next() else {
                    fs.counters.promote_skipped();
                    return;
                };
                let mut stats = crate::relocate::JobStats::default();
                crate::relocate::migrate_index_update(
                    &fs, &new_key, &key, expect_dev, None, &mut stats,
                );
            }
            Err(e) => debug!(error = %e, "promote write dropped"),
        }
    });
}

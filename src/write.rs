//! The write pipeline.
//!
//! A write reserves replica space, carves the payload into chunks sized by
//! the open write point, encodes each chunk (compress, encrypt, checksum),
//! fans the encoded payload out to its replica devices in parallel, and
//! commits the resulting keys to the extent index.  Failures drop pointers
//! rather than keys: whatever reached a device durably is committed, and
//! the single error code for the request is reported afterwards.

use bitflags::bitflags;
use bytes::Bytes;
use futures::future::join_all;
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument, trace};

use crate::{
    alloc::AllocError,
    codec::{self, CodecError, CsumType, ExtentNonce},
    config::SECTOR_SIZE,
    counters::DataType,
    extent::{CrcDescriptor, DeviceSet, ExtentKey, Pos},
    index::{IndexError, InsertFlags},
    Filesystem, IoOpts,
};

bitflags! {
    /// Behavior flags carried by a [`WriteOp`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct WriteFlags: u32 {
        /// Pointers are cached: best-effort, evictable, not counted
        /// against the replication quota.
        const CACHED = 1 << 0;
        /// Ask the journal for durability up to this write's sequence
        /// before completion.
        const FLUSH = 1 << 1;
        /// The payload is already encoded; `WriteOp::encoded` describes
        /// it and the encode loop is skipped.
        const DATA_ENCODED = 1 << 2;
        /// The payload cannot change underneath us, so checksums may be
        /// computed over it without bouncing.
        const PAGES_STABLE = 1 << 3;
        /// The payload memory belongs to this op exclusively.
        const PAGES_OWNED = 1 << 4;
        /// Fail with `WouldBlock` instead of waiting for allocation.
        const ALLOC_NOWAIT = 1 << 5;
        /// Allocate only from `WriteOp::devs`.
        const ONLY_SPECIFIED_DEVS = 1 << 6;
        /// Skip replicas-table bookkeeping; the caller's index updater
        /// records presence itself.
        const NOMARK_REPLICAS = 1 << 7;
    }
}

/// Error produced by the write pipeline.
#[derive(Debug, Snafu)]
pub enum WriteError {
    #[snafu(display("filesystem is read-only"))]
    ReadOnly,

    /// The reservation could not be satisfied.
    #[snafu(display("out of space: {}", source))]
    NoSpace { source: AllocError },

    /// Allocation needed to wait and the caller forbade it.
    #[snafu(display("allocation would block"))]
    WouldBlock,

    /// Bounce memory above the pool-backed maximum was unavailable.
    #[snafu(display("bounce memory exhausted"))]
    BounceExhausted,

    /// One or more replica writes failed; the failure bitmap names the
    /// devices.  Chunks with surviving replicas were still committed.
    #[snafu(display("I/O error on devices {:?}", failed))]
    Io { failed: DeviceSet },

    /// Checksum verification failed while re-encoding pre-encoded data.
    #[snafu(display("re-encode verification failed: {}", source))]
    Encode { source: CodecError },

    #[snafu(display("index update failed: {}", source))]
    Index { source: IndexError },

    #[snafu(display("payload length {} is not sector-aligned", len))]
    Unaligned { len: usize },
}

/// A foreground or background write request.
///
/// Transient: created by the caller, consumed by [`Filesystem::write`].
#[derive(Debug)]
pub struct WriteOp {
    pub pos: Pos,
    /// Version to stamp the new extents with; zero allocates a fresh one.
    pub version: u64,
    /// Keystream chunk base when continuing a caller-supplied version.
    pub nonce_base: u32,
    pub opts: IoOpts,
    pub flags: WriteFlags,
    /// With `ONLY_SPECIFIED_DEVS`, the only devices to allocate from.
    pub devs: Vec<crate::extent::DeviceId>,
    /// Devices that must not receive a replica (a migrate source).
    pub exclude: DeviceSet,
    /// Devices that already hold this data (rereplicate writes only the
    /// missing copies).
    pub have: DeviceSet,
    /// Target tier, when the caller cares (promotes, tiering).
    pub tier: Option<u8>,
    /// With `DATA_ENCODED`, the descriptor of the payload as stored.
    pub encoded: Option<CrcDescriptor>,
    pub data_type: DataType,
}

impl WriteOp {
    pub fn new(pos: Pos, opts: IoOpts) -> Self {
        Self {
            pos,
            version: 0,
            nonce_base: 0,
            opts,
            flags: WriteFlags::default(),
            devs: Vec::new(),
            exclude: DeviceSet::default(),
            have: DeviceSet::default(),
            tier: None,
            encoded: None,
            data_type: DataType::User,
        }
    }
}

/// Successful write result.
#[derive(Debug)]
pub struct WriteOutcome {
    /// The keys now present in the extent index.
    pub keys: Vec<ExtentKey>,
    /// Journal sequence of the index update, if any key was committed.
    pub journal_seq: Option<u64>,
}

/// Keys encoded and durably submitted, before any index update.
pub(crate) struct SubmittedWrite {
    pub keys: Vec<ExtentKey>,
    pub failed: DeviceSet,
    pub error: Option<WriteError>,
}

/// Runs the full pipeline: encode, submit, index update, optional flush.
#[instrument(skip_all, fields(inode = op.pos.inode, offset = op.pos.offset), level = "debug")]
pub(crate) async fn execute(
    fs: &Filesystem,
    op: WriteOp,
    payload: Bytes,
) -> Result<WriteOutcome, WriteError> {
    if fs.is_read_only() {
        return ReadOnlySnafu.fail();
    }

    let submitted = encode_and_submit(fs, &op, payload).await?;
    if !submitted.failed.is_empty() {
        debug!(failed = ?submitted.failed, "write lost replicas to device failures");
    }

    let journal_seq = if submitted.keys.is_empty() {
        None
    } else {
        if !op.flags.contains(WriteFlags::NOMARK_REPLICAS) {
            for key in &submitted.keys {
                fs.mark_replicas(key);
            }
        }
        Some(commit_keys(fs, &submitted.keys)?)
    };

    if let Some(seq) = journal_seq {
        if op.flags.contains(WriteFlags::FLUSH) {
            fs.journal.flush_seq(seq).await;
        }
    }

    match submitted.error {
        Some(error) => Err(error),
        None => Ok(WriteOutcome {
            keys: submitted.keys,
            journal_seq,
        }),
    }
}

/// Inserts keys under a journal reservation, returning the sequence.
pub(crate) fn commit_keys(fs: &Filesystem, keys: &[ExtentKey]) -> Result<u64, WriteError> {
    let res = fs.journal.res_get();
    fs.journal.add_keys(&res, keys);
    let result = fs.index.insert(keys, InsertFlags::USE_RESERVE);
    let seq = res.seq();
    fs.journal.res_put(res);
    result.context(IndexSnafu)?;
    Ok(seq)
}

/// The encode loop and replica fan-out, stopping short of the index so
/// the move engine can substitute its own updater.
pub(crate) async fn encode_and_submit(
    fs: &Filesystem,
    op: &WriteOp,
    payload: Bytes,
) -> Result<SubmittedWrite, WriteError> {
    if payload.is_empty() || payload.len() % SECTOR_SIZE != 0 {
        return UnalignedSnafu { len: payload.len() }.fail();
    }

    let replicas = op.opts.replicas.clamp(1, crate::extent::MAX_REPLICAS);
    let total_sectors = (payload.len() / SECTOR_SIZE) as u64;
    let mut reservation = fs
        .alloc
        .reserve(total_sectors, replicas)
        .context(NoSpaceSnafu)?;

    let version = if op.version == 0 {
        fs.fresh_version()
    } else {
        op.version
    };

    // (key, stored payload, pointers allocated before failures)
    let mut chunks: Vec<(ExtentKey, Bytes, usize)> = Vec::new();
    // Source sectors consumed and live sectors placed diverge for
    // pre-encoded payloads, whose live range can be narrower than what is
    // stored.
    let mut consumed: u64 = 0;
    let mut logical: u64 = 0;
    let mut error: Option<WriteError> = None;

    'alloc: while consumed < total_sectors {
        let only: &[_] = if op.flags.contains(WriteFlags::ONLY_SPECIFIED_DEVS) {
            &op.devs
        } else {
            &[]
        };
        let mut wp = match fs.alloc.alloc_sectors_start(
            replicas,
            only,
            op.exclude,
            op.have,
            op.tier,
            op.flags.contains(WriteFlags::ALLOC_NOWAIT),
        ) {
            Ok(wp) => wp,
            Err(AllocError::WouldBlock) => {
                error = Some(WriteError::WouldBlock);
                break 'alloc;
            }
            Err(source) => {
                error = Some(WriteError::NoSpace { source });
                break 'alloc;
            }
        };

        while wp.free_sectors() > 0 && consumed < total_sectors {
            let nonce = ExtentNonce::new(version, op.nonce_base + consumed as u32);
            let chunk = match encode_chunk(fs, op, &payload, consumed, wp.free_sectors(), nonce)
                .await
            {
                Ok(chunk) => chunk,
                Err(e) => {
                    error = Some(e);
                    fs.alloc.alloc_sectors_done(wp);
                    break 'alloc;
                }
            };

            let stored_sectors = (chunk.stored.len() / SECTOR_SIZE) as u32;
            let ptrs = fs.alloc.alloc_sectors_append_ptrs(
                &mut wp,
                stored_sectors,
                op.flags.contains(WriteFlags::CACHED),
            );
            reservation.consume(u64::from(stored_sectors) * ptrs.len() as u64);

            let allocated = ptrs.len();
            let key = ExtentKey {
                inode: op.pos.inode,
                offset: op.pos.offset + logical,
                size: chunk.live_sectors,
                version,
                crc: chunk.crc,
                ptrs,
            };
            trace!(
                offset = key.offset,
                sectors = key.size,
                stored = stored_sectors,
                replicas = allocated,
                "encoded chunk"
            );
            consumed += chunk.source_consumed;
            logical += u64::from(chunk.live_sectors);
            chunks.push((key, chunk.stored, allocated));
        }

        fs.alloc.alloc_sectors_done(wp);
    }

    let failed = submit_replicas(fs, op, &mut chunks).await;

    // Drop chunks that kept no replica at all; their range simply is not
    // written, which the caller learns through the error.
    let mut keys = Vec::with_capacity(chunks.len());
    let mut short_of_replicas = false;
    let required = if op.flags.contains(WriteFlags::CACHED) {
        1
    } else {
        replicas as usize
    };
    for (key, _, allocated) in chunks {
        if key.ptrs.is_empty() {
            short_of_replicas = true;
            continue;
        }
        if key.ptrs.len() < allocated && key.ptrs.len() < required {
            short_of_replicas = true;
        }
        keys.push(key);
    }

    if error.is_none() && short_of_replicas {
        error = Some(WriteError::Io { failed });
    }

    Ok(SubmittedWrite { keys, failed, error })
}

struct EncodedChunk {
    stored: Bytes,
    crc: Option<CrcDescriptor>,
    live_sectors: u32,
    /// Sectors of the source payload this chunk consumed.
    source_consumed: u64,
}

/// Encodes one chunk starting `consumed` sectors into the payload.
async fn encode_chunk(
    fs: &Filesystem,
    op: &WriteOp,
    payload: &Bytes,
    consumed: u64,
    wp_free: u64,
    nonce: ExtentNonce,
) -> Result<EncodedChunk, WriteError> {
    let key = fs.cfg.encryption_key.as_ref();
    let total_sectors = (payload.len() / SECTOR_SIZE) as u64;
    let remaining = total_sectors - consumed;

    // Pre-encoded payloads skip the encode loop; if only the checksum kind
    // differs and the data is uncompressed, rechecksum without bouncing.
    if op.flags.contains(WriteFlags::DATA_ENCODED) {
        let Some(mut desc) = op.encoded else {
            // A plain stored payload: no descriptor to carry, the bytes
            // go out as they came in.
            debug_assert_eq!(consumed, 0, "pre-encoded payloads are a single chunk");
            return Ok(EncodedChunk {
                stored: payload.clone(),
                crc: None,
                live_sectors: remaining as u32,
                source_consumed: remaining,
            });
        };
        debug_assert_eq!(consumed, 0, "pre-encoded payloads are a single chunk");
        debug_assert_eq!(
            payload.len(),
            desc.compressed_size as usize * SECTOR_SIZE,
            "descriptor must describe the payload"
        );
        debug_assert!(
            u64::from(desc.compressed_size) <= wp_free,
            "an encoded extent always fits one open bucket"
        );
        if desc.csum_type != op.opts.csum && desc.compression == codec::CompressionType::None {
            let old_nonce = ExtentNonce::new(nonce.version, desc.nonce);
            desc.csum = codec::rechecksum(
                payload,
                desc.csum_type,
                desc.csum,
                old_nonce,
                op.opts.csum,
                old_nonce,
                key,
                0..payload.len(),
            )
            .context(EncodeSnafu)?;
            desc.csum_type = op.opts.csum;
        }
        return Ok(EncodedChunk {
            stored: payload.clone(),
            crc: Some(desc),
            live_sectors: desc.live_size,
            source_consumed: remaining,
        });
    }

    let max_encoded = (fs.cfg.encoded_extent_max / SECTOR_SIZE) as u64;
    let max_csum = (fs.cfg.encoded_extent_max_csum / SECTOR_SIZE) as u64;
    let csum_type = op.opts.csum;

    // Compression attempt, sized to what the write point can take.
    if op.opts.compression != codec::CompressionType::None {
        let src_sectors = remaining.min(wp_free).min(max_encoded);
        let src = payload.slice(
            (consumed as usize) * SECTOR_SIZE..(consumed + src_sectors) as usize * SECTOR_SIZE,
        );
        let mut bounce = fs
            .bounce
            .acquire(src.len())
            .await
            .ok_or(WriteError::BounceExhausted)?;
        if let Some(len) =
            codec::compress(&src, bounce.as_mut_slice(), op.opts.compression)
                .context(EncodeSnafu)?
        {
            bounce.truncate(len);
            if let Some(key) = key {
                codec::encrypt(key, nonce, 0, bounce.as_mut_slice());
            }
            let csum = codec::checksum(csum_type, key, nonce, bounce.as_slice())
                .context(EncodeSnafu)?;
            return Ok(EncodedChunk {
                stored: bounce.freeze(),
                crc: Some(CrcDescriptor {
                    compressed_size: (len / SECTOR_SIZE) as u32,
                    uncompressed_size: src_sectors as u32,
                    live_size: src_sectors as u32,
                    offset: 0,
                    csum_type,
                    csum,
                    compression: op.opts.compression,
                    nonce: nonce.chunk,
                }),
                live_sectors: src_sectors as u32,
                source_consumed: src_sectors,
            });
        }
    }

    // Uncompressed path.  Checksummed chunks are kept smaller; plain
    // unchecksummed chunks only have to fit the write point.
    let limit = if csum_type != CsumType::None {
        max_csum
    } else {
        max_encoded
    };
    let chunk_sectors = remaining.min(wp_free).min(limit);
    let src = payload.slice(
        (consumed as usize) * SECTOR_SIZE..(consumed + chunk_sectors) as usize * SECTOR_SIZE,
    );

    let must_bounce = key.is_some()
        || (csum_type != CsumType::None && !op.flags.contains(WriteFlags::PAGES_STABLE));

    let (stored, csum) = if must_bounce {
        let mut bounce = fs
            .bounce
            .acquire(src.len())
            .await
            .ok_or(WriteError::BounceExhausted)?;
        bounce.as_mut_slice().copy_from_slice(&src);
        if let Some(key) = key {
            codec::encrypt(key, nonce, 0, bounce.as_mut_slice());
        }
        let csum =
            codec::checksum(csum_type, key, nonce, bounce.as_slice()).context(EncodeSnafu)?;
        (bounce.freeze(), csum)
    } else {
        // The caller's pages are borrowed for the duration of the I/O.
        let csum = codec::checksum(csum_type, key, nonce, &src).context(EncodeSnafu)?;
        (src, csum)
    };

    let crc = (csum_type != CsumType::None).then_some(CrcDescriptor {
        compressed_size: chunk_sectors as u32,
        uncompressed_size: chunk_sectors as u32,
        live_size: chunk_sectors as u32,
        offset: 0,
        csum_type,
        csum,
        compression: codec::CompressionType::None,
        nonce: nonce.chunk,
    });

    Ok(EncodedChunk {
        stored,
        crc,
        live_sectors: chunk_sectors as u32,
        source_consumed: chunk_sectors,
    })
}

/// Fans each chunk out to its replica devices in parallel and merges
/// per-pointer status into a failure bitmap, dropping failed pointers.
async fn submit_replicas(
    fs: &Filesystem,
    op: &WriteOp,
    chunks: &mut [(ExtentKey, Bytes, usize)],
) -> DeviceSet {
    // Journal-flush durability is arranged per-request here, so writes
    // that need it are tagged FUA at the device.
    let fua = op.flags.contains(WriteFlags::FLUSH);

    let mut submissions = Vec::new();
    for (chunk_idx, (key, stored, _)) in chunks.iter().enumerate() {
        for ptr in &key.ptrs {
            let dev = fs.device(ptr.dev);
            // Later pointers share the payload through its refcount; the
            // last consumes this chunk's handle when the loop ends.
            let data = stored.clone();
            let sector = ptr.offset;
            let dev_id = ptr.dev;
            submissions.push(async move {
                let result = dev.write_sectors(sector, data, fua).await;
                (chunk_idx, dev_id, result)
            });
        }
    }

    let mut failed = DeviceSet::default();
    for (chunk_idx, dev_id, result) in join_all(submissions).await {
        match result {
            Ok(()) => {
                let bytes = chunks[chunk_idx].1.len() as u64;
                fs.counters.account_write(op.data_type, bytes);
            }
            Err(e) => {
                debug!(dev = dev_id, error = %e, "replica write failed");
                failed.insert(dev_id);
                chunks[chunk_idx].0.ptrs.retain(|p| p.dev != dev_id);
            }
        }
    }
    failed
}

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;

/// Kinds of payload crossing the data path, used to split byte accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    /// Foreground user reads and writes.
    User = 0,
    /// Best-effort cached copies (promotes).
    Cached = 1,
    /// Background relocation traffic.
    Relocated = 2,
}

const DATA_TYPES: usize = 3;

fn data_type_label(data_type: DataType) -> &'static str {
    match data_type {
        DataType::User => "user",
        DataType::Cached => "cached",
        DataType::Relocated => "relocated",
    }
}

/// Process-wide data-path counters.
///
/// Initialized at mount and torn down at unmount.  Everything here is
/// updated from the hot path, so each field is a plain atomic the caller can
/// also read directly in tests; the same updates are mirrored through the
/// `metrics` facade for external collection.
#[derive(Debug, Default)]
pub struct Counters {
    /// Narrow-crcs rewrites that lost the index race.
    pub read_realloc_races: AtomicU64,
    /// Extents a move pass successfully re-pointed.
    pub extent_migrate_done: AtomicU64,
    /// Move-pass regions discarded because foreground writes got there first.
    pub extent_migrate_raced: AtomicU64,
    /// Promote writes issued.
    pub promotes: AtomicU64,
    /// Promote writes dropped because a nowait allocation failed.
    pub promotes_skipped: AtomicU64,

    read_bytes: [AtomicU64; DATA_TYPES],
    written_bytes: [AtomicU64; DATA_TYPES],
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account_read(&self, data_type: DataType, bytes: u64) {
        self.read_bytes[data_type as usize].fetch_add(bytes, Ordering::Relaxed);
        counter!("datapath_read_bytes", bytes, "data_type" => data_type_label(data_type));
    }

    pub fn account_write(&self, data_type: DataType, bytes: u64) {
        self.written_bytes[data_type as usize].fetch_add(bytes, Ordering::Relaxed);
        counter!("datapath_written_bytes", bytes, "data_type" => data_type_label(data_type));
    }

    pub fn read_bytes(&self, data_type: DataType) -> u64 {
        self.read_bytes[data_type as usize].load(Ordering::Relaxed)
    }

    pub fn written_bytes(&self, data_type: DataType) -> u64 {
        self.written_bytes[data_type as usize].load(Ordering::Relaxed)
    }

    pub fn read_realloc_race(&self) {
        self.read_realloc_races.fetch_add(1, Ordering::Relaxed);
        counter!("datapath_read_realloc_races", 1);
    }

    pub fn extent_migrate_done(&self) {
        self.extent_migrate_done.fetch_add(1, Ordering::Relaxed);
        counter!("datapath_extent_migrate_done", 1);
    }

    pub fn extent_migrate_raced(&self) {
        self.extent_migrate_raced.fetch_add(1, Ordering::Relaxed);
        counter!("datapath_extent_migrate_raced", 1);
    }

    pub fn promote(&self) {
        self.promotes.fetch_add(1, Ordering::Relaxed);
        counter!("datapath_promotes", 1);
    }

    pub fn promote_skipped(&self) {
        self.promotes_skipped.fetch_add(1, Ordering::Relaxed);
        counter!("datapath_promotes_skipped", 1);
    }
}

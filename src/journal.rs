//! The journal seam: an append-only log of index updates with sequence
//! numbers, pins, and flush-to-stable.
//!
//! The commit protocol behind the log is not this crate's concern; this
//! reference journal tracks sequences and durability watermarks so the
//! pipelines' flush contract can be exercised.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

use crate::extent::ExtentKey;

/// A slot in the journal, held while an index update is in flight.
#[derive(Debug)]
pub struct JournalRes {
    seq: u64,
}

impl JournalRes {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

#[derive(Debug)]
pub struct Journal {
    next_seq: AtomicU64,
    stable_tx: watch::Sender<u64>,
    stable_rx: watch::Receiver<u64>,
    /// Sequences pinned by in-flight updates; the stable watermark never
    /// passes the lowest pin.
    pins: Mutex<BTreeMap<u64, u32>>,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal {
    pub fn new() -> Self {
        let (stable_tx, stable_rx) = watch::channel(0);
        Self {
            next_seq: AtomicU64::new(1),
            stable_tx,
            stable_rx,
            pins: Mutex::new(BTreeMap::new()),
        }
    }

    /// Acquires a journal reservation, pinning its sequence.
    pub fn res_get(&self) -> JournalRes {
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        *self.pins.lock().entry(seq).or_insert(0) += 1;
        JournalRes { seq }
    }

    /// Records keys against a reservation.
    pub fn add_keys(&self, res: &JournalRes, keys: &[ExtentKey]) {
        trace!(seq = res.seq, keys = keys.len(), "journalling index update");
    }

    /// Releases a reservation's pin and lets the stable watermark advance
    /// past it, waking any flush waiting on the sequence.
    pub fn res_put(&self, res: JournalRes) {
        {
            let mut pins = self.pins.lock();
            match pins.get_mut(&res.seq) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    pins.remove(&res.seq);
                }
                None => unreachable!("unbalanced journal pin"),
            }
        }
        self.advance_stable();
    }

    /// Highest sequence known stable.
    pub fn stable_seq(&self) -> u64 {
        *self.stable_rx.borrow()
    }

    /// Drives the stable watermark up to `seq` and waits until it gets
    /// there.  The watermark never passes a pinned sequence, so a flush
    /// issued while an earlier update is still committing waits for it.
    pub async fn flush_seq(&self, seq: u64) {
        let mut rx = self.stable_rx.clone();
        loop {
            self.advance_stable();
            if *rx.borrow() >= seq {
                return;
            }
            rx.changed().await.expect("journal sender lives as long as self");
        }
    }

    fn advance_stable(&self) {
        let pins = self.pins.lock();
        let limit = pins
            .keys()
            .next()
            .map_or_else(|| self.next_seq.load(Ordering::Acquire) - 1, |lowest| lowest - 1);
        drop(pins);

        self.stable_tx.send_if_modified(|stable| {
            if limit > *stable {
                *stable = limit;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flush_waits_for_pins() {
        let journal = Journal::new();
        let res = journal.res_get();
        let seq = res.seq();

        // The pin holds the watermark below our sequence.
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            journal.flush_seq(seq),
        )
        .await;
        assert!(pending.is_err(), "flush must wait while pinned");

        journal.res_put(res);
        journal.flush_seq(seq).await;
        assert!(journal.stable_seq() >= seq);
    }

    #[tokio::test]
    async fn sequences_are_monotonic() {
        let journal = Journal::new();
        let a = journal.res_get();
        let b = journal.res_get();
        assert!(b.seq() > a.seq());
        journal.res_put(a);
        journal.res_put(b);
    }
}

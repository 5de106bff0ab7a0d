use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crossbeam_utils::CachePadded;
use rand::Rng;

// Weight of a new sample: latency <- latency - latency/8 + sample/8.
const EWMA_SHIFT: u32 = 3;

/// Lock-free exponentially-weighted moving average of device I/O latency.
///
/// Samples arrive from every I/O completion, so the common case must not
/// contend: a sample close to the current estimate is dropped entirely
/// unless enough time has passed since the last accepted one, and the update
/// itself is a compare-and-swap loop that gives up after a failed exchange
/// rather than spin against other completions.
#[derive(Debug)]
pub struct LatencyEwma {
    micros: CachePadded<AtomicU64>,
    last_update: CachePadded<AtomicU64>,
    update_window: Duration,
}

impl LatencyEwma {
    pub fn new(update_window: Duration) -> Self {
        Self {
            micros: CachePadded::new(AtomicU64::new(0)),
            last_update: CachePadded::new(AtomicU64::new(0)),
            update_window,
        }
    }

    /// Current latency estimate in microseconds.  Zero until the first
    /// accepted sample.
    pub fn current_micros(&self) -> u64 {
        self.micros.load(Ordering::Relaxed)
    }

    /// Folds one completion latency into the estimate.
    ///
    /// `now_micros` is a monotonic timestamp used only to gate how often
    /// near-identical samples are accepted.
    pub fn sample(&self, sample_micros: u64, now_micros: u64) {
        let current = self.micros.load(Ordering::Relaxed);

        // Samples within half the current estimate carry little information;
        // take them only occasionally so the estimate can still drift, and
        // always once the update window has gone stale.
        if current > 0 && sample_micros.abs_diff(current) < current / 2 {
            let last = self.last_update.load(Ordering::Relaxed);
            let window = self.update_window.as_micros() as u64;
            if now_micros.saturating_sub(last) < window && rand::thread_rng().gen_range(0..8) != 0 {
                return;
            }
        }

        let next = if current == 0 {
            sample_micros
        } else {
            current - (current >> EWMA_SHIFT) + (sample_micros >> EWMA_SHIFT)
        };

        // A lost race means another completion updated the estimate with its
        // own sample; ours is no longer worth retrying.
        if self
            .micros
            .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.last_update.store(now_micros, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_estimate() {
        let ewma = LatencyEwma::new(Duration::from_millis(100));
        ewma.sample(1000, 0);
        assert_eq!(ewma.current_micros(), 1000);
    }

    #[test]
    fn distant_samples_always_update() {
        let ewma = LatencyEwma::new(Duration::from_millis(100));
        ewma.sample(1000, 0);
        ewma.sample(8000, 1);
        // 1000 - 125 + 1000
        assert_eq!(ewma.current_micros(), 1875);
    }

    #[test]
    fn near_samples_update_after_window() {
        let ewma = LatencyEwma::new(Duration::from_micros(10));
        ewma.sample(1000, 0);
        // Well past the window, so the gate cannot drop it.
        ewma.sample(1100, 1_000_000);
        assert_eq!(ewma.current_micros(), 1000 - (1000 >> 3) + (1100 >> 3));
    }
}

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::time::JIFFIES_PER_SEC;

/// Windowed throughput estimator.
///
/// The hot path (`accumulate`) is two relaxed adds; readers fold the
/// running counters into per-second rates whenever a full window has
/// elapsed. Rates hold the previous window's value until then, so two
/// threads sampling concurrently see the same answer.
///
/// # Test
///
/// ```
/// use sfu_server_service::{rate::Estimator, time::JIFFIES_PER_SEC};
///
/// let rate = Estimator::new(JIFFIES_PER_SEC);
///
/// for _ in 0..100 {
///     rate.accumulate(1200);
/// }
///
/// // Nothing to report until the first window closes.
/// assert_eq!(rate.estimate(JIFFIES_PER_SEC / 2), (0, 0));
/// assert_eq!(rate.estimate(JIFFIES_PER_SEC), (120_000, 100));
/// ```
pub struct Estimator {
    interval: u64,
    time: AtomicU64,
    bytes: AtomicU32,
    packets: AtomicU32,
    rate_bytes: AtomicU32,
    rate_packets: AtomicU32,
}

impl Estimator {
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            time: AtomicU64::new(0),
            bytes: AtomicU32::new(0),
            packets: AtomicU32::new(0),
            rate_bytes: AtomicU32::new(0),
            rate_packets: AtomicU32::new(0),
        }
    }

    pub fn accumulate(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u32, Ordering::Relaxed);
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    fn swap(&self, now: u64) {
        let time = self.time.load(Ordering::Relaxed);
        if now.saturating_sub(time) < self.interval {
            return;
        }

        // One sampler wins the window; the rest keep the old rates.
        if self
            .time
            .compare_exchange(time, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let elapsed = now - time;
        let bytes = self.bytes.swap(0, Ordering::Relaxed) as u64;
        let packets = self.packets.swap(0, Ordering::Relaxed) as u64;

        self.rate_bytes
            .store((bytes * JIFFIES_PER_SEC / elapsed) as u32, Ordering::Relaxed);
        self.rate_packets.store(
            (packets * JIFFIES_PER_SEC / elapsed) as u32,
            Ordering::Relaxed,
        );
    }

    /// Current (bytes per second, packets per second).
    pub fn estimate(&self, now: u64) -> (u32, u32) {
        self.swap(now);

        (
            self.rate_bytes.load(Ordering::Relaxed),
            self.rate_packets.load(Ordering::Relaxed),
        )
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

use crate::time::JIFFIES_PER_SEC;

/// A value set before this many jiffies ago no longer says anything
/// about the stream and reads back as unknown.
pub const RECEIVER_REPORT_TIMEOUT: u64 = 8 * JIFFIES_PER_SEC;

/// A (bitrate, timestamp) pair shared between the thread that measures
/// and the threads that read. Both halves are plain relaxed atomics: a
/// reader may observe a rate one write older than the timestamp, which
/// is harmless, while staleness is never masked.
///
/// # Test
///
/// ```
/// use sfu_server_service::cell::{BitrateCell, RECEIVER_REPORT_TIMEOUT};
///
/// let cell = BitrateCell::default();
/// assert_eq!(cell.get(1000), u64::MAX);
///
/// cell.set(512_000, 1000);
/// assert_eq!(cell.get(1000), 512_000);
/// assert_eq!(cell.get(1000 + RECEIVER_REPORT_TIMEOUT), 512_000);
///
/// // Too old, or from the future: unknown.
/// assert_eq!(cell.get(1001 + RECEIVER_REPORT_TIMEOUT), u64::MAX);
/// assert_eq!(cell.get(999), u64::MAX);
/// ```
pub struct BitrateCell {
    bitrate: AtomicU64,
    jiffies: AtomicU64,
}

impl Default for BitrateCell {
    fn default() -> Self {
        Self {
            bitrate: AtomicU64::new(u64::MAX),
            jiffies: AtomicU64::new(0),
        }
    }
}

impl BitrateCell {
    pub fn set(&self, bitrate: u64, now: u64) {
        self.bitrate.store(bitrate, Ordering::Relaxed);
        self.jiffies.store(now, Ordering::Relaxed);
    }

    pub fn get(&self, now: u64) -> u64 {
        let jiffies = self.jiffies.load(Ordering::Relaxed);
        if now < jiffies || now - jiffies > RECEIVER_REPORT_TIMEOUT {
            return u64::MAX;
        }

        self.bitrate.load(Ordering::Relaxed)
    }
}

/// The receiver-side quality snapshot a downstream report leaves
/// behind: fraction lost (Q0.8) and interarrival jitter, packed into
/// one word so a read is a single load.
///
/// # Test
///
/// ```
/// use sfu_server_service::cell::ReceiverStatsCell;
///
/// let cell = ReceiverStatsCell::default();
///
/// cell.set(32, 1800, 1000);
/// assert_eq!(cell.get(2000), (32, 1800));
///
/// // Stale snapshots read as silence, not as old quality.
/// assert_eq!(cell.get(u64::MAX / 2), (0, 0));
/// ```
#[derive(Default)]
pub struct ReceiverStatsCell {
    packed: AtomicU64,
    jiffies: AtomicU64,
}

impl ReceiverStatsCell {
    pub fn set(&self, loss: u8, jitter: u32, now: u64) {
        self.packed
            .store(((loss as u64) << 32) | jitter as u64, Ordering::Relaxed);
        self.jiffies.store(now, Ordering::Relaxed);
    }

    pub fn get(&self, now: u64) -> (u8, u32) {
        let jiffies = self.jiffies.load(Ordering::Relaxed);
        if now < jiffies || now - jiffies > RECEIVER_REPORT_TIMEOUT {
            return (0, 0);
        }

        let packed = self.packed.load(Ordering::Relaxed);
        ((packed >> 32) as u8, packed as u32)
    }
}

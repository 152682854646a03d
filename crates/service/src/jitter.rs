use parking_lot::Mutex;

use crate::time::JIFFIES_PER_SEC;

struct Inner {
    started: bool,
    /// Arrival time of the previous packet, in units of the media
    /// clock.
    arrival: u32,
    timestamp: u32,
    /// Scaled by 16, per the RFC 3550 appendix recipe.
    jitter: u32,
}

/// RFC 3550 interarrival jitter, in media clock units.
///
/// For each packet the difference between the arrival spacing and the
/// RTP timestamp spacing feeds a 1/16 smoothed accumulator:
/// `J += (|D| - J) / 16`.
///
/// # Test
///
/// ```
/// use sfu_server_service::jitter::Jitter;
///
/// let jitter = Jitter::new(48000);
///
/// // 1024 jiffies is exactly 750 clock units at 48 kHz; a perfectly
/// // paced stream accumulates nothing.
/// for i in 0..10u32 {
///     jitter.accumulate(750 * i, i as u64 * 1024);
/// }
/// assert_eq!(jitter.get(), 0);
///
/// // The next packet arrives 655 jiffies (479 clock units) late.
/// jitter.accumulate(750 * 10, 10 * 1024 + 655);
/// assert_eq!(jitter.get(), 29);
/// ```
pub struct Jitter {
    clock_rate: u32,
    inner: Mutex<Inner>,
}

impl Jitter {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            inner: Mutex::new(Inner {
                started: false,
                arrival: 0,
                timestamp: 0,
                jitter: 0,
            }),
        }
    }

    pub fn accumulate(&self, timestamp: u32, now: u64) {
        let arrival =
            ((now as u128 * self.clock_rate as u128) / JIFFIES_PER_SEC as u128) as u32;

        let mut inner = self.inner.lock();
        if !inner.started {
            inner.started = true;
            inner.arrival = arrival;
            inner.timestamp = timestamp;
            return;
        }

        let mut d = arrival
            .wrapping_sub(inner.arrival)
            .wrapping_sub(timestamp.wrapping_sub(inner.timestamp));
        if (d as i32) < 0 {
            d = d.wrapping_neg();
        }

        inner.jitter = inner
            .jitter
            .wrapping_add(d)
            .wrapping_sub((inner.jitter + 8) >> 4);
        inner.arrival = arrival;
        inner.timestamp = timestamp;
    }

    /// Current estimate in media clock units, as reported in reception
    /// reports.
    pub fn get(&self) -> u32 {
        self.inner.lock().jitter >> 4
    }
}

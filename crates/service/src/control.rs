use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use codec::rtcp::report::ReceptionReport;

use crate::{
    cache::{MAX_CAPACITY, MIN_CAPACITY},
    cell::BitrateCell,
    time::JIFFIES_PER_SEC,
};

/// Bounds of the loss-driven send budget, in bits per second.
pub const MIN_LOSS_RATE: u64 = 9600;
pub const INIT_LOSS_RATE: u64 = 512 * 1000;
pub const MAX_LOSS_RATE: u64 = 1 << 30;

/// PLI and FIR are each allowed at most once per this many jiffies.
pub const FEEDBACK_INTERVAL: u64 = JIFFIES_PER_SEC / 5;

/// Loss-driven send budget, updated on every downstream report.
///
/// Additive-increase, multiplicative-decrease with a dead band: below
/// ~2% loss the budget grows by 269/256, but only while the sender is
/// actually using at least 7/8 of it; above ~10% it shrinks
/// proportionally to the loss; in between it holds. The cell is
/// re-published even when unchanged so a quiet stream does not decay
/// into staleness.
///
/// # Test
///
/// ```
/// use sfu_server_service::{cell::BitrateCell, control::update_loss_rate};
///
/// let cell = BitrateCell::default();
///
/// // Stale budget resets to the initial rate, then probes upward.
/// update_loss_rate(&cell, 0, u32::MAX / 8, 1000);
/// assert_eq!(cell.get(1000), 512_000 * 269 / 256);
///
/// // Heavy loss backs off.
/// update_loss_rate(&cell, 30, 0, 1001);
/// assert_eq!(cell.get(1001), 538_000 * (512 - 30) / 512);
///
/// // Moderate loss holds.
/// update_loss_rate(&cell, 12, 0, 1002);
/// assert_eq!(cell.get(1002), 538_000 * (512 - 30) / 512);
/// ```
pub fn update_loss_rate(cell: &BitrateCell, loss: u8, bytes_per_sec: u32, now: u64) {
    let mut rate = cell.get(now);
    if !(MIN_LOSS_RATE..=MAX_LOSS_RATE).contains(&rate) {
        rate = INIT_LOSS_RATE;
    }

    if loss < 5 {
        // Probe upward only when the current budget is saturated.
        let actual = 8 * bytes_per_sec as u64;
        if actual >= rate * 7 / 8 {
            rate = (rate * 269 / 256).min(MAX_LOSS_RATE);
        }
    } else if loss > 25 {
        rate = (rate * (512 - loss as u64) / 512).max(MIN_LOSS_RATE);
    }

    cell.set(rate, now);
}

/// Smoothed round-trip estimate: first sample taken as-is, then
/// `rtt = (3 * rtt + sample) / 4`.
///
/// # Test
///
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use sfu_server_service::control::update_rtt;
///
/// let rtt = AtomicU64::new(0);
///
/// update_rtt(&rtt, 1000);
/// assert_eq!(rtt.load(Ordering::Relaxed), 1000);
///
/// update_rtt(&rtt, 2000);
/// assert_eq!(rtt.load(Ordering::Relaxed), 1250);
/// ```
pub fn update_rtt(rtt: &AtomicU64, sample: u64) {
    let prior = rtt.load(Ordering::Relaxed);
    let next = if prior > 0 {
        (3 * prior + sample) / 4
    } else {
        sample
    };

    rtt.store(next, Ordering::Relaxed);
}

/// Extract a round-trip sample from a reception report, correlating
/// its LSR echo against the SR this side last sent on the track.
/// `None` when the report carries no LSR, echoes a different SR, or
/// the timing is impossible (stale SR, clock skew).
pub fn rtt_from_report(
    report: &ReceptionReport,
    sr_time: u64,
    sr_ntp: u64,
    now: u64,
) -> Option<u64> {
    if report.last_sender_report == 0 {
        return None;
    }

    if now < sr_time || now - sr_time > 8 * JIFFIES_PER_SEC {
        return None;
    }

    if report.last_sender_report != (sr_ntp >> 16) as u32 {
        return None;
    }

    // DLSR counts 1/65536ths of a second.
    let delay = report.delay as u64 * (JIFFIES_PER_SEC / 65536);
    if delay > now - sr_time {
        return None;
    }

    Some(now - sr_time - delay)
}

/// One-send-per-interval quota around PLI and FIR.
///
/// A `last` in the future means the clock went backwards under us; it
/// counts as not recent so feedback never stalls.
///
/// # Test
///
/// ```
/// use sfu_server_service::control::RateLimiter;
///
/// let limiter = RateLimiter::new(100);
///
/// assert!(limiter.allow(1000));
/// assert!(!limiter.allow(1050));
/// assert!(limiter.allow(1100));
///
/// // Clock went backwards: allow rather than stall.
/// assert!(limiter.allow(500));
/// ```
pub struct RateLimiter {
    interval: u64,
    last: AtomicU64,
}

impl RateLimiter {
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            last: AtomicU64::new(0),
        }
    }

    pub fn allow(&self, now: u64) -> bool {
        let last = self.last.load(Ordering::Relaxed);
        if now >= last && now - last < self.interval {
            return false;
        }

        self.last
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

/// The 32-bit FIR command sequence counter; only its low 8 bits go on
/// the wire. Incrementing is decoupled from sending so the sequence
/// stays monotone across rate-limited (dropped) requests.
///
/// # Test
///
/// ```
/// use sfu_server_service::control::FirCounter;
///
/// let counter = FirCounter::default();
///
/// assert_eq!(counter.next(true), 1);
/// assert_eq!(counter.next(false), 1);
/// assert_eq!(counter.next(true), 2);
/// ```
#[derive(Default)]
pub struct FirCounter(AtomicU32);

impl FirCounter {
    pub fn next(&self, increment: bool) -> u8 {
        if increment {
            (self.0.fetch_add(1, Ordering::Relaxed) + 1) as u8
        } else {
            self.0.load(Ordering::Relaxed) as u8
        }
    }
}

/// How many packets the retransmission cache should hold so any NACK
/// can still be served across the worst subscriber's RTO: four times
/// the packets in flight over `max_rto`, clamped to the cache bounds.
///
/// # Test
///
/// ```
/// use sfu_server_service::{control::cache_capacity, time::JIFFIES_PER_SEC};
///
/// assert_eq!(cache_capacity(400, JIFFIES_PER_SEC / 4), 256);
/// assert_eq!(cache_capacity(50, JIFFIES_PER_SEC / 10), 32);
/// assert_eq!(cache_capacity(100, JIFFIES_PER_SEC / 4), 100);
/// ```
pub fn cache_capacity(packets_per_sec: u32, max_rto: u64) -> usize {
    let packets = packets_per_sec as u64 * max_rto * 4 / JIFFIES_PER_SEC;
    packets.clamp(MIN_CAPACITY as u64, MAX_CAPACITY as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::jiffies;

    #[test]
    fn test_loss_rate_requires_saturation() {
        let now = jiffies();
        let cell = BitrateCell::default();
        cell.set(512_000, now);

        // Plenty of headroom: no probe without demand.
        update_loss_rate(&cell, 0, 1000, now);
        assert_eq!(cell.get(now), 512_000);

        // 8 * 56_000 = 448_000 >= 7/8 * 512_000.
        update_loss_rate(&cell, 0, 56_000, now);
        assert_eq!(cell.get(now), 538_000);
    }

    #[test]
    fn test_loss_rate_aimd_sequence() {
        let now = jiffies();
        let cell = BitrateCell::default();

        let mut expected = INIT_LOSS_RATE;
        for loss in [0u8, 0, 0, 30, 0] {
            update_loss_rate(&cell, loss, u32::MAX / 8, now);

            expected = if loss > 25 {
                expected * (512 - loss as u64) / 512
            } else {
                expected * 269 / 256
            };

            assert_eq!(cell.get(now), expected);
        }
    }

    #[test]
    fn test_loss_rate_clamps() {
        let now = jiffies();
        let cell = BitrateCell::default();

        cell.set(MIN_LOSS_RATE, now);
        update_loss_rate(&cell, 255, 0, now);
        assert_eq!(cell.get(now), MIN_LOSS_RATE);

        cell.set(MAX_LOSS_RATE, now);
        update_loss_rate(&cell, 0, u32::MAX / 8, now);
        assert_eq!(cell.get(now), MAX_LOSS_RATE);
    }

    #[test]
    fn test_rtt_from_report_guards() {
        let sr_ntp = 0x1234_5678_9abc_def0u64;
        let lsr = (sr_ntp >> 16) as u32;
        let report = |lsr: u32, delay: u32| ReceptionReport {
            last_sender_report: lsr,
            delay,
            ..ReceptionReport::default()
        };

        // Happy path: sent at 1000, echoed with a one-second DLSR,
        // observed at 1000 + 2 * JIFFIES_PER_SEC.
        let now = 1000 + 2 * JIFFIES_PER_SEC;
        assert_eq!(
            rtt_from_report(&report(lsr, 65536), 1000, sr_ntp, now),
            Some(JIFFIES_PER_SEC)
        );

        // No LSR, mismatched LSR, stale SR, impossible delay, clock
        // skew.
        assert_eq!(rtt_from_report(&report(0, 65536), 1000, sr_ntp, now), None);
        assert_eq!(
            rtt_from_report(&report(lsr + 1, 65536), 1000, sr_ntp, now),
            None
        );
        assert_eq!(
            rtt_from_report(&report(lsr, 65536), 1000, sr_ntp, 2000 + 8 * JIFFIES_PER_SEC),
            None
        );
        assert_eq!(
            rtt_from_report(&report(lsr, u32::MAX), 1000, sr_ntp, now),
            None
        );
        assert_eq!(rtt_from_report(&report(lsr, 0), 1000, sr_ntp, 999), None);
    }
}

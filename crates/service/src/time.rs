use std::{
    sync::LazyLock,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// Resolution of the internal monotonic clock. Everything the core
/// timestamps (cells, rate limiters, RTT, report timing) counts in
/// jiffies of this rate.
pub const JIFFIES_PER_SEC: u64 = 65536;

/// Seconds between the NTP epoch (1900) and the unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// The current monotonic time in jiffies, anchored at first use.
pub fn jiffies() -> u64 {
    duration_to_jiffies(EPOCH.elapsed())
}

/// # Test
///
/// ```
/// use std::time::Duration;
/// use sfu_server_service::time::{JIFFIES_PER_SEC, duration_to_jiffies};
///
/// assert_eq!(duration_to_jiffies(Duration::from_secs(2)), 2 * JIFFIES_PER_SEC);
/// assert_eq!(duration_to_jiffies(Duration::from_millis(500)), JIFFIES_PER_SEC / 2);
/// ```
pub fn duration_to_jiffies(duration: Duration) -> u64 {
    duration.as_secs() * JIFFIES_PER_SEC
        + (duration.subsec_nanos() as u64 * JIFFIES_PER_SEC) / 1_000_000_000
}

pub fn jiffies_to_duration(jiffies: u64) -> Duration {
    Duration::new(
        jiffies / JIFFIES_PER_SEC,
        ((jiffies % JIFFIES_PER_SEC) * 1_000_000_000 / JIFFIES_PER_SEC) as u32,
    )
}

/// Wall clock as a 64-bit NTP timestamp: seconds since 1900 in the
/// high word, fraction in the low word.
pub fn time_to_ntp(time: SystemTime) -> u64 {
    let since = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);

    let seconds = since.as_secs() + NTP_UNIX_OFFSET;
    let fraction = (since.subsec_nanos() as u64) << 32;

    (seconds << 32) | (fraction / 1_000_000_000)
}

/// # Test
///
/// ```
/// use std::time::SystemTime;
/// use sfu_server_service::time::{ntp_to_time, time_to_ntp};
///
/// let now = SystemTime::now();
/// let there = ntp_to_time(time_to_ntp(now));
///
/// let skew = match there.duration_since(now) {
///     Ok(it) => it,
///     Err(it) => it.duration(),
/// };
///
/// assert!(skew.as_micros() < 10);
/// ```
pub fn ntp_to_time(ntp: u64) -> SystemTime {
    let seconds = (ntp >> 32).saturating_sub(NTP_UNIX_OFFSET);
    let nanos = ((ntp & 0xffff_ffff) * 1_000_000_000) >> 32;

    UNIX_EPOCH + Duration::new(seconds, nanos as u32)
}

/// How far an RTP timestamp advances over `duration` at `clock_rate`.
///
/// # Test
///
/// ```
/// use std::time::Duration;
/// use sfu_server_service::time::rtp_units;
///
/// assert_eq!(rtp_units(Duration::from_millis(20), 48000), 960);
/// assert_eq!(rtp_units(Duration::from_secs(1), 90000), 90000);
/// ```
pub fn rtp_units(duration: Duration, clock_rate: u32) -> u64 {
    duration.as_secs() * clock_rate as u64
        + (duration.subsec_nanos() as u64 * clock_rate as u64) / 1_000_000_000
}

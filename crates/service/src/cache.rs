use parking_lot::Mutex;

/// Sizing bounds for the retransmission cache, in packets.
pub const MIN_CAPACITY: usize = 32;
pub const MAX_CAPACITY: usize = 256;

/// Width of the reception window NACKs are mined from.
const BITMAP_SIZE: u16 = 32;

/// Half of the u16 space, the serial-arithmetic horizon.
const UINT16_SIZE_HALF: u16 = 1 << 15;

/// Loss accounting snapshot, in receiver-report terms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Packets expected since the last reset.
    pub expected: u32,
    /// Packets of those that never arrived.
    pub lost: u32,
    /// Lifetime loss, saturated at 24 bits.
    pub total_lost: u32,
    /// Extended highest sequence number received (cycles in the high
    /// half).
    pub extended_sequence_number: u32,
}

struct Entry {
    seqno: u16,
    buffer: Vec<u8>,
}

struct Inner {
    entries: Vec<Entry>,
    /// Next slot to overwrite.
    tail: usize,

    /// Reception window: bit `i` set means `first + i` has arrived.
    bitmap: u32,
    first: u16,
    bitmap_valid: bool,

    started: bool,
    /// Highest sequence number received, extended with wrap cycles.
    extended: u32,
    extended_at_reset: u32,
    received: u32,
    /// Retransmissions announced via `expect`, folded into the next
    /// expected count.
    pending: u32,
    total_lost: u32,
}

/// Ring of the most recent RTP packets on one inbound track, keyed by
/// sequence number, with the loss bookkeeping receiver reports and
/// NACKs are derived from.
///
/// # Test
///
/// ```
/// use sfu_server_service::cache::PacketCache;
///
/// let cache = PacketCache::new(32);
/// let mut buffer = [0u8; 1500];
///
/// let (_, index) = cache.store(100, b"hello");
///
/// assert_eq!(cache.get(100, &mut buffer), Some(5));
/// assert_eq!(&buffer[..5], b"hello");
/// assert_eq!(cache.get_at(index, 100, &mut buffer), Some(5));
///
/// // A slot read with a stale seqno misses instead of lying.
/// assert_eq!(cache.get_at(index, 101, &mut buffer), None);
/// assert_eq!(cache.get(101, &mut buffer), None);
/// ```
pub struct PacketCache {
    inner: Mutex<Inner>,
}

impl PacketCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);

        Self {
            inner: Mutex::new(Inner {
                entries: (0..capacity)
                    .map(|_| Entry {
                        seqno: 0,
                        buffer: Vec::new(),
                    })
                    .collect(),
                tail: 0,
                bitmap: 0,
                first: 0,
                bitmap_valid: false,
                started: false,
                extended: 0,
                extended_at_reset: 0,
                received: 0,
                pending: 0,
                total_lost: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Store one packet, returning the start of the reception window
    /// and the slot index it landed in.
    pub fn store(&self, seqno: u16, bytes: &[u8]) -> (u16, u16) {
        let mut inner = self.inner.lock();

        inner.received = inner.received.wrapping_add(1);
        if !inner.started {
            inner.started = true;
            inner.extended = seqno as u32;
            inner.extended_at_reset = (seqno as u32).wrapping_sub(1);
        } else {
            let diff = seqno.wrapping_sub(inner.extended as u16);
            if diff != 0 && diff < UINT16_SIZE_HALF {
                inner.extended = inner.extended.wrapping_add(diff as u32);
            }
        }

        if !inner.bitmap_valid {
            inner.bitmap_valid = true;
            inner.first = seqno;
            inner.bitmap = 1;
        } else {
            let delta = seqno.wrapping_sub(inner.first);
            if delta < BITMAP_SIZE {
                inner.bitmap |= 1 << delta;
            } else if delta < UINT16_SIZE_HALF {
                // Slide the window forward so the new packet is its
                // top bit.
                let shift = delta - (BITMAP_SIZE - 1);
                if shift >= BITMAP_SIZE {
                    inner.bitmap = 0;
                } else {
                    inner.bitmap >>= shift;
                }

                inner.first = inner.first.wrapping_add(shift);
                inner.bitmap |= 1 << (BITMAP_SIZE - 1);
            } else {
                // Reordered behind the window start; pull the window
                // back if the packet is close enough.
                let behind = inner.first.wrapping_sub(seqno);
                if behind <= 16 {
                    inner.bitmap = (inner.bitmap << behind) | 1;
                    inner.first = seqno;
                }
            }
        }

        let first = inner.first;
        let index = inner.tail;
        let entry = &mut inner.entries[index];
        entry.seqno = seqno;
        entry.buffer.clear();
        entry.buffer.extend_from_slice(bytes);
        inner.tail = (index + 1) % inner.entries.len();

        (first, index as u16)
    }

    /// Read a packet back by sequence number.
    pub fn get(&self, seqno: u16, buffer: &mut [u8]) -> Option<usize> {
        let inner = self.inner.lock();
        let entry = inner
            .entries
            .iter()
            .find(|it| it.seqno == seqno && !it.buffer.is_empty())?;

        let length = entry.buffer.len();
        buffer.get_mut(..length)?.copy_from_slice(&entry.buffer);
        Some(length)
    }

    /// Read a packet by the slot index `store` handed out, verifying
    /// the slot still holds that sequence number. Misses are expected:
    /// the slot may have been overwritten, or the cache resized.
    pub fn get_at(&self, index: u16, seqno: u16, buffer: &mut [u8]) -> Option<usize> {
        let inner = self.inner.lock();
        let entry = inner.entries.get(index as usize)?;
        if entry.seqno != seqno || entry.buffer.is_empty() {
            return None;
        }

        let length = entry.buffer.len();
        buffer.get_mut(..length)?.copy_from_slice(&entry.buffer);
        Some(length)
    }

    /// Extract the next run of missing packets from the reception
    /// window as a NACK (pivot, bitmap) pair, consuming the window up
    /// to the end of the run. Returns `None` while the window has no
    /// hole below the highest received sequence number.
    pub fn nack_get(&self) -> Option<(u16, u16)> {
        let mut inner = self.inner.lock();
        if !inner.bitmap_valid {
            return None;
        }

        let last = inner.extended as u16;
        loop {
            if inner.first.wrapping_sub(last) < UINT16_SIZE_HALF {
                // Window start caught up with the newest packet.
                return None;
            }

            if inner.bitmap & 1 == 1 {
                inner.bitmap >>= 1;
                inner.first = inner.first.wrapping_add(1);
                continue;
            }

            break;
        }

        let pivot = inner.first;
        let mut lost = 0u16;
        for i in 1..=16u16 {
            let seqno = pivot.wrapping_add(i);
            if last.wrapping_sub(seqno) >= UINT16_SIZE_HALF {
                break;
            }

            if inner.bitmap & (1 << i) == 0 {
                lost |= 1 << (i - 1);
            }
        }

        let advance = last.wrapping_sub(pivot).min(17);
        if advance >= BITMAP_SIZE {
            inner.bitmap = 0;
        } else {
            inner.bitmap >>= advance;
        }

        inner.first = pivot.wrapping_add(advance);
        Some((pivot, lost))
    }

    /// Announce `n` pending retransmissions so their arrival does not
    /// read as a negative loss interval.
    pub fn expect(&self, n: u32) {
        self.inner.lock().pending += n;
    }

    /// Loss accounting since the previous reset.
    pub fn get_stats(&self, reset: bool) -> CacheStats {
        let mut inner = self.inner.lock();

        let expected = inner.extended.wrapping_sub(inner.extended_at_reset) + inner.pending;
        let lost = expected.saturating_sub(inner.received);
        inner.total_lost = (inner.total_lost + lost).min(0x00ff_ffff);

        let stats = CacheStats {
            expected,
            lost,
            total_lost: inner.total_lost,
            extended_sequence_number: inner.extended,
        };

        if reset {
            inner.extended_at_reset = inner.extended;
            inner.received = 0;
            inner.pending = 0;
        }

        stats
    }

    /// Grow or shrink to `capacity` slots, keeping the newest packets.
    pub fn resize(&self, capacity: usize) {
        let capacity = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);

        let mut inner = self.inner.lock();
        if inner.entries.len() == capacity {
            return;
        }

        let tail = inner.tail;
        let mut ordered = std::mem::take(&mut inner.entries);
        let count = ordered.len();

        // Oldest first, as they were written.
        ordered.rotate_left(tail);

        let keep = capacity.min(count);
        let mut entries: Vec<Entry> = ordered.split_off(count - keep);
        entries.resize_with(capacity, || Entry {
            seqno: 0,
            buffer: Vec::new(),
        });

        inner.tail = if keep < capacity { keep } else { 0 };
        inner.entries = entries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_last_n() {
        let cache = PacketCache::new(32);
        let mut buffer = [0u8; 64];

        for seqno in 0..100u16 {
            cache.store(seqno, &seqno.to_be_bytes());
        }

        for seqno in 0..68u16 {
            assert_eq!(cache.get(seqno, &mut buffer), None);
        }

        for seqno in 68..100u16 {
            assert_eq!(cache.get(seqno, &mut buffer), Some(2));
            assert_eq!(buffer[..2], seqno.to_be_bytes());
        }
    }

    #[test]
    fn test_wraparound() {
        let cache = PacketCache::new(32);
        let mut buffer = [0u8; 64];

        for i in 0..8u16 {
            cache.store(65532u16.wrapping_add(i), b"x");
        }

        assert_eq!(cache.get(65535, &mut buffer), Some(1));
        assert_eq!(cache.get(3, &mut buffer), Some(1));
    }

    #[test]
    fn test_nack_bitmap() {
        let cache = PacketCache::new(64);

        let mut first = 0;
        for seqno in 100..=125u16 {
            if (115..=117).contains(&seqno) {
                continue;
            }

            first = cache.store(seqno, b"x").0;
        }

        // The window still starts at the first packet stored.
        assert_eq!(first, 100);
        assert_eq!(cache.nack_get(), Some((115, 0b11)));

        // The hole is consumed; nothing further is missing.
        assert_eq!(cache.nack_get(), None);
    }

    #[test]
    fn test_nack_not_beyond_last() {
        let cache = PacketCache::new(64);

        cache.store(10, b"x");
        cache.store(11, b"x");

        // No holes below the newest packet.
        assert_eq!(cache.nack_get(), None);
    }

    #[test]
    fn test_stats_and_expect() {
        let cache = PacketCache::new(64);

        for seqno in 0..10u16 {
            if seqno == 4 || seqno == 5 {
                continue;
            }

            cache.store(seqno, b"x");
        }

        let stats = cache.get_stats(true);
        assert_eq!(stats.expected, 10);
        assert_eq!(stats.lost, 2);
        assert_eq!(stats.total_lost, 2);
        assert_eq!(stats.extended_sequence_number, 9);

        // The two retransmissions arrive in the next interval; with
        // expect() they balance out instead of going negative.
        cache.expect(2);
        cache.store(4, b"x");
        cache.store(5, b"x");
        cache.store(10, b"x");

        let stats = cache.get_stats(true);
        assert_eq!(stats.expected, 3);
        assert_eq!(stats.lost, 0);
        assert_eq!(stats.total_lost, 2);
    }

    #[test]
    fn test_resize_keeps_newest() {
        let cache = PacketCache::new(64);
        let mut buffer = [0u8; 64];

        for seqno in 0..64u16 {
            cache.store(seqno, &seqno.to_be_bytes());
        }

        cache.resize(32);
        assert_eq!(cache.capacity(), 32);

        for seqno in 32..64u16 {
            assert_eq!(cache.get(seqno, &mut buffer), Some(2));
        }
        assert_eq!(cache.get(31, &mut buffer), None);

        cache.resize(200);
        assert_eq!(cache.capacity(), 200);
        assert_eq!(cache.get(63, &mut buffer), Some(2));

        // New stores land after the preserved packets.
        cache.store(64, &64u16.to_be_bytes());
        assert_eq!(cache.get(64, &mut buffer), Some(2));
        assert_eq!(cache.get(63, &mut buffer), Some(2));
    }
}

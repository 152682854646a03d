pub mod down;
pub mod up;
mod writer;

pub use down::{DownConnection, DownTrack};
pub use up::{UpConnection, UpTrack};

use std::sync::atomic::{AtomicU64, Ordering};

/// Serial-number horizon for 16-bit sequence comparisons.
pub(crate) const SERIAL_HALF: u16 = 1 << 15;

/// Largest packet the loops handle.
pub(crate) const PACKET_BUFFER_SIZE: usize = 1500;

/// Process-unique track identifiers. Subscriber lists key on these,
/// which is what makes removal idempotent.
pub(crate) fn next_track_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

//! ## Media-plane state machine
//!
//! The synchronous half of the forwarding core: everything a track
//! accumulates between packets (retransmission cache, jitter and rate
//! estimates, bitrate and quality cells, feedback quota and counters)
//! lives here, with no I/O and no runtime dependency. The async loops
//! in the server crate sample and mutate this state and do the actual
//! reading and writing.

pub mod cache;
pub mod cell;
pub mod control;
pub mod jitter;
pub mod rate;
pub mod time;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The codec did not negotiate the RTCP capability the feedback
    /// needs; the caller may fall back to a weaker one.
    UnsupportedFeedback,
    /// Feedback suppressed by the per-track quota.
    RateLimited,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

/// RTCP feedback capabilities a codec can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpFeedback {
    Nack,
    NackPli,
    CcmFir,
    GoogRemb,
}

/// The negotiated description of a media stream, as far as the
/// forwarding core cares: what clock it runs on, whether it is video,
/// and which feedback loops the remote agreed to.
#[derive(Debug, Clone)]
pub struct Media {
    pub mime: String,
    pub kind: MediaKind,
    pub clock_rate: u32,
    pub feedback: Vec<RtcpFeedback>,
}

impl Media {
    /// # Test
    ///
    /// ```
    /// use sfu_server_service::{Media, MediaKind, RtcpFeedback};
    ///
    /// let media = Media {
    ///     mime: "video/VP8".to_string(),
    ///     kind: MediaKind::Video,
    ///     clock_rate: 90000,
    ///     feedback: vec![RtcpFeedback::Nack, RtcpFeedback::NackPli],
    /// };
    ///
    /// assert!(media.supports(RtcpFeedback::NackPli));
    /// assert!(!media.supports(RtcpFeedback::CcmFir));
    /// ```
    pub fn supports(&self, feedback: RtcpFeedback) -> bool {
        self.feedback.contains(&feedback)
    }
}

//! ## RTP / RTCP wire formats
//!
//! [RFC3550]: https://tools.ietf.org/html/rfc3550
//! [RFC4585]: https://tools.ietf.org/html/rfc4585
//! [RFC5104]: https://tools.ietf.org/html/rfc5104
//!
//! The media plane of the forwarding core speaks two wire formats: RTP
//! data packets carrying the encoded media itself, and RTCP control
//! packets carrying the feedback loops around it (sender and receiver
//! reports, source descriptions, keyframe requests, retransmission
//! requests and bandwidth estimation, per [RFC3550], [RFC4585] and
//! [RFC5104]).
//!
//! Decoding borrows from the input buffer wherever the packet carries
//! bulk payload; encoding appends to a caller-provided `BytesMut` so a
//! compound RTCP packet is built by encoding its parts back to back.

pub mod rtcp;
pub mod rtp;

use std::{array::TryFromSliceError, str::Utf8Error};

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

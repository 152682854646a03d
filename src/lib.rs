//! ## SFU forwarding core
//!
//! The RTP forwarding core of a selective forwarding unit: media comes
//! in from publishing peers on [`server::UpConnection`]s, is cached,
//! accounted and fanned out to the [`server::DownConnection`]s
//! subscribed to them, while the usual WebRTC feedback loops run in
//! both directions (NACK recovery, PLI/FIR keyframe requests, sender
//! and receiver reports, CNAME propagation, REMB bitrate signaling).
//!
//! Everything below the media plane is someone else's problem:
//! signaling, SDP, ICE, DTLS and SRTP live with the embedder, behind
//! the narrow capability traits in [`transport`], and the room layer
//! delivers completed publishers to peers through [`peers`].

pub mod config;
pub mod peers;
pub mod server;
pub mod statistics;
pub mod transport;

pub use self::{
    config::Config,
    server::{DownConnection, DownTrack, UpConnection, UpTrack},
    statistics::Statistics,
};

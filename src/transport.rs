use async_trait::async_trait;
use service::MediaKind;

/// Terminal and transient transport failures.
///
/// `Closed` is the cancellation signal of the whole core: every loop
/// that sees it exits cleanly.
#[derive(Debug)]
pub enum TransportError {
    Closed,
    Io(String),
}

impl std::error::Error for TransportError {}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl TransportError {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connected,
    Closed,
}

/// A trickled ICE candidate, opaque to the core: it is queued until
/// the remote description exists and then handed back to the peer
/// connection.
#[derive(Debug, Clone)]
pub struct IceCandidate {
    pub candidate: String,
    pub mid: Option<String>,
}

/// The narrow slice of a WebRTC peer connection the core needs. The
/// concrete implementation (SDP, ICE, DTLS, SRTP) lives with the
/// embedder; inbound tracks are announced by calling
/// `UpConnection::on_track` with a [`MediaSource`].
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Declare interest in receiving one stream of `kind`.
    fn add_receive_transceiver(&self, kind: MediaKind) -> Result<(), TransportError>;

    fn state(&self) -> ConnectionState;

    fn remote_description_set(&self) -> bool;

    fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Write a compound RTCP packet on the connection.
    async fn write_rtcp(&self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// One inbound media stream: the ingest reader pulls RTP from it, the
/// per-track RTCP listener pulls the publisher's SR/SDES.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn recv(&self, buffer: &mut [u8]) -> Result<usize, TransportError>;

    async fn recv_rtcp(&self, buffer: &mut [u8]) -> Result<usize, TransportError>;
}

/// One outbound media stream towards a subscriber; the reverse RTCP
/// direction carries that subscriber's reports and feedback.
#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;

    async fn recv_rtcp(&self, buffer: &mut [u8]) -> Result<usize, TransportError>;
}

use std::sync::Arc;

use crate::server::{UpConnection, UpTrack};

/// A member of the wider system (a conference client) that can be
/// offered a published connection. Implemented by the room layer, not
/// the core.
pub trait Peer: Send + Sync {
    fn id(&self) -> &str;

    /// Deliver a completed publisher to this peer so it can subscribe.
    /// Called without any core lock held.
    fn push_connection(
        &self,
        id: &str,
        connection: Arc<UpConnection>,
        tracks: Vec<Arc<UpTrack>>,
        label: &str,
    );
}

/// The publisher's view of its group: who should be told about its
/// tracks once the track set is complete.
pub trait PeerRegistry: Send + Sync {
    /// The current peer set, excluding `exclude` (the publisher
    /// itself).
    fn peers(&self, exclude: &str) -> Vec<Arc<dyn Peer>>;
}

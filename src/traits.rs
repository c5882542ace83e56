use std::net::SocketAddrV4;
use tokio::sync::mpsc;

use crate::InfoHash;

/// Read-only accessor for a torrent the caller wants tracked.
///
/// The client only ever holds a [`std::sync::Weak`] to implementors of this
/// trait: torrents come and go independently of tracker sessions, and the
/// client must never be the reason a torrent outlives its owner.
pub trait TorrentStats: Send + Sync {
    fn info_hash(&self) -> InfoHash;

    /// Display name only; never used as a lookup key.
    fn title(&self) -> String;

    fn downloaded_bytes(&self) -> u64;

    fn remaining_bytes(&self) -> u64;

    fn uploaded_bytes(&self) -> u64;
}

/// A peer discovered through an announce reply, handed to the external peer
/// manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub info_hash: InfoHash,
    pub addr: SocketAddrV4,
}

/// External sink for peers discovered via announce replies.
///
/// Implementations must be idempotent: the client makes no effort to
/// deduplicate peers across announce cycles, so the same address may be
/// reported more than once.
pub trait PeerSink: Send + Sync {
    fn peer_add(&self, info_hash: InfoHash, addr: SocketAddrV4);
}

/// Bridges the trait-object style above onto the channel style the rest of
/// this crate's lineage favors, so callers who already have an
/// `mpsc::UnboundedSender<DiscoveredPeer>` wired up don't need an adapter.
impl PeerSink for mpsc::UnboundedSender<DiscoveredPeer> {
    fn peer_add(&self, info_hash: InfoHash, addr: SocketAddrV4) {
        // The receiving end having gone away just means nobody wants peers
        // anymore; nothing for the tracker client to do about that.
        let _ = self.send(DiscoveredPeer { info_hash, addr });
    }
}

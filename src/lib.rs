//! A single-actor BitTorrent UDP tracker client (BEP-15).
//!
//! Register a torrent against one or more `udp://` tracker URLs with
//! [`TrackerClientHandle::add_torrent`]; discovered peers arrive through the
//! [`PeerSink`] supplied at construction. Everything else (the connect
//! handshake, backoff, periodic announces, and stop-on-removal) is handled
//! internally by a single actor task.

mod binding;
mod client;
mod config;
mod registry;
mod session;
mod traits;
mod txid;
mod wire;

/// A torrent's BitTorrent info hash.
pub type InfoHash = [u8; 20];

/// A client's 20-byte BEP-15 peer identifier.
pub type PeerId = [u8; 20];

pub use client::{spawn, TrackerClientHandle};
pub use config::TrackerClientConfig;
pub use registry::AddTorrentError;
pub use traits::{DiscoveredPeer, PeerSink, TorrentStats};

use std::time::Duration;

use crate::PeerId;

/// Construction-time configuration for a [`crate::TrackerClient`].
///
/// There is no file or environment-variable surface here: the embedding
/// application builds this struct in-process, the same way the rest of
/// this crate's lineage configures its torrent/client objects.
#[derive(Debug, Clone)]
pub struct TrackerClientConfig {
    /// Fixed 20-byte peer id. Left `None` in production so bootstrap can
    /// generate one; tests pin a fixed value for reproducible wire bytes.
    pub peer_id: Option<PeerId>,

    /// Port advertised in every announce request. BEP-15 trackers only use
    /// this for logging; this client never listens for inbound peer-wire
    /// connections on it.
    pub announce_port: u16,

    /// Base backoff duration for the connect handshake (attempt 0).
    pub connect_timeout_base: Duration,

    /// Attempt index beyond which the backoff exponent stops growing.
    pub connect_timeout_max_attempt: u32,

    /// Interval between stop-announce retries after a torrent is removed.
    pub stop_retry_interval: Duration,

    /// Number of stop-announce retries sent before giving up on a binding.
    pub stop_retry_max_attempts: u32,

    /// Announce interval assumed for a binding before any tracker reply
    /// has told it otherwise.
    pub default_announce_interval: Duration,
}

impl Default for TrackerClientConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            announce_port: 43213,
            connect_timeout_base: Duration::from_secs(15),
            connect_timeout_max_attempt: 8,
            stop_retry_interval: Duration::from_secs(5),
            stop_retry_max_attempts: 5,
            default_announce_interval: Duration::from_secs(60),
        }
    }
}

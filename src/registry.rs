//! Tracker registry (C5): the process-wide set of sessions keyed by URL.

use std::collections::HashMap;
use std::net::SocketAddr;
use url::Url;

use crate::session::{Generation, TrackerSession};

const DEFAULT_UDP_PORT: u16 = 6969;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddTorrentError {
    #[error("invalid tracker url: {0}")]
    InvalidUrl(String),

    #[error("unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),
}

/// Parses a tracker URL and extracts the port this client should connect
/// on, defaulting to BEP-15's standard 6969 when absent. Only `udp://` is
/// accepted; HTTP(S) trackers are an external subsystem's concern.
pub fn parse_udp_tracker_url(raw: &str) -> Result<(Url, u16), AddTorrentError> {
    let url = Url::parse(raw).map_err(|e| AddTorrentError::InvalidUrl(e.to_string()))?;
    if url.scheme() != "udp" {
        return Err(AddTorrentError::UnsupportedScheme(url.scheme().to_string()));
    }
    if url.host_str().is_none() {
        return Err(AddTorrentError::InvalidUrl(raw.to_string()));
    }
    let port = url.port().unwrap_or(DEFAULT_UDP_PORT);
    Ok((url, port))
}

/// Owns every live tracker session plus the indexes needed to route an
/// inbound datagram back to its session and to find every session a given
/// torrent is bound to.
#[derive(Default)]
pub struct Registry {
    sessions: HashMap<Url, TrackerSession>,
    addr_to_url: HashMap<SocketAddr, Url>,
    next_generation: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &Url) -> Option<&TrackerSession> {
        self.sessions.get(url)
    }

    pub fn get_mut(&mut self, url: &Url) -> Option<&mut TrackerSession> {
        self.sessions.get_mut(url)
    }

    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<&Url> {
        self.addr_to_url.get(addr)
    }

    /// Looks up an existing session for `url`, or creates one in the
    /// `Resolving` state. Returns the session plus whether it was freshly
    /// created (the caller must kick off DNS resolution in that case).
    pub fn get_or_create(&mut self, url: Url, port: u16) -> (&mut TrackerSession, bool) {
        if self.sessions.contains_key(&url) {
            return (self.sessions.get_mut(&url).unwrap(), false);
        }
        let generation = Generation(self.next_generation);
        self.next_generation += 1;
        let session = TrackerSession::new(url.clone(), port, generation);
        self.sessions.insert(url.clone(), session);
        (self.sessions.get_mut(&url).unwrap(), true)
    }

    /// Records the resolved transport address for `url` so future inbound
    /// datagrams from it can be routed back.
    pub fn set_addr(&mut self, url: &Url, addr: SocketAddr) {
        if let Some(session) = self.sessions.get_mut(url) {
            if let Some(old) = session.addr.replace(addr) {
                self.addr_to_url.remove(&old);
            }
            self.addr_to_url.insert(addr, url.clone());
        }
    }

    /// Destroys a session whose binding set has become empty. No-op if it
    /// still has bindings or doesn't exist.
    pub fn drop_if_empty(&mut self, url: &Url) {
        let empty = self
            .sessions
            .get(url)
            .map(|s| s.bindings.is_empty())
            .unwrap_or(false);
        if empty {
            if let Some(session) = self.sessions.remove(url) {
                if let Some(addr) = session.addr {
                    self.addr_to_url.remove(&addr);
                }
            }
        }
    }

    pub fn sessions(&self) -> impl Iterator<Item = &TrackerSession> {
        self.sessions.values()
    }

    pub fn urls(&self) -> Vec<Url> {
        self.sessions.keys().cloned().collect()
    }
}

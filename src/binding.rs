//! Torrent-tracker binding (C4): one per (tracker, torrent) pair.

use std::sync::Weak;
use tokio::time::Instant;

use crate::traits::TorrentStats;
use crate::InfoHash;

/// A binding's lifecycle phase. `Live` holds a usable (if possibly-expired)
/// weak reference to the torrent; `Stop` means the torrent has been
/// released and the binding is only around to retry the stop announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingPhase {
    Live,
    /// Number of stop-announce retries sent so far (not counting the
    /// initial send made when entering this phase).
    Stop { attempt: u32 },
}

pub struct Binding {
    pub info_hash: InfoHash,
    pub torrent: Weak<dyn TorrentStats>,
    pub interval: std::time::Duration,
    pub txid: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub timer_deadline: Option<Instant>,
    pub phase: BindingPhase,
}

impl Binding {
    pub fn new(info_hash: InfoHash, torrent: Weak<dyn TorrentStats>, default_interval: std::time::Duration) -> Self {
        Self {
            info_hash,
            torrent,
            interval: default_interval,
            txid: 0,
            leechers: 0,
            seeders: 0,
            timer_deadline: None,
            phase: BindingPhase::Live,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.phase, BindingPhase::Live)
    }

    /// Moves the binding into the stop phase: the torrent reference is
    /// cleared (even if other strong references to it are still alive
    /// elsewhere) so every subsequent codepath treats it as released.
    pub fn enter_stop_phase(&mut self) {
        self.torrent = Weak::new();
        self.phase = BindingPhase::Stop { attempt: 0 };
    }
}

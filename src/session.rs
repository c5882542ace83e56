//! Per-tracker session state machine (C3).

use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use crate::binding::Binding;
use crate::InfoHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Resolving,
    Connecting,
    Connected,
    Error,
}

/// Computes the connect-retry deadline for 0-based attempt `attempt`,
/// doubling from `base` and capping the exponent at `max_attempt` so
/// backoff never exceeds `base * 2^max_attempt`.
pub fn connect_backoff(attempt: u32, base: Duration, max_attempt: u32) -> Duration {
    let exponent = attempt.min(max_attempt);
    base * 2u32.pow(exponent)
}

/// A generation-tagged identifier for a session, handed to its in-flight DNS
/// lookup so the lookup's completion can be dropped safely if the session
/// was destroyed (or replaced) in the meantime. See crate-level docs on DNS
/// callback safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation(pub u64);

pub struct TrackerSession {
    pub url: Url,
    pub port: u16,
    pub addr: Option<SocketAddr>,
    pub state: SessionState,
    pub generation: Generation,

    pub conn_txid: u32,
    pub conn_attempt: u32,
    pub conn_id: u64,
    pub conn_timer_deadline: Option<Instant>,

    pub bindings: std::collections::HashMap<InfoHash, Binding>,
}

impl TrackerSession {
    pub fn new(url: Url, port: u16, generation: Generation) -> Self {
        Self {
            url,
            port,
            addr: None,
            state: SessionState::Resolving,
            generation,
            conn_txid: 0,
            conn_attempt: 0,
            conn_id: 0,
            conn_timer_deadline: None,
            bindings: std::collections::HashMap::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
}

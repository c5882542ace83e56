//! Lifecycle orchestrator (C7), receive demultiplexer (C6) and bootstrap
//! (C8), all driven by a single actor task (§5: single-threaded cooperative
//! event loop).

use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use crate::binding::{Binding, BindingPhase};
use crate::config::TrackerClientConfig;
use crate::registry::{parse_udp_tracker_url, AddTorrentError, Registry};
use crate::session::{connect_backoff, Generation, SessionState};
use crate::traits::{PeerSink, TorrentStats};
use crate::txid::{AnnounceTxidGen, ConnectTxidGen};
use crate::wire::{
    decode_announce_response, decode_connect_response, decode_error_response,
    encode_announce_request, encode_connect_request, read_action, AnnounceEvent, AnnounceRequest,
    ACTION_ANNOUNCE, ACTION_CONNECT, ACTION_ERROR, ACTION_ERROR_SWAPPED,
};
use crate::{InfoHash, PeerId};

/// Inbound command handed to the actor from [`TrackerClientHandle`].
enum Command {
    AddTorrent {
        raw_url: String,
        torrent: Arc<dyn TorrentStats>,
        reply: oneshot::Sender<Result<(), AddTorrentError>>,
    },
    RemoveTorrent(InfoHash),
    AnnounceAll(InfoHash),
    Shutdown,
}

/// Result of a DNS lookup spawned for a tracker session, tagged with the
/// session's generation so a stale result (the session has since been
/// destroyed or replaced) can be safely discarded.
struct DnsResult {
    url: Url,
    generation: Generation,
    outcome: Result<SocketAddr, String>,
}

/// A cheaply-cloneable handle to a running [`TrackerClient`] actor.
#[derive(Clone)]
pub struct TrackerClientHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl TrackerClientHandle {
    /// Registers `torrent` with the tracker at `tracker_url`, creating (or
    /// reusing) a session for that URL. Fails without side effects if the
    /// URL doesn't parse or isn't a `udp://` scheme.
    pub async fn add_torrent(
        &self,
        tracker_url: &str,
        torrent: Arc<dyn TorrentStats>,
    ) -> Result<(), AddTorrentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::AddTorrent {
                raw_url: tracker_url.to_string(),
                torrent,
                reply: reply_tx,
            })
            .is_err()
        {
            // Actor is gone; treat as an invalid-url style failure since
            // there's no side effect either way.
            return Err(AddTorrentError::InvalidUrl(tracker_url.to_string()));
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Err(AddTorrentError::InvalidUrl(tracker_url.to_string())))
    }

    /// Deregisters `info_hash` from every tracker it is bound to, sending a
    /// stop announce (with retries) to any that are currently connected.
    pub fn remove_torrent(&self, info_hash: InfoHash) {
        let _ = self.cmd_tx.send(Command::RemoveTorrent(info_hash));
    }

    /// Sends an immediate refresh announce to every tracker `info_hash` is
    /// bound to and currently connected on, without disturbing timers.
    pub fn announce_all(&self, info_hash: InfoHash) {
        let _ = self.cmd_tx.send(Command::AnnounceAll(info_hash));
    }

    /// Stops the actor task. Bindings are dropped as-is; no stop announces
    /// are sent (use [`Self::remove_torrent`] first for a graceful exit).
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

struct TrackerClient {
    registry: Registry,
    /// Secondary index: which tracker URLs a given torrent is bound to.
    /// Needed because `remove_torrent`/`announce_all` are addressed by
    /// torrent, while the registry is addressed by tracker URL.
    torrent_sessions: HashMap<InfoHash, HashSet<Url>>,

    socket: UdpSocket,
    peer_id: PeerId,
    config: TrackerClientConfig,
    peer_sink: Arc<dyn PeerSink>,

    announce_txid_gen: AnnounceTxidGen,
    connect_txid_gen: ConnectTxidGen,
    /// Reference instant for deriving the microsecond salt used by
    /// [`ConnectTxidGen`]; arbitrary, only needs to advance monotonically.
    epoch: Instant,

    cmd_rx: mpsc::UnboundedReceiver<Command>,
    dns_tx: mpsc::UnboundedSender<DnsResult>,
    dns_rx: mpsc::UnboundedReceiver<DnsResult>,
}

/// Generates the 20-byte local peer identifier, once per process (C8).
fn generate_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

impl TrackerClient {
    /// Binds the shared UDP socket and spawns the actor task (C8
    /// bootstrap). Returns a handle for issuing commands and the task's
    /// join handle.
    pub async fn spawn(
        config: TrackerClientConfig,
        peer_sink: Arc<dyn PeerSink>,
    ) -> std::io::Result<(JoinHandle<()>, TrackerClientHandle)> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let peer_id = config.peer_id.unwrap_or_else(generate_peer_id);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (dns_tx, dns_rx) = mpsc::unbounded_channel();

        let client = TrackerClient {
            registry: Registry::new(),
            torrent_sessions: HashMap::new(),
            socket,
            peer_id,
            config,
            peer_sink,
            announce_txid_gen: AnnounceTxidGen::default(),
            connect_txid_gen: ConnectTxidGen::default(),
            epoch: Instant::now(),
            cmd_rx,
            dns_tx,
            dns_rx,
        };

        let handle = tokio::spawn(client.run());
        Ok((handle, TrackerClientHandle { cmd_tx }))
    }

    async fn run(mut self) {
        tracing::info!(peer_id = %hex::encode(self.peer_id), "tracker client started");
        let mut recv_buf = vec![0u8; 2048];

        loop {
            let wake = self.next_wake();
            let far_future = Instant::now() + Duration::from_secs(86_400);

            tokio::select! {
                _ = tokio::time::sleep_until(wake.unwrap_or(far_future)), if wake.is_some() => {
                    let now = Instant::now();
                    self.fire_due_timers(now);
                }

                recv = self.socket.recv_from(&mut recv_buf) => {
                    match recv {
                        Ok((len, from)) => {
                            let now = Instant::now();
                            self.handle_datagram(&recv_buf[..len], from, now);
                        }
                        Err(e) => tracing::warn!(error = %e, "udp recv error"),
                    }
                }

                dns = self.dns_rx.recv() => {
                    if let Some(result) = dns {
                        let now = Instant::now();
                        self.handle_dns_result(result, now);
                    }
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            tracing::info!("tracker client shutting down");
                            return;
                        }
                        Some(Command::AddTorrent { raw_url, torrent, reply }) => {
                            let now = Instant::now();
                            let result = self.handle_add_torrent(raw_url, torrent, now);
                            let _ = reply.send(result);
                        }
                        Some(Command::RemoveTorrent(info_hash)) => {
                            let now = Instant::now();
                            self.handle_remove_torrent(info_hash, now);
                        }
                        Some(Command::AnnounceAll(info_hash)) => {
                            let now = Instant::now();
                            self.handle_announce_all(info_hash, now);
                        }
                    }
                }
            }
        }
    }

    fn session_span(url: &Url) -> tracing::Span {
        tracing::info_span!("tracker_session", %url)
    }

    fn binding_span(info_hash: &InfoHash) -> tracing::Span {
        tracing::info_span!("binding", info_hash = %hex::encode(info_hash))
    }

    fn send(&self, addr: SocketAddr, bytes: &[u8]) {
        match self.socket.try_send_to(bytes, addr) {
            Ok(_) => {}
            Err(e) => tracing::warn!(%addr, error = %e, "udp send failed"),
        }
    }

    fn now_micros(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_micros() as u64
    }

    // ---- C7: add_torrent -------------------------------------------------

    fn handle_add_torrent(
        &mut self,
        raw_url: String,
        torrent: Arc<dyn TorrentStats>,
        now: Instant,
    ) -> Result<(), AddTorrentError> {
        let (url, port) = parse_udp_tracker_url(&raw_url)?;
        let info_hash = torrent.info_hash();
        let _session_span = Self::session_span(&url).entered();
        let _binding_span = Self::binding_span(&info_hash).entered();

        let (session, created) = self.registry.get_or_create(url.clone(), port);
        let generation = session.generation;
        let already_connected = session.is_connected();

        let binding = Binding::new(
            info_hash,
            Arc::downgrade(&torrent),
            self.config.default_announce_interval,
        );
        session.bindings.insert(info_hash, binding);

        self.torrent_sessions
            .entry(info_hash)
            .or_default()
            .insert(url.clone());

        if created {
            self.spawn_dns_lookup(url.clone(), generation, port);
        } else if already_connected {
            self.send_announce(&url, info_hash, AnnounceEvent::Started, now);
            if let Some(session) = self.registry.get_mut(&url) {
                if let Some(binding) = session.bindings.get_mut(&info_hash) {
                    binding.timer_deadline = Some(now + binding.interval);
                }
            }
        }

        tracing::info!(%url, info_hash = %hex::encode(info_hash), "torrent added to tracker");
        Ok(())
    }

    // ---- C7: remove_torrent ----------------------------------------------

    fn handle_remove_torrent(&mut self, info_hash: InfoHash, now: Instant) {
        let urls = self.torrent_sessions.remove(&info_hash).unwrap_or_default();
        let stop_retry_interval = self.config.stop_retry_interval;

        for url in urls {
            let connected = self
                .registry
                .get(&url)
                .map(|s| s.is_connected())
                .unwrap_or(false);

            if connected {
                self.send_announce(&url, info_hash, AnnounceEvent::Stopped, now);
                if let Some(session) = self.registry.get_mut(&url) {
                    if let Some(binding) = session.bindings.get_mut(&info_hash) {
                        binding.enter_stop_phase();
                        binding.timer_deadline = Some(now + stop_retry_interval);
                    }
                }
            } else {
                if let Some(session) = self.registry.get_mut(&url) {
                    session.bindings.remove(&info_hash);
                }
                self.registry.drop_if_empty(&url);
            }
        }

        tracing::info!(info_hash = %hex::encode(info_hash), "torrent removed");
    }

    // ---- C7: announce_all -------------------------------------------------

    fn handle_announce_all(&mut self, info_hash: InfoHash, now: Instant) {
        let urls = self
            .torrent_sessions
            .get(&info_hash)
            .cloned()
            .unwrap_or_default();

        for url in urls {
            let connected = self
                .registry
                .get(&url)
                .map(|s| s.is_connected())
                .unwrap_or(false);
            if connected {
                self.send_announce(&url, info_hash, AnnounceEvent::Started, now);
            }
        }
    }

    // ---- C8: DNS -----------------------------------------------------------

    fn spawn_dns_lookup(&self, url: Url, generation: Generation, port: u16) {
        let dns_tx = self.dns_tx.clone();
        let host = url.host_str().unwrap_or_default().to_string();
        tokio::spawn(async move {
            let target = format!("{}:{}", host, port);
            let outcome = tokio::net::lookup_host(target)
                .await
                .map_err(|e| e.to_string())
                .and_then(|mut addrs| {
                    addrs
                        .find(|a| a.is_ipv4())
                        .ok_or_else(|| "no IPv4 address found".to_string())
                });
            let _ = dns_tx.send(DnsResult {
                url,
                generation,
                outcome,
            });
        });
    }

    fn handle_dns_result(&mut self, msg: DnsResult, now: Instant) {
        let generation_matches = self
            .registry
            .get(&msg.url)
            .map(|s| s.generation == msg.generation)
            .unwrap_or(false);
        if !generation_matches {
            // Session was destroyed (or recreated) while the lookup was
            // in flight; the result no longer applies to anything live.
            return;
        }

        match msg.outcome {
            Ok(addr) => {
                tracing::debug!(url = %msg.url, %addr, "dns resolved");
                self.registry.set_addr(&msg.url, addr);
                self.send_connect(&msg.url, now);
            }
            Err(e) => {
                tracing::warn!(url = %msg.url, error = %e, "dns resolution failed");
                if let Some(session) = self.registry.get_mut(&msg.url) {
                    session.state = SessionState::Error;
                }
            }
        }
    }

    // ---- C3: connect handshake ---------------------------------------------

    fn send_connect(&mut self, url: &Url, now: Instant) {
        let _span = Self::session_span(url).entered();
        let now_micros = self.now_micros(now);
        let txid = self.connect_txid_gen.next(now_micros);
        let base = self.config.connect_timeout_base;
        let max_attempt = self.config.connect_timeout_max_attempt;

        let session = match self.registry.get_mut(url) {
            Some(s) => s,
            None => return,
        };
        let addr = match session.addr {
            Some(a) => a,
            None => return,
        };

        session.conn_txid = txid;
        session.state = SessionState::Connecting;
        let backoff = connect_backoff(session.conn_attempt, base, max_attempt);
        session.conn_timer_deadline = Some(now + backoff);
        session.conn_attempt += 1;

        tracing::debug!(%url, attempt = session.conn_attempt, txid, ?backoff, "sending connect");

        let packet = encode_connect_request(txid);
        self.send(addr, &packet);
    }

    fn handle_connect_reply(&mut self, url: &Url, txid: u32, connection_id: u64, now: Instant) {
        let _span = Self::session_span(url).entered();
        let session = match self.registry.get_mut(url) {
            Some(s) => s,
            None => return,
        };
        if txid != session.conn_txid {
            // May correspond to a previous attempt whose timer already
            // fired; silently dropped per BEP-15 transaction validation.
            return;
        }

        session.conn_attempt = 0;
        session.conn_id = connection_id;
        session.conn_timer_deadline = None;
        session.state = SessionState::Connected;
        tracing::info!(%url, "connected to tracker");

        let live_bindings: Vec<InfoHash> = session
            .bindings
            .iter()
            .filter(|(_, b)| b.is_live())
            .map(|(ih, _)| *ih)
            .collect();

        for info_hash in live_bindings {
            self.send_announce(url, info_hash, AnnounceEvent::Started, now);
            if let Some(session) = self.registry.get_mut(url) {
                if let Some(binding) = session.bindings.get_mut(&info_hash) {
                    binding.timer_deadline = Some(now + binding.interval);
                }
            }
        }
    }

    // ---- C4/C1: announce ----------------------------------------------------

    fn send_announce(&mut self, url: &Url, info_hash: InfoHash, event: AnnounceEvent, now: Instant) {
        let _session_span = Self::session_span(url).entered();
        let _binding_span = Self::binding_span(&info_hash).entered();
        let _ = now;
        let txid = self.announce_txid_gen.next();
        let peer_id = self.peer_id;
        let port = self.config.announce_port;

        let session = match self.registry.get_mut(url) {
            Some(s) => s,
            None => return,
        };
        let addr = match session.addr {
            Some(a) => a,
            None => return,
        };
        let connection_id = session.conn_id;
        let binding = match session.bindings.get_mut(&info_hash) {
            Some(b) => b,
            None => return,
        };
        binding.txid = txid;
        let (downloaded, left, uploaded) = binding
            .torrent
            .upgrade()
            .map(|t| (t.downloaded_bytes(), t.remaining_bytes(), t.uploaded_bytes()))
            .unwrap_or((0, 0, 0));

        tracing::trace!(%url, info_hash = %hex::encode(info_hash), ?event, txid, "sending announce");

        let req = AnnounceRequest {
            connection_id,
            transaction_id: txid,
            info_hash,
            peer_id,
            downloaded,
            left,
            uploaded,
            event,
            port,
        };
        let packet = encode_announce_request(&req);
        self.send(addr, &packet);
    }

    fn handle_announce_reply(
        &mut self,
        url: &Url,
        txid: u32,
        interval: u32,
        leechers: u32,
        seeders: u32,
        peers: Vec<(std::net::Ipv4Addr, u16)>,
        now: Instant,
    ) {
        let _span = Self::session_span(url).entered();
        let session = match self.registry.get_mut(url) {
            Some(s) => s,
            None => return,
        };
        let info_hash = match session.bindings.iter().find(|(_, b)| b.txid == txid) {
            Some((ih, _)) => *ih,
            None => {
                tracing::debug!(%url, txid, "announce reply for unknown transaction, dropping");
                return;
            }
        };

        let binding = session.bindings.get_mut(&info_hash).unwrap();
        binding.interval = Duration::from_secs(interval as u64);
        binding.leechers = leechers;
        binding.seeders = seeders;
        let is_stop = !binding.is_live();

        if is_stop {
            // The stop has been acknowledged; the binding's job is done.
            session.bindings.remove(&info_hash);
            if let Some(set) = self.torrent_sessions.get_mut(&info_hash) {
                set.remove(url);
            }
            self.registry.drop_if_empty(url);
            return;
        }

        binding.timer_deadline = Some(now + binding.interval);

        tracing::debug!(
            %url,
            info_hash = %hex::encode(info_hash),
            leechers,
            seeders,
            interval,
            "announce reply"
        );

        for (ip, port) in peers {
            if port != 0 {
                self.peer_sink
                    .peer_add(info_hash, SocketAddrV4::new(ip, port));
            }
        }
    }

    // ---- §4.6: error reply -------------------------------------------------

    fn handle_error_reply(&mut self, url: &Url, txid: u32, message: String, now: Instant) {
        let _span = Self::session_span(url).entered();
        let session = match self.registry.get_mut(url) {
            Some(s) => s,
            None => return,
        };
        let info_hash = match session.bindings.iter().find(|(_, b)| b.txid == txid) {
            Some((ih, _)) => *ih,
            None => return,
        };

        let binding = session.bindings.get_mut(&info_hash).unwrap();
        if !binding.is_live() {
            session.bindings.remove(&info_hash);
            if let Some(set) = self.torrent_sessions.get_mut(&info_hash) {
                set.remove(url);
            }
            self.registry.drop_if_empty(url);
            return;
        }

        tracing::warn!(%url, %message, "tracker error reply, reconnecting");
        if let Some(session) = self.registry.get_mut(url) {
            session.conn_attempt = 0;
        }
        self.send_connect(url, now);
    }

    // ---- C6: receive demultiplex --------------------------------------------

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr, now: Instant) {
        let url = match self.registry.find_by_addr(&from) {
            Some(u) => u.clone(),
            None => return,
        };
        let action = match read_action(data) {
            Some(a) => a,
            None => return,
        };

        match action {
            ACTION_CONNECT => {
                if let Some(resp) = decode_connect_response(data) {
                    self.handle_connect_reply(&url, resp.transaction_id, resp.connection_id, now);
                }
            }
            ACTION_ANNOUNCE => {
                if let Some(resp) = decode_announce_response(data) {
                    self.handle_announce_reply(
                        &url,
                        resp.transaction_id,
                        resp.interval,
                        resp.leechers,
                        resp.seeders,
                        resp.peers,
                        now,
                    );
                }
            }
            ACTION_ERROR | ACTION_ERROR_SWAPPED => {
                if let Some(resp) = decode_error_response(data) {
                    self.handle_error_reply(&url, resp.transaction_id, resp.message, now);
                }
            }
            _ => {}
        }
    }

    // ---- timer wheel ---------------------------------------------------------

    fn next_wake(&self) -> Option<Instant> {
        let mut min: Option<Instant> = None;
        for session in self.registry.sessions() {
            if let Some(d) = session.conn_timer_deadline {
                min = Some(min.map_or(d, |m| m.min(d)));
            }
            for binding in session.bindings.values() {
                if let Some(d) = binding.timer_deadline {
                    min = Some(min.map_or(d, |m| m.min(d)));
                }
            }
        }
        min
    }

    fn fire_due_timers(&mut self, now: Instant) {
        let mut due_connects = Vec::new();
        let mut due_bindings = Vec::new();

        for url in self.registry.urls() {
            if let Some(session) = self.registry.get(&url) {
                if matches!(session.conn_timer_deadline, Some(d) if d <= now) {
                    due_connects.push(url.clone());
                }
                for (info_hash, binding) in session.bindings.iter() {
                    if matches!(binding.timer_deadline, Some(d) if d <= now) {
                        due_bindings.push((url.clone(), *info_hash));
                    }
                }
            }
        }

        for url in due_connects {
            self.send_connect(&url, now);
        }
        for (url, info_hash) in due_bindings {
            self.fire_binding_timer(&url, info_hash, now);
        }
    }

    fn fire_binding_timer(&mut self, url: &Url, info_hash: InfoHash, now: Instant) {
        let phase = match self
            .registry
            .get(url)
            .and_then(|s| s.bindings.get(&info_hash))
        {
            Some(b) => b.phase,
            None => return,
        };

        match phase {
            BindingPhase::Live => {
                self.send_announce(url, info_hash, AnnounceEvent::Started, now);
                if let Some(session) = self.registry.get_mut(url) {
                    if let Some(binding) = session.bindings.get_mut(&info_hash) {
                        binding.timer_deadline = Some(now + binding.interval);
                    }
                }
            }
            BindingPhase::Stop { attempt } => {
                let next_attempt = attempt + 1;
                if next_attempt >= self.config.stop_retry_max_attempts {
                    if let Some(session) = self.registry.get_mut(url) {
                        session.bindings.remove(&info_hash);
                    }
                    if let Some(set) = self.torrent_sessions.get_mut(&info_hash) {
                        set.remove(url);
                    }
                    self.registry.drop_if_empty(url);
                } else {
                    self.send_announce(url, info_hash, AnnounceEvent::Stopped, now);
                    let stop_retry_interval = self.config.stop_retry_interval;
                    if let Some(session) = self.registry.get_mut(url) {
                        if let Some(binding) = session.bindings.get_mut(&info_hash) {
                            binding.phase = BindingPhase::Stop {
                                attempt: next_attempt,
                            };
                            binding.timer_deadline = Some(now + stop_retry_interval);
                        }
                    }
                }
            }
        }
    }
}

/// Starts a tracker client actor, returning a handle used to register
/// torrents and the task's [`JoinHandle`] for orderly shutdown.
pub async fn spawn(
    config: TrackerClientConfig,
    peer_sink: Arc<dyn PeerSink>,
) -> std::io::Result<(JoinHandle<()>, TrackerClientHandle)> {
    TrackerClient::spawn(config, peer_sink).await
}

//! Scenario tests driving the client against a scripted fake tracker on a
//! real loopback socket, with the Tokio clock paused so retry/backoff
//! timing can be advanced deterministically instead of slept through.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use tracker_client::{DiscoveredPeer, PeerSink, TorrentStats, TrackerClientConfig, TrackerClientHandle};

const TORRENT_HASH: [u8; 20] = [0u8; 20];
const PEER_ID: [u8; 20] = [0x11u8; 20];
const CONNECTION_ID: u64 = 0xDEAD_BEEF_CAFE_BABE;

struct FakeTorrent {
    info_hash: [u8; 20],
}

impl TorrentStats for FakeTorrent {
    fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    fn title(&self) -> String {
        "fixture".to_string()
    }

    fn downloaded_bytes(&self) -> u64 {
        100
    }

    fn remaining_bytes(&self) -> u64 {
        900
    }

    fn uploaded_bytes(&self) -> u64 {
        0
    }
}

fn encode_connect_reply(txid: u32) -> Vec<u8> {
    let mut reply = Vec::with_capacity(16);
    reply.extend_from_slice(&0u32.to_be_bytes());
    reply.extend_from_slice(&txid.to_be_bytes());
    reply.extend_from_slice(&CONNECTION_ID.to_be_bytes());
    reply
}

fn read_txid(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf[12..16].try_into().unwrap())
}

/// Binds the fake tracker, spawns a client with one torrent registered
/// against it, drives the connect handshake to completion, and returns
/// everything a scenario needs to script the rest of the exchange.
async fn connected_fixture() -> (
    UdpSocket,
    SocketAddr,
    TrackerClientHandle,
    mpsc::UnboundedReceiver<DiscoveredPeer>,
    [u8; 1024],
) {
    let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tracker_url = format!("udp://127.0.0.1:{}/announce", fake.local_addr().unwrap().port());

    let (peer_tx, peer_rx) = mpsc::unbounded_channel::<DiscoveredPeer>();
    let peer_sink: Arc<dyn PeerSink> = Arc::new(peer_tx);

    let mut config = TrackerClientConfig::default();
    config.peer_id = Some(PEER_ID);

    let (_join, handle) = tracker_client::spawn(config, peer_sink).await.unwrap();

    let torrent: Arc<dyn TorrentStats> = Arc::new(FakeTorrent {
        info_hash: TORRENT_HASH,
    });
    handle.add_torrent(&tracker_url, torrent).await.unwrap();

    let mut buf = [0u8; 1024];
    let (len, client_addr) = fake.recv_from(&mut buf).await.unwrap();
    assert_eq!(len, 16, "expected a connect request");
    let txid = read_txid(&buf);

    fake.send_to(&encode_connect_reply(txid), client_addr)
        .await
        .unwrap();

    (fake, client_addr, handle, peer_rx, buf)
}

#[tokio::test(start_paused = true)]
async fn s1_happy_path_sends_well_formed_announce() {
    let (fake, _client_addr, _handle, _peer_rx, mut buf) = connected_fixture().await;

    let (len, _) = fake.recv_from(&mut buf).await.unwrap();
    assert_eq!(len, 98);
    assert_eq!(&buf[0..8], &CONNECTION_ID.to_be_bytes());
    assert_eq!(&buf[8..12], &1u32.to_be_bytes());
    assert_eq!(&buf[16..36], &TORRENT_HASH);
    assert_eq!(&buf[36..56], &PEER_ID);
    assert_eq!(&buf[80..84], &2u32.to_be_bytes());
    assert_eq!(&buf[92..96], &0xFFFF_FFFFu32.to_be_bytes());
    assert_eq!(&buf[96..98], &43213u16.to_be_bytes());
}

#[tokio::test(start_paused = true)]
async fn s2_connect_retry_backs_off_and_rearms() {
    let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tracker_url = format!("udp://127.0.0.1:{}/announce", fake.local_addr().unwrap().port());

    let (peer_tx, _peer_rx) = mpsc::unbounded_channel::<DiscoveredPeer>();
    let peer_sink: Arc<dyn PeerSink> = Arc::new(peer_tx);
    let config = TrackerClientConfig::default();
    let (_join, handle) = tracker_client::spawn(config, peer_sink).await.unwrap();

    let torrent: Arc<dyn TorrentStats> = Arc::new(FakeTorrent {
        info_hash: TORRENT_HASH,
    });
    handle.add_torrent(&tracker_url, torrent).await.unwrap();

    let mut buf = [0u8; 1024];
    let (len1, from1) = fake.recv_from(&mut buf).await.unwrap();
    assert_eq!(len1, 16);
    let txid1 = read_txid(&buf);

    tokio::time::advance(Duration::from_secs(15)).await;
    let (len2, from2) = fake.recv_from(&mut buf).await.unwrap();
    assert_eq!(len2, 16);
    let txid2 = read_txid(&buf);
    assert_ne!(txid1, txid2);
    assert_eq!(from1, from2);

    tokio::time::advance(Duration::from_secs(30)).await;
    let (len3, _) = fake.recv_from(&mut buf).await.unwrap();
    assert_eq!(len3, 16);
    let txid3 = read_txid(&buf);
    assert_ne!(txid3, txid2);
}

#[tokio::test(start_paused = true)]
async fn s3_error_reply_triggers_reconnect_before_reannouncing() {
    let (fake, client_addr, _handle, _peer_rx, mut buf) = connected_fixture().await;

    let (len, _) = fake.recv_from(&mut buf).await.unwrap();
    assert_eq!(len, 98, "expected the post-connect announce");
    let announce_txid = u32::from_be_bytes(buf[12..16].try_into().unwrap());

    let mut err = Vec::new();
    err.extend_from_slice(&3u32.to_be_bytes());
    err.extend_from_slice(&announce_txid.to_be_bytes());
    err.extend_from_slice(b"rate limited");
    fake.send_to(&err, client_addr).await.unwrap();

    tokio::time::advance(Duration::from_millis(1)).await;
    let (len, _) = fake.recv_from(&mut buf).await.unwrap();
    assert_eq!(len, 16, "expected a fresh connect request, not an announce");
}

#[tokio::test(start_paused = true)]
async fn s4_peer_delivery_skips_zero_port_entries() {
    let (fake, client_addr, _handle, mut peer_rx, mut buf) = connected_fixture().await;

    let (len, _) = fake.recv_from(&mut buf).await.unwrap();
    assert_eq!(len, 98);
    let announce_txid = u32::from_be_bytes(buf[12..16].try_into().unwrap());

    let mut resp = Vec::new();
    resp.extend_from_slice(&1u32.to_be_bytes());
    resp.extend_from_slice(&announce_txid.to_be_bytes());
    resp.extend_from_slice(&1800u32.to_be_bytes());
    resp.extend_from_slice(&5u32.to_be_bytes());
    resp.extend_from_slice(&10u32.to_be_bytes());
    resp.extend_from_slice(&Ipv4Addr::new(1, 2, 3, 4).octets());
    resp.extend_from_slice(&6881u16.to_be_bytes());
    resp.extend_from_slice(&Ipv4Addr::new(5, 6, 7, 8).octets());
    resp.extend_from_slice(&0u16.to_be_bytes());
    resp.extend_from_slice(&Ipv4Addr::new(9, 10, 11, 12).octets());
    resp.extend_from_slice(&51413u16.to_be_bytes());
    fake.send_to(&resp, client_addr).await.unwrap();

    let first = peer_rx.recv().await.unwrap();
    assert_eq!(
        first.addr,
        SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6881)
    );
    let second = peer_rx.recv().await.unwrap();
    assert_eq!(
        second.addr,
        SocketAddrV4::new(Ipv4Addr::new(9, 10, 11, 12), 51413)
    );
}

#[tokio::test(start_paused = true)]
async fn s5_graceful_removal_retries_stop_five_times_then_gives_up() {
    let (fake, _client_addr, handle, _peer_rx, mut buf) = connected_fixture().await;

    // Drain the post-connect started announce before removing.
    let (len, _) = fake.recv_from(&mut buf).await.unwrap();
    assert_eq!(len, 98);

    handle.remove_torrent(TORRENT_HASH);

    let (len, _) = fake.recv_from(&mut buf).await.unwrap();
    assert_eq!(len, 98);
    assert_eq!(&buf[80..84], &3u32.to_be_bytes(), "expected event=stopped");

    for _ in 0..4 {
        tokio::time::advance(Duration::from_secs(5)).await;
        let (len, _) = fake.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 98);
        assert_eq!(&buf[80..84], &3u32.to_be_bytes());
    }

    tokio::time::advance(Duration::from_secs(5)).await;
    match fake.try_recv_from(&mut buf) {
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        other => panic!("expected no further stop announces, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn connect_reply_with_wrong_txid_is_silently_dropped() {
    let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tracker_url = format!("udp://127.0.0.1:{}/announce", fake.local_addr().unwrap().port());

    let (peer_tx, _peer_rx) = mpsc::unbounded_channel::<DiscoveredPeer>();
    let peer_sink: Arc<dyn PeerSink> = Arc::new(peer_tx);
    let config = TrackerClientConfig::default();
    let (_join, handle) = tracker_client::spawn(config, peer_sink).await.unwrap();

    let torrent: Arc<dyn TorrentStats> = Arc::new(FakeTorrent {
        info_hash: TORRENT_HASH,
    });
    handle.add_torrent(&tracker_url, torrent).await.unwrap();

    let mut buf = [0u8; 1024];
    let (len, client_addr) = fake.recv_from(&mut buf).await.unwrap();
    assert_eq!(len, 16, "expected a connect request");
    let real_txid = read_txid(&buf);

    // Reply with a transaction id that doesn't match the in-flight request;
    // per the spec this must be dropped without touching session state.
    fake.send_to(&encode_connect_reply(real_txid.wrapping_add(1)), client_addr)
        .await
        .unwrap();

    // Give the actor a beat to process the bogus reply, then advance past
    // the first connect-retry deadline: if the mismatched reply had been
    // accepted, no retry (and certainly no announce) would be pending.
    tokio::time::advance(Duration::from_millis(1)).await;
    tokio::time::advance(Duration::from_secs(15)).await;
    let (len, _) = fake.recv_from(&mut buf).await.unwrap();
    assert_eq!(len, 16, "expected a retried connect request, session never connected");
    let retry_txid = read_txid(&buf);
    assert_ne!(retry_txid, real_txid);

    // Now reply with the correct (current) txid and confirm the handshake
    // completes normally from here.
    fake.send_to(&encode_connect_reply(retry_txid), client_addr)
        .await
        .unwrap();
    let (len, _) = fake.recv_from(&mut buf).await.unwrap();
    assert_eq!(len, 98, "expected the post-connect announce");
}

#[tokio::test(start_paused = true)]
async fn announce_all_is_idempotent_per_call() {
    let (fake, _client_addr, handle, _peer_rx, mut buf) = connected_fixture().await;

    // Drain the post-connect started announce.
    let (len, _) = fake.recv_from(&mut buf).await.unwrap();
    assert_eq!(len, 98);

    // Three explicit refresh calls must yield exactly three datagrams,
    // each a well-formed 98-byte announce with event=started, and must not
    // disturb the periodic timer (no implicit extra sends).
    for _ in 0..3 {
        handle.announce_all(TORRENT_HASH);
        let (len, _) = fake.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 98);
        assert_eq!(&buf[80..84], &2u32.to_be_bytes());
    }

    match fake.try_recv_from(&mut buf) {
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        other => panic!("expected exactly three announces, got extra: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn s6_swapped_error_opcode_triggers_reconnect() {
    let (fake, client_addr, _handle, _peer_rx, mut buf) = connected_fixture().await;

    let (len, _) = fake.recv_from(&mut buf).await.unwrap();
    assert_eq!(len, 98);
    let announce_txid = u32::from_be_bytes(buf[12..16].try_into().unwrap());

    let mut err = vec![0x03, 0x00, 0x00, 0x00];
    err.extend_from_slice(&announce_txid.to_be_bytes());
    err.extend_from_slice(b"bad torrent");
    fake.send_to(&err, client_addr).await.unwrap();

    tokio::time::advance(Duration::from_millis(1)).await;
    let (len, _) = fake.recv_from(&mut buf).await.unwrap();
    assert_eq!(len, 16);
}

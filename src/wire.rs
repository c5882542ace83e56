//! Wire codec for the BEP-15 UDP tracker protocol.
//!
//! All integers are big-endian. Four message shapes are handled: connect
//! request/response, announce request/response, and error response.

use bytes::{Buf, BufMut, BytesMut};
use std::net::Ipv4Addr;

use crate::{InfoHash, PeerId};

/// `0x41727101980`, fixed by BEP-15.
pub const PROTOCOL_ID: u64 = 0x0000_0417_2710_1980;

pub const ACTION_CONNECT: u32 = 0;
pub const ACTION_ANNOUNCE: u32 = 1;
pub const ACTION_ERROR: u32 = 3;
/// Some trackers in the wild forget to `htonl()` the error action; the
/// bytes then read as this value instead of 3.
pub const ACTION_ERROR_SWAPPED: u32 = 0x0300_0000;

pub const CONNECT_REQUEST_LEN: usize = 16;
pub const CONNECT_RESPONSE_MIN_LEN: usize = 16;
pub const ANNOUNCE_REQUEST_LEN: usize = 98;
pub const ANNOUNCE_RESPONSE_MIN_LEN: usize = 20;
pub const ERROR_RESPONSE_MIN_LEN: usize = 8;

/// Announce `event` field. The wire value doubles as the discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None = 0,
    Completed = 1,
    Started = 2,
    Stopped = 3,
}

impl AnnounceEvent {
    fn as_u32(self) -> u32 {
        self as u32
    }
}

pub fn encode_connect_request(transaction_id: u32) -> [u8; CONNECT_REQUEST_LEN] {
    let mut buf = [0u8; CONNECT_REQUEST_LEN];
    buf[0..8].copy_from_slice(&PROTOCOL_ID.to_be_bytes());
    buf[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
    buf[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    pub transaction_id: u32,
    pub connection_id: u64,
}

pub fn decode_connect_response(data: &[u8]) -> Option<ConnectResponse> {
    if data.len() < CONNECT_RESPONSE_MIN_LEN {
        return None;
    }
    let mut buf = data;
    let action = buf.get_u32();
    if action != ACTION_CONNECT {
        return None;
    }
    let transaction_id = buf.get_u32();
    let connection_id = buf.get_u64();
    Some(ConnectResponse {
        transaction_id,
        connection_id,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct AnnounceRequest {
    pub connection_id: u64,
    pub transaction_id: u32,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: AnnounceEvent,
    pub port: u16,
}

pub fn encode_announce_request(req: &AnnounceRequest) -> BytesMut {
    let mut buf = BytesMut::with_capacity(ANNOUNCE_REQUEST_LEN);
    buf.put_u64(req.connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(req.transaction_id);
    buf.put_slice(&req.info_hash);
    buf.put_slice(&req.peer_id);
    buf.put_u64(req.downloaded);
    buf.put_u64(req.left);
    buf.put_u64(req.uploaded);
    buf.put_u32(req.event.as_u32());
    buf.put_u32(0); // ip address, always 0 (let the tracker use the source address)
    buf.put_u32(0xFFFF_FFFF); // key, unused by this client
    buf.put_i32(-1); // num_want, always request the default count
    buf.put_u16(req.port);
    debug_assert_eq!(buf.len(), ANNOUNCE_REQUEST_LEN);
    buf
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub transaction_id: u32,
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<(Ipv4Addr, u16)>,
}

pub fn decode_announce_response(data: &[u8]) -> Option<AnnounceResponse> {
    if data.len() < ANNOUNCE_RESPONSE_MIN_LEN {
        return None;
    }
    let mut buf = data;
    let action = buf.get_u32();
    if action != ACTION_ANNOUNCE {
        return None;
    }
    let transaction_id = buf.get_u32();
    let interval = buf.get_u32();
    let leechers = buf.get_u32();
    let seeders = buf.get_u32();

    let mut peers = Vec::with_capacity(buf.len() / 6);
    while buf.remaining() >= 6 {
        let ip = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16();
        peers.push((ip, port));
    }

    Some(AnnounceResponse {
        transaction_id,
        interval,
        leechers,
        seeders,
        peers,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub transaction_id: u32,
    pub message: String,
}

pub fn decode_error_response(data: &[u8]) -> Option<ErrorResponse> {
    if data.len() < ERROR_RESPONSE_MIN_LEN {
        return None;
    }
    let mut buf = data;
    let action = buf.get_u32();
    if action != ACTION_ERROR && action != ACTION_ERROR_SWAPPED {
        return None;
    }
    let transaction_id = buf.get_u32();
    let message = String::from_utf8_lossy(buf.chunk()).into_owned();
    Some(ErrorResponse {
        transaction_id,
        message,
    })
}

/// Reads the 4-byte big-endian action opcode that every reply starts with.
/// Returns `None` if the datagram is too short to contain one.
pub fn read_action(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

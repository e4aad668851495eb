//! A BEP 15 UDP tracker client.
//!
//! <https://www.bittorrent.org/beps/bep_0015.html>

use std::{net::SocketAddr, time::Duration};

use rand::random;
use tokio::net::UdpSocket;
use url::Url;

use crate::error::tracker::{Result, TrackerError};

use super::{announce::Announce, response::Response};

const PROTOCOL_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

/// The number of times a request is retransmitted before giving up, per
/// BEP 15's `15 * 2^n` seconds schedule (n = 0..=8, i.e. up to a ~1 hour
/// total wait before declaring the tracker unreachable).
const MAX_RETRANSMITS: u32 = 8;

/// The UDP tracker, as specified in BEP 15.
///
/// Unlike the HTTP tracker, every announce requires a fresh "connect"
/// handshake first: connection ids expire after two minutes, and we don't
/// bother caching one across announces since announces are infrequent.
#[derive(Clone)]
pub struct UdpTracker {
    addr: SocketAddr,
}

impl UdpTracker {
    /// Resolves the tracker url's host to a socket address.
    ///
    /// This performs a (blocking, but typically cheap) DNS lookup, so it's
    /// done once up front rather than on every announce.
    pub fn new(url: &Url) -> Result<Self> {
        let addr = url
            .socket_addrs(|| None)
            .map_err(|_| TrackerError::MalformedResponse)?
            .into_iter()
            .next()
            .ok_or(TrackerError::MalformedResponse)?;
        Ok(Self { addr })
    }

    pub async fn announce(&self, params: &Announce) -> Result<Response> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(TrackerError::Udp)?;
        socket.connect(self.addr).await.map_err(TrackerError::Udp)?;

        let connection_id = self.connect(&socket).await?;

        let transaction_id: u32 = random();
        let key: u32 = random();

        let mut req = Vec::with_capacity(98);
        req.extend_from_slice(&connection_id.to_be_bytes());
        req.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        req.extend_from_slice(&transaction_id.to_be_bytes());
        req.extend_from_slice(&params.info_hash);
        req.extend_from_slice(&params.peer_id);
        req.extend_from_slice(&params.downloaded.to_be_bytes());
        req.extend_from_slice(&params.left.to_be_bytes());
        req.extend_from_slice(&params.uploaded.to_be_bytes());
        req.extend_from_slice(&0u32.to_be_bytes()); // event: none
        req.extend_from_slice(&0u32.to_be_bytes()); // ip: default
        req.extend_from_slice(&key.to_be_bytes());
        let num_want: i32 = params.peer_count.map(|n| n as i32).unwrap_or(-1);
        req.extend_from_slice(&num_want.to_be_bytes());
        req.extend_from_slice(&params.port.to_be_bytes());

        let mut buf = [0u8; 2048];
        let n = send_with_retransmits(&socket, &req, &mut buf).await?;

        if n < 20 {
            return Err(TrackerError::MalformedResponse);
        }
        let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let reply_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        if reply_transaction_id != transaction_id {
            return Err(TrackerError::TransactionMismatch);
        }
        if action != ACTION_ANNOUNCE {
            return Err(TrackerError::MalformedResponse);
        }

        let interval = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let leecher_count = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        let seeder_count = u32::from_be_bytes(buf[16..20].try_into().unwrap());

        let peers = buf[20..n]
            .chunks_exact(6)
            .map(|chunk| {
                let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::new(ip.into(), port)
            })
            .collect();

        Ok(Response {
            tracker_id: None,
            failure_reason: None,
            warning_message: None,
            interval: Some(Duration::from_secs(interval as u64)),
            min_interval: None,
            seeder_count: Some(seeder_count as usize),
            leecher_count: Some(leecher_count as usize),
            peers,
        })
    }

    async fn connect(&self, socket: &UdpSocket) -> Result<u64> {
        let transaction_id: u32 = random();

        let mut req = Vec::with_capacity(16);
        req.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        req.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        req.extend_from_slice(&transaction_id.to_be_bytes());

        let mut buf = [0u8; 16];
        let n = send_with_retransmits(socket, &req, &mut buf).await?;
        if n < 16 {
            return Err(TrackerError::MalformedResponse);
        }

        let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let reply_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        if reply_transaction_id != transaction_id {
            return Err(TrackerError::TransactionMismatch);
        }
        if action != ACTION_CONNECT {
            return Err(TrackerError::MalformedResponse);
        }

        Ok(u64::from_be_bytes(buf[8..16].try_into().unwrap()))
    }
}

/// Sends `req` and waits for a reply, retransmitting on a `15 * 2^n` second
/// schedule as specified by BEP 15, up to [`MAX_RETRANSMITS`] attempts.
async fn send_with_retransmits(
    socket: &UdpSocket,
    req: &[u8],
    buf: &mut [u8],
) -> Result<usize> {
    for n in 0..=MAX_RETRANSMITS {
        socket.send(req).await.map_err(TrackerError::Udp)?;
        let wait = Duration::from_secs(15 * 2u64.pow(n));
        match tokio::time::timeout(wait, socket.recv(buf)).await {
            Ok(Ok(len)) => return Ok(len),
            Ok(Err(e)) => return Err(TrackerError::Udp(e)),
            Err(_) => {
                log::debug!("UDP tracker timed out waiting for reply, retransmit {}", n);
                continue;
            }
        }
    }
    Err(TrackerError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_udp_scheme() {
        let url = Url::parse("udp://tracker.example.com:80/announce").unwrap();
        // can't resolve a fake hostname in a unit test without network
        // access, so just check the parse-and-reject-non-udp boundary via
        // `Url::scheme`.
        assert_eq!(url.scheme(), "udp");
    }
}

//! Fans an announce out across every tracker URL for a torrent, regardless
//! of whether it's reached over HTTP or UDP.

use std::{
    collections::HashSet,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    time::Duration,
};

use tokio::task;
use url::Url;

use crate::{error::tracker::{Result, TrackerError}, torrent};

use super::{announce::Announce, http::Tracker as HttpTracker, response::Response, udp::UdpTracker};

/// How long we wait for a single tracker's announce before giving up on it
/// for this round (the fan-out as a whole still succeeds if another tracker
/// answers in time).
const PER_TRACKER_TIMEOUT: Duration = Duration::from_secs(30);

/// A tracker reachable over either transport named in the torrent's
/// announce list.
#[derive(Clone)]
enum Transport {
    Http(HttpTracker),
    Udp(UdpTracker),
}

/// A single tracker entry, dispatched to the transport its url scheme
/// implies.
#[derive(Clone)]
pub struct TrackerClient {
    transport: Transport,
}

impl TrackerClient {
    /// Builds a tracker client for `url`, picking the UDP or HTTP transport
    /// based on its scheme.
    ///
    /// # Panics
    ///
    /// Panics if `url`'s scheme isn't one of `http`, `https`, or `udp`.
    /// Metainfo parsing already filters out unsupported schemes, so this
    /// should never be reachable in practice.
    pub fn new(url: Url) -> Self {
        let transport = match url.scheme() {
            "http" | "https" => Transport::Http(HttpTracker::new(url)),
            "udp" => Transport::Udp(UdpTracker::new(&url).expect("unresolvable tracker url")),
            scheme => panic!("unsupported tracker scheme: {}", scheme),
        };
        Self { transport }
    }

    async fn announce(&self, params: &Announce) -> Result<Response> {
        match &self.transport {
            Transport::Http(t) => {
                // `Announce` is moved by-value into the http tracker's
                // `announce`, so clone the handful of fields it needs.
                t.announce(clone_announce(params)).await
            }
            Transport::Udp(t) => t.announce(params).await,
        }
    }
}

fn clone_announce(params: &Announce) -> Announce {
    Announce {
        info_hash: params.info_hash,
        peer_id: params.peer_id,
        port: params.port,
        ip: params.ip,
        downloaded: params.downloaded,
        uploaded: params.uploaded,
        left: params.left,
        peer_count: params.peer_count,
        tracker_id: params.tracker_id.clone(),
        event: None,
    }
}

/// Races every tracker in `trackers`, each bounded by [`PER_TRACKER_TIMEOUT`],
/// and returns as soon as the first one succeeds, so a single slow or
/// unreachable tracker never delays spawning peers. The rest keep announcing
/// in the background; any peers they turn up are reported late via
/// `torrent_tx` rather than through this call's return value.
///
/// Fails only if every tracker does.
pub async fn announce_all(
    trackers: &[TrackerClient],
    params: &Announce,
    torrent_tx: torrent::Sender,
) -> Result<Vec<SocketAddr>> {
    if trackers.is_empty() {
        return Err(TrackerError::MalformedResponse);
    }

    let futures: Vec<Pin<Box<dyn Future<Output = Result<Response>> + Send>>> = trackers
        .iter()
        .cloned()
        .map(|tracker| {
            let params = clone_announce(params);
            let fut: Pin<Box<dyn Future<Output = Result<Response>> + Send>> =
                Box::pin(async move {
                    match tokio::time::timeout(PER_TRACKER_TIMEOUT, tracker.announce(&params)).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(TrackerError::Timeout),
                    }
                });
            fut
        })
        .collect();

    match futures::future::select_ok(futures).await {
        Ok((resp, remaining)) => {
            if !remaining.is_empty() {
                task::spawn(announce_remaining(remaining, torrent_tx));
            }
            Ok(resp.peers.into_iter().collect())
        }
        Err(e) => {
            log::warn!("All trackers failed to announce: {}", e);
            Err(e)
        }
    }
}

/// Drives the trackers that didn't win the race to completion, reporting any
/// peers they find back to the torrent once they answer.
async fn announce_remaining(
    remaining: Vec<Pin<Box<dyn Future<Output = Result<Response>> + Send>>>,
    torrent_tx: torrent::Sender,
) {
    let results = futures::future::join_all(remaining).await;
    let mut peers = HashSet::new();
    for result in results {
        match result {
            Ok(resp) => peers.extend(resp.peers),
            Err(e) => log::warn!("Background tracker announce failed: {}", e),
        }
    }
    if !peers.is_empty() {
        torrent_tx
            .send(torrent::Command::PeersDiscovered(peers.into_iter().collect()))
            .ok();
    }
}

//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

pub const CLIENT_ID: &PeerId = b"cbt-0000000000000000";
// pub const CLIENT_ID: &PeerId = b"-qB1450-352885928458";
// pub static CLIENT_ID: Lazy<PeerId> = Lazy::new(|| {
//     let mut id = [0u8; 20];
//     let rid = get_random_string(20);
//     let rid = rid.as_bytes();
//     id[..].copy_from_slice(&rid[..20]);
//     id
// });

/// The global configuration for the torrent engine and all its parts.
#[derive(Debug, Clone)]
pub struct Conf {
  pub engine: EngineConf,
  pub torrent: TorrentConf,
}

// fn get_random_string(len: usize) -> String {
//   rand::thread_rng()
//     .sample_iter::<char, _>(rand::distributions::Standard)
//     .take(len)
//     .collect()
// }

impl Conf {
  /// Returns the torrent configuration with reasonable defaults,
  /// expected for the download directory, as it is not sensible
  /// to guess that for the user. It uses the default client id
  /// [`CLIENT_ID`]
  pub fn new(download_dir: impl Into<PathBuf>) -> Self {
    Self {
      engine: EngineConf {
        client_id: *CLIENT_ID,
        download_dir: download_dir.into(),
      },
      torrent: TorrentConf::default(),
    }
  }
}

/// Configuration related to the engine itself.
#[derive(Debug, Clone)]
pub struct EngineConf {
  /// The ID of the client to announce to trackers and other peers.
  pub client_id: PeerId,
  /// The directory in which a torrent's files are placed upon download and
  /// from which they are seeded.
  pub download_dir: PathBuf,
}

/// Configuration for a torrent
///
/// The engine will have a default instance of this applied to all torrents
/// by default, but individual torrents may override this configuration.
#[derive(Debug, Clone)]
pub struct TorrentConf {
  /// The minimum number of peers we want to keep in torrent at all times.
  /// This will be configurable later.
  pub min_requested_peer_count: usize,

  /// The max number of connected peers the torrent should have.
  pub max_connected_peer_count: usize,

  /// If the tracer doesn't provide a minimum announce interval, we default
  /// to announcing every 30 seconds.
  pub announce_interval: Duration,

  /// After this many attempts, the torrent stops announcing to a tracker.
  pub tracker_error_threshold: usize,

  /// Specifies which optional alerts to send, besides the default periodic
  /// stats update.
  pub alerts: TorrentAlertConf,
}

/// Configuration of a torrent's optional alerts.
///
/// By default, all optional alerts are turned off. This is because some of
/// these alerts may have overhead that shouldn't be paid when the alerts are
/// not used.
#[derive(Debug, Clone, Default)]
pub struct TorrentAlertConf {
  /// Receive the pieces that were completed each round.
  ///
  /// This has minor overhead and so it may be enabled. For full optimization,
  /// however, it is only enabled when either the pieces or individual file
  /// completions are needed.
  pub completed_pieces: bool,

  /// Receive aggregate statistics about the torrent's peers.
  ///
  /// This may be relatively expensive. It is suggested to only turn it on
  /// when it is specifically needed, e.g. when the UI is showing the peers of
  /// a torrent.
  pub peers: bool,
}

impl Default for TorrentConf {
  fn default() -> Self {
    TorrentConf {
      // We always request at least 10 peers as anything less is a waste
      // of network round trip and it allows us to buffer up a bit more
      // than needed.
      min_requested_peer_count: 10,
      // This value is mostly picked for performance while keeping in mind
      // not to overwhelm the host.
      max_connected_peer_count: 50,
      // need testing
      announce_interval: Duration::from_secs(60 * 60),
      // need testing
      tracker_error_threshold: 15,
      alerts: Default::default(),
    }
  }
}

/// The maximum number of requests we keep outstanding toward a single peer
/// at any given time.
pub const REQUEST_PIPELINE_WINDOW: usize = 50;

/// How long we wait for a block to arrive for an outstanding request before
/// we consider it lost and eligible for re-request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A peer that delivers nothing for this long is considered snubbing us: its
/// rate is treated as zero for ranking purposes and endgame mode may
/// re-request its outstanding blocks from other peers.
pub const SNUB_TIMEOUT: Duration = Duration::from_secs(60);

/// Once the number of missing blocks across the whole torrent drops to this
/// count or below, the torrent enters endgame mode and starts requesting the
/// same missing blocks from multiple peers at once.
pub const ENDGAME_BLOCK_THRESHOLD: usize = 20;

/// Smoothing factor for the peer scorer's exponentially weighted moving
/// averages of download and upload rate. Must be in `(0, 1]`; smaller values
/// weigh history more heavily.
pub const SCORE_EWMA_ALPHA: f64 = 0.2;

/// How often the choke scheduler re-evaluates the unchoke set.
pub const CHOKE_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Every this-many choke ticks, one additional, randomly chosen interested
/// peer is optimistically unchoked regardless of its rank.
pub const OPTIMISTIC_UNCHOKE_TICK_INTERVAL: u32 = 3;

/// The minimum number of peers we keep unchoked at all times, even when our
/// upload rate would otherwise justify fewer.
pub const MIN_UNCHOKE_SLOT_COUNT: usize = 4;

/// The upload rate, in bytes/sec, "bonus" folded into the unchoke slot count
/// formula `max(MIN_UNCHOKE_SLOT_COUNT, ceil((rate + bonus) / divisor))`.
pub const UNCHOKE_SLOT_RATE_BONUS: f64 = 50.0 * 1024.0;

/// The divisor in the unchoke slot count formula; roughly, one more unchoke
/// slot is granted per this many bytes/sec of upload rate.
pub const UNCHOKE_SLOT_RATE_DIVISOR: f64 = 50.0 * 1024.0;

/// A peer is banned after this many corrupt pieces attributed to it.
pub const PEER_CORRUPTION_BAN_THRESHOLD: u32 = 3;

/// How long a handshake may take before we give up on a connection attempt.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A connected peer that sends nothing at all for this long is dropped.
pub const PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Outgoing message backpressure queue capacity per peer connection.
pub const PEER_SEND_QUEUE_CAPACITY: usize = 256;

/// How often a peer link sends a keep-alive message during idle periods.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// How often a peer session ticks: rolls scorer byte counters, fills the
/// request pipeline, and reports a [`crate::peer::SessionTick`] upstream.
pub const SESSION_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// The number of blocking-pool workers backing disk I/O, bounded by a
/// semaphore so a single torrent can't starve the others.
pub const DISK_WORKER_COUNT: usize = 4;

//! Decides, on a fixed tick, which interested peers to keep unchoked.
//!
//! The algorithm is the classic tit-for-tat rotation: rank interested peers
//! by their recent download rate (how much they've been sending us), keep
//! the top-ranked ones unchoked up to a dynamic slot count, and rotate in
//! one additional, randomly chosen interested peer every few ticks so that
//! new or currently-choked peers get a chance to prove themselves.

use std::net::SocketAddr;

use rand::seq::SliceRandom;

use crate::conf::{
    MIN_UNCHOKE_SLOT_COUNT, OPTIMISTIC_UNCHOKE_TICK_INTERVAL, UNCHOKE_SLOT_RATE_BONUS,
    UNCHOKE_SLOT_RATE_DIVISOR,
};

/// A peer's standing at the moment of a choke tick, as seen by the torrent.
#[derive(Debug, Clone, Copy)]
pub struct PeerSnapshot {
    pub addr: SocketAddr,
    /// The peer's recent download rate, in bytes/sec, as estimated by the
    /// torrent from the peer's session ticks.
    pub download_rate: f64,
    /// Whether the peer has told us it wants to download from us.
    pub interested: bool,
    /// Whether we currently have the peer unchoked.
    pub unchoked: bool,
}

/// The outcome of a choke tick: the full set of peers that should be
/// unchoked after this tick. The caller diffs this against each peer's
/// current state to know who to send `SetChoked` to.
#[derive(Debug, Default)]
pub struct Decision {
    pub unchoked: Vec<SocketAddr>,
}

pub struct ChokeScheduler {
    tick_count: u32,
}

impl ChokeScheduler {
    pub fn new() -> Self {
        Self { tick_count: 0 }
    }

    /// The number of upload slots to grant, given our current aggregate
    /// download rate: `max(MIN_UNCHOKE_SLOT_COUNT, ceil((rate + bonus) /
    /// divisor))`.
    fn slot_count(&self, download_rate: f64) -> usize {
        let computed = ((download_rate + UNCHOKE_SLOT_RATE_BONUS) / UNCHOKE_SLOT_RATE_DIVISOR).ceil();
        (computed as usize).max(MIN_UNCHOKE_SLOT_COUNT)
    }

    /// Runs one choke tick over the current peer set and returns the set of
    /// peers that should end up unchoked.
    ///
    /// `download_rate` is the torrent's aggregate incoming rate across all
    /// peers, used to size the slot count.
    pub fn tick(&mut self, peers: &[PeerSnapshot], download_rate: f64) -> Decision {
        self.tick_count += 1;
        let slots = self.slot_count(download_rate);

        let mut interested: Vec<&PeerSnapshot> =
            peers.iter().filter(|p| p.interested).collect();
        interested.sort_by(|a, b| b.download_rate.partial_cmp(&a.download_rate).unwrap());

        let mut unchoked: Vec<SocketAddr> =
            interested.iter().take(slots).map(|p| p.addr).collect();

        if self.is_optimistic_tick() {
            let remaining: Vec<&&PeerSnapshot> = interested
                .iter()
                .skip(slots)
                .filter(|p| !unchoked.contains(&p.addr))
                .collect();
            if let Some(pick) = remaining.choose(&mut rand::thread_rng()) {
                unchoked.push(pick.addr);
            }
        }

        Decision { unchoked }
    }

    fn is_optimistic_tick(&self) -> bool {
        self.tick_count % OPTIMISTIC_UNCHOKE_TICK_INTERVAL == 0
    }
}

impl Default for ChokeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

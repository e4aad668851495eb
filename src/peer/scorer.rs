//! Ranks a peer's usefulness to us, so that the choke scheduler can decide
//! who to keep unchoked and the request pipeline can decide who to favor
//! during endgame re-requests.

use std::time::{Duration, Instant};

use crate::conf::{SCORE_EWMA_ALPHA, SNUB_TIMEOUT};

/// An exponentially weighted moving average with a fixed smoothing factor.
///
/// Unlike [`crate::avg::SlidingAvg`], which uses a slowly increasing gain to
/// counter the bias of an empty initial average, this estimator applies the
/// same weight to every sample starting from the first. It is simpler and
/// well suited to rates that are expected to vary quickly, like per-peer
/// throughput.
#[derive(Debug, Clone, Copy)]
struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    fn update(&mut self, sample: f64) {
        self.value = Some(match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        });
    }

    fn get(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

/// Tracks a peer's download rate, its variance, and a trust counter derived
/// from how often the peer's deliveries turned out to be valid, and
/// combines these into a single composite score used to rank peers for the
/// choke scheduler and for endgame preference.
pub struct PeerScorer {
    rate: Ewma,
    /// Exponential moving average of the squared deviation from `rate`,
    /// i.e. the variance of the download rate.
    variance: Ewma,
    /// Incremented for every valid piece the peer contributed to, and
    /// decremented (floored at zero) for every corrupt one. Used as a
    /// tie-breaker and to penalize peers who have sent us bad data before.
    trust: i32,
    last_delivery: Option<Instant>,
    bytes_since_tick: u64,
}

impl PeerScorer {
    pub fn new() -> Self {
        Self {
            rate: Ewma::new(SCORE_EWMA_ALPHA),
            variance: Ewma::new(SCORE_EWMA_ALPHA),
            trust: 0,
            last_delivery: None,
            bytes_since_tick: 0,
        }
    }

    /// Call every time a block arrives from this peer.
    pub fn record_delivery(&mut self, byte_count: u64) {
        self.bytes_since_tick += byte_count;
        self.last_delivery = Some(Instant::now());
    }

    /// Call once per choke scheduler tick to roll the byte counter collected
    /// since the last tick into the rate estimate.
    pub fn tick(&mut self, tick_duration: Duration) {
        let rate = if self.is_snubbing() {
            0.0
        } else {
            self.bytes_since_tick as f64 / tick_duration.as_secs_f64()
        };
        let deviation = (rate - self.rate.get()).powi(2);
        self.rate.update(rate);
        self.variance.update(deviation);
        self.bytes_since_tick = 0;
    }

    /// A peer that has delivered nothing for [`SNUB_TIMEOUT`] is considered
    /// to be snubbing us: its rate is forced to zero for ranking purposes.
    pub fn is_snubbing(&self) -> bool {
        match self.last_delivery {
            Some(at) => at.elapsed() >= SNUB_TIMEOUT,
            // a peer that never delivered anything isn't "snubbing" yet in
            // the sense of having gone quiet after being productive, but it
            // ranks the same: zero rate.
            None => false,
        }
    }

    pub fn record_valid_piece(&mut self) {
        self.trust = (self.trust + 1).min(10);
    }

    pub fn record_corrupt_piece(&mut self) {
        self.trust = (self.trust - 1).max(0);
    }

    pub fn trust(&self) -> i32 {
        self.trust
    }

    pub fn rate(&self) -> f64 {
        if self.is_snubbing() {
            0.0
        } else {
            self.rate.get()
        }
    }

    /// The composite score used to rank peers: the download rate, boosted by
    /// trust (a peer that has never sent us corrupt data is worth up to
    /// twice its raw rate) and penalized by its volatility relative to its
    /// own rate (so a peer with an erratic rate ranks below a steadier peer
    /// with the same average).
    pub fn score(&self) -> f64 {
        const EPS: f64 = 1.0;
        let rate = self.rate();
        let variance = self.variance.get();
        let trust_boost = 1.0 + self.trust as f64 / 10.0;
        let stability = (1.0 - variance.sqrt() / (rate + EPS)).max(0.1);
        rate * trust_boost * stability
    }
}

impl Default for PeerScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_rate_converges() {
        let mut scorer = PeerScorer::new();
        for _ in 0..50 {
            scorer.record_delivery(16 * 1024);
            scorer.tick(Duration::from_secs(1));
        }
        assert!((scorer.rate() - 16384.0).abs() < 1.0);
    }

    #[test]
    fn snubbing_peer_scores_zero_rate() {
        let mut scorer = PeerScorer::new();
        scorer.record_delivery(16 * 1024);
        scorer.last_delivery = Some(Instant::now() - SNUB_TIMEOUT - Duration::from_secs(1));
        assert!(scorer.is_snubbing());
        assert_eq!(scorer.rate(), 0.0);
    }

    #[test]
    fn trust_breaks_ties() {
        let mut a = PeerScorer::new();
        let mut b = PeerScorer::new();
        for _ in 0..10 {
            a.record_delivery(16 * 1024);
            a.tick(Duration::from_secs(1));
            b.record_delivery(16 * 1024);
            b.tick(Duration::from_secs(1));
        }
        a.record_valid_piece();
        b.record_corrupt_piece();
        assert!(a.score() > b.score());
    }
}

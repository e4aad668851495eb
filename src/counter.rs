//! Simple byte/block counters for periodic reporting, distinct from
//! [`crate::peer::scorer::PeerScorer`], which derives a ranking rather than
//! raw totals.

/// Accumulates a running total alongside the delta since the last reset,
/// so a session tick can report "bytes this round" without the coordinator
/// having to remember the previous snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counter {
    total: u64,
    round: u64,
}

impl Counter {
    pub fn add(&mut self, n: u64) {
        self.total += n;
        self.round += n;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Returns the amount accumulated since the last [`Self::reset_round`]
    /// and clears it.
    pub fn reset_round(&mut self) -> u64 {
        std::mem::take(&mut self.round)
    }
}

/// Per-session throughput counters reported upward in [`crate::peer::SessionTick`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ThruputCounters {
    /// All bytes read off the wire, including protocol overhead.
    pub payload_download: Counter,
    /// All bytes written to the wire, including protocol overhead.
    pub payload_upload: Counter,
    /// Bytes belonging to piece blocks only (a subset of `payload_download`).
    pub block_download: Counter,
    /// Bytes belonging to piece blocks only (a subset of `payload_upload`).
    pub block_upload: Counter,
}

impl ThruputCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_resets_without_affecting_total() {
        let mut counter = Counter::default();
        counter.add(10);
        counter.add(5);
        assert_eq!(counter.total(), 15);
        assert_eq!(counter.reset_round(), 15);
        counter.add(3);
        assert_eq!(counter.total(), 18);
        assert_eq!(counter.reset_round(), 3);
    }
}

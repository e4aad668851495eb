//! The request pipeline keeps a sliding window of outstanding block requests
//! toward a single peer, so that the link stays saturated without the peer
//! ever building up an unbounded backlog of work.

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use crate::{
    blockinfo::{block_count, block_len, BlockInfo},
    conf::{REQUEST_PIPELINE_WINDOW, REQUEST_TIMEOUT},
    PieceIndex,
};

/// Tracks the blocks of a single piece we're downloading from this peer.
#[derive(Debug)]
struct PieceDownload {
    piece_index: PieceIndex,
    piece_len: u32,
    /// Offsets of blocks we have already received for this piece.
    received: HashSet<u32>,
    /// Offsets of blocks requested from this peer, along with when they
    /// were requested (used for the per-request timeout).
    requested: HashMap<u32, Instant>,
}

impl PieceDownload {
    fn new(piece_index: PieceIndex, piece_len: u32) -> Self {
        Self {
            piece_index,
            piece_len,
            received: HashSet::new(),
            requested: HashMap::new(),
        }
    }

    fn missing_block_count(&self) -> usize {
        block_count(self.piece_len) - self.received.len()
    }

    /// Picks up to `count` blocks that haven't been requested yet (or, in
    /// endgame mode, that haven't been received yet, regardless of whether
    /// some other peer already has an outstanding request for them).
    fn pick_blocks(&mut self, count: usize, endgame: bool, out: &mut Vec<BlockInfo>) {
        if count == 0 {
            return;
        }
        let total_blocks = block_count(self.piece_len);
        let mut picked = 0;
        for index in 0..total_blocks {
            if picked >= count {
                break;
            }
            let offset = (index as u32) * crate::BLOCK_LEN;
            if self.received.contains(&offset) {
                continue;
            }
            if !endgame && self.requested.contains_key(&offset) {
                continue;
            }
            self.requested.insert(offset, Instant::now());
            out.push(BlockInfo {
                piece_index: self.piece_index,
                offset,
                len: block_len(self.piece_len, index),
            });
            picked += 1;
        }
    }
}

/// Drives the sliding window of outstanding requests toward a single peer.
///
/// Besides the per-peer window cap, the pipeline enters endgame mode once
/// told to by the owning session (normally because the torrent as a whole
/// has few missing blocks left), at which point it is willing to re-request
/// blocks that are already outstanding toward other peers, racing the
/// delivery.
pub struct RequestPipeline {
    downloads: Vec<PieceDownload>,
    window: usize,
    endgame: bool,
}

impl RequestPipeline {
    pub fn new() -> Self {
        Self {
            downloads: Vec::new(),
            window: REQUEST_PIPELINE_WINDOW,
            endgame: false,
        }
    }

    /// The number of requests currently outstanding toward the peer.
    pub fn outstanding_count(&self) -> usize {
        self.downloads.iter().map(|d| d.requested.len()).sum()
    }

    /// Enables or disables endgame mode.
    pub fn set_endgame(&mut self, endgame: bool) {
        self.endgame = endgame;
    }

    /// Returns true if this session isn't currently downloading any piece.
    pub fn is_idle(&self) -> bool {
        self.downloads.is_empty()
    }

    /// Starts tracking a new piece download, picked by the caller (normally
    /// via the piece store's rarest-first selection).
    pub fn start_piece(&mut self, piece_index: PieceIndex, piece_len: u32) {
        if !self.downloads.iter().any(|d| d.piece_index == piece_index) {
            self.downloads.push(PieceDownload::new(piece_index, piece_len));
        }
    }

    /// Fills the window with new requests, up to its capacity, continuing
    /// in-progress piece downloads before this peer is asked to start new
    /// ones (via the returned `needed` count, which the caller should use
    /// to pick and `start_piece` additional pieces if it has any to offer).
    pub fn fill(&mut self) -> (Vec<BlockInfo>, usize) {
        let mut blocks = Vec::new();
        let mut remaining = self.window.saturating_sub(self.outstanding_count());

        for download in self.downloads.iter_mut() {
            if remaining == 0 {
                break;
            }
            let before = blocks.len();
            download.pick_blocks(remaining, self.endgame, &mut blocks);
            remaining -= blocks.len() - before;
        }

        (blocks, remaining)
    }

    /// Records that a block has arrived, completing its piece download if
    /// it was the last missing block. Returns `Some(piece_index)` when the
    /// piece is now fully received by this pipeline.
    pub fn receive_block(&mut self, block: BlockInfo) -> Option<PieceIndex> {
        let pos = self
            .downloads
            .iter()
            .position(|d| d.piece_index == block.piece_index)?;
        let download = &mut self.downloads[pos];
        download.requested.remove(&block.offset);
        download.received.insert(block.offset);

        if download.missing_block_count() == 0 {
            self.downloads.remove(pos);
            Some(block.piece_index)
        } else {
            None
        }
    }

    /// Returns whether `block` is among the blocks we asked this peer for.
    pub fn is_outstanding(&self, block: &BlockInfo) -> bool {
        self.downloads.iter().any(|d| {
            d.piece_index == block.piece_index && d.requested.contains_key(&block.offset)
        })
    }

    /// Drops all outstanding requests, e.g. because the peer choked us.
    /// The piece downloads themselves are kept so that we can resume
    /// requesting from where we left off once unchoked again.
    pub fn clear_requests(&mut self) {
        for download in self.downloads.iter_mut() {
            download.requested.clear();
        }
    }

    /// Cancels and forgets the request for `block`, e.g. because another
    /// peer delivered it first during endgame.
    pub fn cancel(&mut self, block: &BlockInfo) {
        if let Some(download) = self
            .downloads
            .iter_mut()
            .find(|d| d.piece_index == block.piece_index)
        {
            download.requested.remove(&block.offset);
        }
    }

    /// Drops all tracking of `piece_index`, e.g. because another peer
    /// completed and validated it first during endgame.
    pub fn abandon_piece(&mut self, piece_index: PieceIndex) {
        self.downloads.retain(|d| d.piece_index != piece_index);
    }

    /// Returns the blocks whose request has been outstanding for longer
    /// than [`REQUEST_TIMEOUT`], so the caller can consider the peer slow
    /// and/or re-request the block elsewhere.
    pub fn timed_out_requests(&self) -> Vec<BlockInfo> {
        let now = Instant::now();
        self.downloads
            .iter()
            .flat_map(|d| {
                d.requested.iter().filter_map(move |(&offset, &at)| {
                    if now.duration_since(at) >= REQUEST_TIMEOUT {
                        Some(BlockInfo {
                            piece_index: d.piece_index,
                            offset,
                            len: block_len(d.piece_len, (offset / crate::BLOCK_LEN) as usize),
                        })
                    } else {
                        None
                    }
                })
            })
            .collect()
    }

    /// The age of the oldest outstanding request, used by the scorer to
    /// detect a snubbing peer.
    pub fn oldest_request_age(&self) -> Option<Duration> {
        let now = Instant::now();
        self.downloads
            .iter()
            .flat_map(|d| d.requested.values())
            .map(|&at| now.duration_since(at))
            .max()
    }
}

impl Default for RequestPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_window_from_single_piece() {
        let mut pipeline = RequestPipeline::new();
        pipeline.start_piece(0, 3 * crate::BLOCK_LEN);
        let (blocks, remaining) = pipeline.fill();
        assert_eq!(blocks.len(), 3);
        assert_eq!(remaining, REQUEST_PIPELINE_WINDOW - 3);
    }

    #[test]
    fn does_not_redundantly_request_outside_endgame() {
        let mut pipeline = RequestPipeline::new();
        pipeline.start_piece(0, crate::BLOCK_LEN);
        let (first, _) = pipeline.fill();
        assert_eq!(first.len(), 1);
        let (second, _) = pipeline.fill();
        assert!(second.is_empty());
    }

    #[test]
    fn completes_piece_once_all_blocks_received() {
        let mut pipeline = RequestPipeline::new();
        pipeline.start_piece(0, crate::BLOCK_LEN);
        let (blocks, _) = pipeline.fill();
        let block = blocks[0];
        assert!(pipeline.receive_block(block).is_some());
        assert!(pipeline.is_idle());
    }

    #[test]
    fn endgame_allows_rerequesting_outstanding_block() {
        let mut pipeline = RequestPipeline::new();
        pipeline.start_piece(0, crate::BLOCK_LEN);
        pipeline.fill();
        pipeline.set_endgame(true);
        let (blocks, _) = pipeline.fill();
        assert_eq!(blocks.len(), 1);
    }
}

//! A single torrent's view of its own pieces on disk: which ones are
//! missing, reserved, complete or corrupt, and the bookkeeping needed to
//! pick the next piece to download and to assemble/verify/persist blocks as
//! they arrive.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::Path,
    sync::RwLock,
};

use rand::Rng;

use crate::{
    blockinfo::{BlockInfo, CachedBlock},
    conf::DISK_WORKER_COUNT,
    error::disk::{NewTorrentError, ReadError, WriteError},
    storage_info::StorageInfo,
    Bitfield, PeerId, PieceIndex, Sha1Hash,
};

use super::{file::TorrentFile, piece};

/// A single piece's state in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// Not yet downloaded, and not currently reserved to any peer.
    Missing,
    /// At least one peer session has started downloading this piece.
    Reserved,
    /// Written to disk and its hash verified.
    Complete,
    /// All blocks were received but the assembled piece failed hash
    /// verification. It is never retried automatically; whoever observes
    /// this is expected to re-download the piece from other peers.
    Corrupt,
}

/// Maps a piece, while it's being reserved, to the peers currently
/// downloading blocks of it (more than one during endgame).
type Reservations = HashMap<PieceIndex, HashSet<PeerId>>;

/// Keeps track of a torrent's pieces: their on-disk completion state, which
/// peers are currently downloading each in-progress piece, and the
/// in-memory block buffers of pieces that aren't complete yet.
///
/// All methods that touch files perform blocking I/O and must be called
/// from a blocking context (see [`DISK_WORKER_COUNT`]).
pub struct PieceStore {
    storage_info: StorageInfo,
    /// Concatenated 20 byte SHA-1 hash per piece.
    piece_hashes: Vec<u8>,
    files: Vec<RwLock<TorrentFile>>,
    states: Vec<PieceState>,
    reservations: Reservations,
    /// The number of connected peers known to have each piece, fed by their
    /// bitfield and `have` messages. Drives rarest-first selection
    /// independently of how many peers are currently *downloading* a piece.
    availability: Vec<u32>,
    /// Pieces that have at least one received block but aren't complete.
    in_progress: HashMap<PieceIndex, piece::Piece>,
}

impl PieceStore {
    /// Opens (creating if necessary) every file of the torrent and builds a
    /// fresh store with all pieces marked missing.
    ///
    /// Every piece starts out missing; call [`Self::verify_existing`]
    /// afterwards to mark pieces already present on disk (from a previous,
    /// interrupted download, or because we're seeding) as complete.
    pub fn new(
        download_dir: &Path,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<Self, NewTorrentError> {
        let files = match &storage_info.structure {
            crate::storage_info::FsStructure::File(file) => {
                vec![RwLock::new(TorrentFile::new(download_dir, file.clone())?)]
            }
            crate::storage_info::FsStructure::Archive { files } => files
                .iter()
                .map(|file| TorrentFile::new(download_dir, file.clone()).map(RwLock::new))
                .collect::<Result<Vec<_>, _>>()?,
        };

        let piece_count = storage_info.piece_count;
        let states = vec![PieceState::Missing; piece_count];

        Ok(Self {
            storage_info,
            piece_hashes,
            files,
            states,
            reservations: HashMap::new(),
            availability: vec![0; piece_count],
            in_progress: HashMap::new(),
        })
    }

    /// Reads every piece not already marked complete from disk and verifies
    /// it against its expected hash, marking any that match as complete.
    /// Used to resume a partially downloaded torrent without re-fetching
    /// data that's already on disk.
    ///
    /// Returns the indices of pieces found to be already complete.
    pub fn verify_existing(&mut self) -> Result<Vec<PieceIndex>, ReadError> {
        let mut completed = Vec::new();
        for index in 0..self.states.len() {
            if self.states[index] == PieceState::Complete {
                continue;
            }
            let piece_len = match self.storage_info.piece_len(index) {
                Ok(len) => len,
                Err(_) => continue,
            };
            let file_range = match self.storage_info.files_intersecting_piece(index) {
                Ok(range) => range,
                Err(_) => continue,
            };
            let torrent_offset = index as u64 * self.storage_info.piece_len as u64;
            let blocks = match piece::read(torrent_offset, file_range, &self.files, piece_len) {
                Ok(blocks) => blocks,
                // a freshly allocated, sparse file reads back as zeroes on
                // most filesystems rather than erroring, but guard against
                // the (e.g. truncated file) case regardless
                Err(_) => continue,
            };

            use sha1::{Digest, Sha1};
            let mut hasher = Sha1::new();
            for block in &blocks {
                hasher.update(block.as_slice());
            }
            let hash = hasher.finalize();
            if hash.as_slice() == self.piece_hash(index) {
                self.states[index] = PieceState::Complete;
                completed.push(index);
            }
        }
        Ok(completed)
    }

    fn piece_hash(&self, index: PieceIndex) -> Sha1Hash {
        let start = index * 20;
        self.piece_hashes[start..start + 20]
            .try_into()
            .expect("piece hash slice is not 20 bytes")
    }

    pub fn piece_state(&self, index: PieceIndex) -> Option<PieceState> {
        self.states.get(index).copied()
    }

    pub fn is_complete(&self) -> bool {
        self.states.iter().all(|s| *s == PieceState::Complete)
    }

    /// Returns a bitfield of all pieces currently marked complete.
    pub fn own_bitfield(&self) -> Bitfield {
        self.states.iter().map(|s| *s == PieceState::Complete).collect()
    }

    /// The number of pieces neither complete nor currently reserved to any
    /// peer, across the whole torrent; used to decide when to enter endgame.
    pub fn missing_piece_count(&self) -> usize {
        self.states
            .iter()
            .filter(|s| **s != PieceState::Complete)
            .count()
    }

    /// Registers a peer's full bitfield against the availability counter,
    /// once, right after it's received.
    pub fn register_availability(&mut self, have: &Bitfield) {
        for index in 0..self.availability.len() {
            if have.get(index).map(|b| *b).unwrap_or(false) {
                self.availability[index] += 1;
            }
        }
    }

    /// Registers a single piece a peer just announced via `have`.
    pub fn register_piece_availability(&mut self, index: PieceIndex) {
        if let Some(count) = self.availability.get_mut(index) {
            *count += 1;
        }
    }

    /// Reverses every `true` bit of `have` previously registered for a peer,
    /// e.g. because it disconnected.
    pub fn forget_availability(&mut self, have: &Bitfield) {
        for index in 0..self.availability.len() {
            if have.get(index).map(|b| *b).unwrap_or(false) {
                if let Some(count) = self.availability.get_mut(index) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    /// Picks the rarest piece `peer_id` can help with and hasn't already
    /// been completed, among those it advertises in `have`, breaking ties
    /// between equally rare pieces at random. Marks the piece reserved.
    ///
    /// Rarity is ranked by swarm-wide availability (how many connected peers
    /// have the piece), not by how many peers are currently downloading it.
    /// Outside endgame, a piece already `Reserved` to another peer is not a
    /// candidate; during endgame it is, so the same piece can be raced.
    ///
    /// Returns `None` if the peer has nothing useful left to offer.
    pub fn reserve_piece(
        &mut self,
        peer_id: PeerId,
        have: &Bitfield,
        endgame: bool,
    ) -> Option<PieceIndex> {
        let mut min_availability = u32::MAX;
        let mut candidates = Vec::new();

        for index in 0..self.states.len() {
            let state = self.states[index];
            if state == PieceState::Complete {
                continue;
            }
            if state == PieceState::Reserved && !endgame {
                continue;
            }
            if !have.get(index).map(|b| *b).unwrap_or(false) {
                continue;
            }
            let count = self.availability[index];
            match count.cmp(&min_availability) {
                std::cmp::Ordering::Less => {
                    min_availability = count;
                    candidates.clear();
                    candidates.push(index);
                }
                std::cmp::Ordering::Equal => candidates.push(index),
                std::cmp::Ordering::Greater => {}
            }
        }

        if candidates.is_empty() {
            return None;
        }

        let index = if candidates.len() == 1 {
            candidates[0]
        } else {
            candidates[rand::thread_rng().gen_range(0..candidates.len())]
        };

        self.states[index] = PieceState::Reserved;
        self.reservations.entry(index).or_default().insert(peer_id);
        Some(index)
    }

    /// Releases `peer_id`'s claim on `index`, e.g. because it disconnected
    /// or choked us. If no peer is left downloading it, the piece reverts
    /// to missing so it can be picked up again.
    pub fn release_reservation(&mut self, index: PieceIndex, peer_id: PeerId) {
        if let Some(peers) = self.reservations.get_mut(&index) {
            peers.remove(&peer_id);
            if peers.is_empty() {
                self.reservations.remove(&index);
                if self.states.get(index) == Some(&PieceState::Reserved) {
                    self.states[index] = PieceState::Missing;
                }
            }
        }
    }

    /// Adds a received block to its piece's in-progress buffer. If this
    /// completes the piece, verifies its hash, and if valid, writes it to
    /// disk.
    ///
    /// Returns `None` while the piece is still missing blocks, or
    /// `Some(is_valid)` once the piece is complete (whether or not its hash
    /// matched).
    pub fn submit_block(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<Option<bool>, WriteError> {
        let index = block_info.piece_index;
        let expected_hash = self.piece_hash(index);
        let piece_len = self
            .storage_info
            .piece_len(index)
            .expect("submit_block called with invalid piece index");
        let file_range = self
            .storage_info
            .files_intersecting_piece(index)
            .expect("submit_block called with invalid piece index");

        let entry = self.in_progress.entry(index).or_insert_with(|| piece::Piece {
            expected_hash,
            len: piece_len,
            blocks: BTreeMap::new(),
            file_range,
        });
        entry.enqueue_block(block_info.offset, data);

        if !entry.is_complete() {
            return Ok(None);
        }

        let piece = self.in_progress.remove(&index).expect("piece just completed");
        let is_valid = piece.match_hash();

        if is_valid {
            let torrent_piece_offset = index as u64 * self.storage_info.piece_len as u64;
            piece.write(torrent_piece_offset, &self.files)?;
            self.states[index] = PieceState::Complete;
        } else {
            log::warn!("Piece {} failed hash verification", index);
            self.states[index] = PieceState::Corrupt;
        }
        self.reservations.remove(&index);

        Ok(Some(is_valid))
    }

    /// Reads a single block from disk. The piece it belongs to must be
    /// complete.
    pub fn read_block(&self, block_info: BlockInfo) -> Result<CachedBlock, ReadError> {
        if self.states.get(block_info.piece_index) != Some(&PieceState::Complete) {
            return Err(ReadError::MissingData);
        }
        let file_range = self
            .storage_info
            .files_intersecting_piece(block_info.piece_index)
            .map_err(|_| ReadError::InvalidBlockOffset)?;
        let torrent_offset =
            block_info.piece_index as u64 * self.storage_info.piece_len as u64 + block_info.offset as u64;
        piece::read_block(torrent_offset, block_info.len, file_range, &self.files)
    }
}

/// Sanity assertion that the configured worker count is sane; referenced
/// here so the constant isn't flagged unused if callers elsewhere are
/// trimmed.
const _: () = assert!(DISK_WORKER_COUNT > 0);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::{FileInfo, FsStructure};
    use std::path::PathBuf;

    fn store_with_one_piece(dir: &Path) -> (PieceStore, Sha1Hash) {
        use sha1::{Digest, Sha1};

        let piece_len = 2 * crate::BLOCK_LEN;
        let data = vec![7u8; piece_len as usize];
        let hash: Sha1Hash = Sha1::digest(&data).into();

        let storage_info = StorageInfo {
            piece_count: 1,
            piece_len,
            last_piece_len: piece_len,
            download_len: piece_len as u64,
            download_dir: dir.to_path_buf(),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("a.bin"),
                len: piece_len as u64,
                torrent_offset: 0,
            }),
        };

        let store = PieceStore::new(dir, storage_info, hash.to_vec()).unwrap();
        (store, hash)
    }

    #[test]
    fn reserves_and_completes_a_piece() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _hash) = store_with_one_piece(dir.path());

        let peer_id: PeerId = [1; 20];
        let have = Bitfield::repeat(true, 1);

        let index = store.reserve_piece(peer_id, &have, false).unwrap();
        assert_eq!(index, 0);
        assert_eq!(store.piece_state(0), Some(PieceState::Reserved));

        let block_a = BlockInfo { piece_index: 0, offset: 0, len: crate::BLOCK_LEN };
        let block_b = BlockInfo { piece_index: 0, offset: crate::BLOCK_LEN, len: crate::BLOCK_LEN };

        let result = store
            .submit_block(block_a, vec![7u8; crate::BLOCK_LEN as usize])
            .unwrap();
        assert!(result.is_none());

        let result = store
            .submit_block(block_b, vec![7u8; crate::BLOCK_LEN as usize])
            .unwrap();
        assert_eq!(result, Some(true));
        assert_eq!(store.piece_state(0), Some(PieceState::Complete));

        let block = store.read_block(block_a).unwrap();
        assert_eq!(block.as_slice(), &vec![7u8; crate::BLOCK_LEN as usize][..]);
    }

    #[test]
    fn corrupt_piece_is_marked_and_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _hash) = store_with_one_piece(dir.path());

        let block_a = BlockInfo { piece_index: 0, offset: 0, len: crate::BLOCK_LEN };
        let block_b = BlockInfo { piece_index: 0, offset: crate::BLOCK_LEN, len: crate::BLOCK_LEN };
        store.submit_block(block_a, vec![0u8; crate::BLOCK_LEN as usize]).unwrap();
        let result = store
            .submit_block(block_b, vec![0u8; crate::BLOCK_LEN as usize])
            .unwrap();
        assert_eq!(result, Some(false));
        assert_eq!(store.piece_state(0), Some(PieceState::Corrupt));
    }

    #[test]
    fn releasing_last_reservation_reverts_to_missing() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _hash) = store_with_one_piece(dir.path());
        let peer_id: PeerId = [2; 20];
        let have = Bitfield::repeat(true, 1);
        let index = store.reserve_piece(peer_id, &have, false).unwrap();
        store.release_reservation(index, peer_id);
        assert_eq!(store.piece_state(0), Some(PieceState::Missing));
    }

    fn store_with_pieces(dir: &Path, piece_count: usize) -> PieceStore {
        let piece_len = crate::BLOCK_LEN;
        let total_len = piece_len as u64 * piece_count as u64;
        let storage_info = StorageInfo {
            piece_count,
            piece_len,
            last_piece_len: piece_len,
            download_len: total_len,
            download_dir: dir.to_path_buf(),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("a.bin"),
                len: total_len,
                torrent_offset: 0,
            }),
        };
        PieceStore::new(dir, storage_info, vec![0u8; piece_count * 20]).unwrap()
    }

    #[test]
    fn reserves_rarest_piece_by_availability_not_active_downloaders() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with_pieces(dir.path(), 3);
        let have = Bitfield::repeat(true, 3);

        // Piece 2 is the rarest in the swarm even though nobody has started
        // downloading it yet.
        store.register_availability(&Bitfield::from_iter([true, false, false]));
        store.register_availability(&Bitfield::from_iter([true, true, false]));
        store.register_availability(&Bitfield::from_iter([true, true, true]));
        store.register_availability(&Bitfield::from_iter([false, false, true]));

        let index = store.reserve_piece([1; 20], &have, false).unwrap();
        assert_eq!(index, 2);
    }

    #[test]
    fn normal_mode_excludes_already_reserved_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with_pieces(dir.path(), 1);
        let have = Bitfield::repeat(true, 1);

        assert_eq!(store.reserve_piece([1; 20], &have, false), Some(0));
        assert_eq!(store.reserve_piece([2; 20], &have, false), None);
        assert_eq!(store.reserve_piece([2; 20], &have, true), Some(0));
    }
}

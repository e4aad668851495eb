use std::{collections::BTreeMap, ops::Range, sync};

use sha1::{Digest, Sha1};

use crate::{
  blockinfo::{block_count, block_len, CachedBlock},
  error::disk::{ReadError, WriteError},
  FileIndex, Sha1Hash,
};

use super::file::TorrentFile;

/// An in-progress piece download that keeps in memory the so far downloaded
/// blocks and the expected hash of the piece.
pub struct Piece {
  /// The expected hash of the whole piece.
  pub expected_hash: Sha1Hash,
  /// The length of the piece, in bytes.
  pub len: u32,
  /// The so far downloaded block. Once the size of the map reaches the
  /// number of blocks in piece, the piece is complete and, if the hash
  /// is correct, saved to disk.
  ///
  /// Each block must be 16 KiB and is mapped to its offset within piece.
  /// A BTreeMap is used to keep blocks sorted by their offsets, which is
  /// important when iterating over the map to hash each block in the right
  /// order.
  pub blocks: BTreeMap<u32, Vec<u8>>,
  /// The files that this piece overlaps with.
  ///
  /// This is a left-inclusive range of all file indices, that can be used
  /// to index the `Torrent::files` vector to get the file handles.
  pub file_range: Range<FileIndex>,
}

impl Piece {
  /// Places block into piece's writer buffer if it doesn't exist.
  pub fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
    use std::collections::btree_map::Entry;
    let entry = self.blocks.entry(offset);
    if matches!(entry, Entry::Occupied(_)) {
      log::warn!("Duplicate piece block at offset {}", offset);
    } else {
      entry.or_insert(data);
    }
  }

  /// Returns the piece has all its blocks in its write buffer.
  pub fn is_complete(&self) -> bool {
    self.blocks.len() == block_count(self.len)
  }

  /// Calculates the piece's hash using all its blocks and returns if it matches
  /// the expected
  pub fn match_hash(&self) -> bool {
    // sanity check that we only call this method if we have all blocks in
    // piece
    debug_assert_eq!(self.blocks.len(), block_count(self.len));
    let mut hasher = Sha1::new();
    for block in self.blocks.values() {
      hasher.update(block);
    }
    let hash = hasher.finalize();
    log::debug!("Piece hash: {:x}", hash);
    hash.as_slice() == self.expected_hash
  }

  /// Writes the piece's blocks to the files the piece overlaps with.
  ///
  /// # Important
  ///
  /// This performs sync IO and is thus potentially blocking and should be
  /// executed on a thread pool, and not the async executor.
  pub fn write(
    &self,
    torrent_piece_offset: u64,
    files: &[sync::RwLock<TorrentFile>],
  ) -> Result<(), WriteError> {
    debug_assert_eq!(self.blocks.len(), block_count(self.len));

    // flatten the piece's blocks into one contiguous buffer so it can be
    // sliced up per file without having to track partial-block offsets.
    let mut piece_buf = Vec::with_capacity(self.len as usize);
    for block in self.blocks.values() {
      piece_buf.extend_from_slice(block);
    }
    debug_assert_eq!(piece_buf.len(), self.len as usize);

    let files = &files[self.file_range.clone()];
    debug_assert!(!files.is_empty());

    let mut torrent_write_offset = torrent_piece_offset;
    let mut written = 0u64;

    for file in files.iter() {
      let file = file.write().unwrap();

      let remaining_piece_len = self.len as u64 - written;
      let file_slice = file
        .info
        .get_slice(torrent_write_offset, remaining_piece_len);
      debug_assert!(file_slice.len > 0);

      let start = written as usize;
      let end = start + file_slice.len as usize;
      file.write_at(file_slice, &piece_buf[start..end])?;

      torrent_write_offset += file_slice.len;
      written += file_slice.len;
    }

    debug_assert_eq!(written, self.len as u64);

    Ok(())
  }
}

/// Reads a piece's blocks from the specified portion of the file from disk.
///
/// # Arguments
///
/// * `torrent_piece_offset` - The absolute offset of the piece's first byte
///     in the whole torrent. From this value the relative offset of piece
///     within file is calculated.
/// * `file_range` - The files that contain data of the piece.
/// * `files` - A slice of all files in torrent.
/// * `len` - The length of the piece to read in. While this function is
///     currently used to read the whole piece, it could also be used to
///     read only a portion of the piece or serval pieces with this argument.
pub fn read(
  torrent_piece_offset: u64,
  file_range: Range<FileIndex>,
  files: &[sync::RwLock<TorrentFile>],
  len: u32,
) -> Result<Vec<CachedBlock>, ReadError> {
  let mut piece_buf = vec![0u8; len as usize];

  let files = &files[file_range];
  debug_assert!(!files.is_empty());
  let len = len as u64;

  let mut torrent_read_offset = torrent_piece_offset;
  let mut total_read_count = 0;

  for file in files.iter() {
    let file = file.read().unwrap();

    debug_assert!(len > total_read_count);
    let remaining_pieces_len = len - total_read_count;
    let file_slice = file
      .info
      .get_slice(torrent_read_offset, remaining_pieces_len);
    debug_assert!(file_slice.len > 0);

    let start = total_read_count as usize;
    let end = start + file_slice.len as usize;
    file.read_at(file_slice, &mut piece_buf[start..end])?;

    torrent_read_offset += file_slice.len;
    total_read_count += file_slice.len;
  }

  debug_assert_eq!(total_read_count, len);

  // split the flat buffer back up into block-sized chunks, mirroring how
  // the piece was assembled for writing.
  let block_count = block_count(len as u32);
  let mut blocks = Vec::with_capacity(block_count);
  let mut offset = 0usize;
  for i in 0..block_count {
    let this_block_len = block_len(len as u32, i) as usize;
    let block = piece_buf[offset..offset + this_block_len].to_vec();
    blocks.push(std::sync::Arc::new(block));
    offset += this_block_len;
  }

  Ok(blocks)
}

/// Reads a single block, of exactly `len` bytes starting at `torrent_offset`
/// (an absolute offset into the whole torrent), from the files it overlaps
/// with.
pub fn read_block(
  torrent_offset: u64,
  len: u32,
  file_range: Range<FileIndex>,
  files: &[sync::RwLock<TorrentFile>],
) -> Result<CachedBlock, ReadError> {
  let mut buf = vec![0u8; len as usize];

  let files = &files[file_range];
  debug_assert!(!files.is_empty());
  let len = len as u64;

  let mut torrent_read_offset = torrent_offset;
  let mut total_read = 0u64;

  for file in files.iter() {
    let file = file.read().unwrap();

    let remaining = len - total_read;
    let file_slice = file.info.get_slice(torrent_read_offset, remaining);
    debug_assert!(file_slice.len > 0);

    let start = total_read as usize;
    let end = start + file_slice.len as usize;
    file.read_at(file_slice, &mut buf[start..end])?;

    torrent_read_offset += file_slice.len;
    total_read += file_slice.len;
  }

  debug_assert_eq!(total_read, len);

  Ok(std::sync::Arc::new(buf))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage_info::FileInfo;
  use std::path::PathBuf;

  fn temp_file(dir: &tempfile::TempDir, name: &str, info: FileInfo) -> sync::RwLock<TorrentFile> {
    sync::RwLock::new(TorrentFile::new(dir.path(), info).unwrap())
  }

  #[test]
  fn writes_and_reads_back_single_file_piece() {
    let dir = tempfile::tempdir().unwrap();
    let info = FileInfo {
      path: PathBuf::from("a.bin"),
      len: 32 * 1024,
      torrent_offset: 0,
    };
    let files = vec![temp_file(&dir, "a.bin", info)];

    let block_a = vec![1u8; 16 * 1024];
    let block_b = vec![2u8; 16 * 1024];
    let mut hasher = Sha1::new();
    hasher.update(&block_a);
    hasher.update(&block_b);
    let expected_hash: Sha1Hash = hasher.finalize().into();

    let mut blocks = BTreeMap::new();
    blocks.insert(0, block_a.clone());
    blocks.insert(16 * 1024, block_b.clone());

    let piece = Piece {
      expected_hash,
      len: 32 * 1024,
      blocks,
      file_range: 0..1,
    };
    assert!(piece.is_complete());
    assert!(piece.match_hash());
    piece.write(0, &files).unwrap();

    let read_blocks = read(0, 0..1, &files, 32 * 1024).unwrap();
    assert_eq!(read_blocks.len(), 2);
    assert_eq!(*read_blocks[0], block_a);
    assert_eq!(*read_blocks[1], block_b);
  }
}

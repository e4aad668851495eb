//! Shared helpers for the end-to-end integration tests: building a synthetic
//! torrent's metainfo by hand (no bencode round trip needed) and driving an
//! in-process mock peer over the crate's own wire codec.

use std::path::PathBuf;

use sha1::{Digest, Sha1};
use tokio::net::TcpListener;

use torrent_core::{
    metainfo::Metainfo,
    peer::link::{self, Link},
    storage_info::FileInfo,
    Bitfield, PeerId, Sha1Hash,
};

/// Deterministic, piece-distinguishing content so every piece hashes
/// differently; real torrent content obviously isn't this regular, but nothing
/// here needs it to be.
pub fn piece_content(piece_index: usize, piece_len: usize) -> Vec<u8> {
    (0..piece_len).map(|j| ((piece_index * 31 + j + 1) % 256) as u8).collect()
}

/// Builds a single-file torrent's metainfo along with the plaintext content
/// of each of its pieces, so a test can both construct the on-disk file (for
/// resume scenarios) and script a mock peer's replies (for download
/// scenarios) from the same source of truth.
pub fn build_metainfo(name: &str, piece_len: u32, piece_count: usize) -> (Metainfo, Vec<Vec<u8>>) {
    let pieces_data: Vec<Vec<u8>> =
        (0..piece_count).map(|i| piece_content(i, piece_len as usize)).collect();

    let mut pieces = Vec::with_capacity(piece_count * 20);
    for data in &pieces_data {
        pieces.extend_from_slice(&Sha1::digest(data));
    }

    let download_len: u64 = pieces_data.iter().map(|p| p.len() as u64).sum();
    let info_hash: Sha1Hash = Sha1::digest(name.as_bytes()).into();

    let metainfo = Metainfo {
        name: name.to_string(),
        info_hash,
        pieces,
        piece_len: piece_len as usize,
        files: vec![FileInfo { path: PathBuf::from(name), len: download_len, torrent_offset: 0 }],
        trackers: vec![],
    };

    (metainfo, pieces_data)
}

/// Concatenates a torrent's piece contents into the single file's bytes, for
/// tests that pre-populate a download directory to exercise resume.
pub fn concat_pieces(pieces_data: &[Vec<u8>]) -> Vec<u8> {
    pieces_data.iter().flat_map(|p| p.iter().copied()).collect()
}

pub fn bitfield(bits: &[bool]) -> Bitfield {
    bits.iter().copied().collect()
}

fn mock_peer_id(tag: u8) -> PeerId {
    let mut id = [0u8; 20];
    id[0] = b'M';
    id[1] = tag;
    id
}

/// Accepts one inbound connection from the client under test and performs
/// the receiving side of the handshake, as a seed peer the client dials out
/// to would.
pub async fn accept_from_client(
    listener: &TcpListener,
    info_hash: Sha1Hash,
    tag: u8,
) -> Link {
    let (socket, _) = listener.accept().await.expect("mock peer failed to accept");
    let (_, link) = link::accept(socket, info_hash, mock_peer_id(tag))
        .await
        .expect("mock peer handshake failed");
    link
}

/// Dials into the client under test's listener and performs the initiating
/// side of the handshake, as an inbound peer connecting to us would.
pub async fn connect_to_client(client_addr: std::net::SocketAddr, info_hash: Sha1Hash, tag: u8) -> Link {
    let (_, link) = link::connect(client_addr, info_hash, mock_peer_id(tag))
        .await
        .expect("mock peer failed to connect");
    link
}

/// Grabs an ephemeral port by briefly binding and releasing it, for handing
/// to the engine as a torrent's `listen_addr`. There is an unavoidable, tiny
/// TOCTOU window between releasing the port here and the torrent rebinding
/// it, acceptable for a test harness.
pub async fn free_addr() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind ephemeral port");
    listener.local_addr().expect("no local addr")
}

//! End-to-end: a single seed peer serves every block of a small torrent and
//! the engine reports completion.

mod support;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;

use torrent_core::{
    alert::Alert,
    conf::Conf,
    engine::{self, Mode, TorrentParams},
    peer::codec::message::Message,
    BLOCK_LEN,
};

#[tokio::test]
async fn downloads_single_piece_from_one_seed() {
    let _ = env_logger::try_init();

    let (metainfo, piece_data) = support::build_metainfo("loopback.bin", 2 * BLOCK_LEN, 1);
    let info_hash = metainfo.info_hash;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mock_addr = listener.local_addr().unwrap();

    let download_dir = tempfile::tempdir().unwrap();
    let (handle, mut alert_rx) = engine::spawn(Conf::new(download_dir.path())).unwrap();

    let id = handle
        .create_torrent(TorrentParams {
            metainfo,
            conf: None,
            mode: Mode::Download { seeds: vec![mock_addr] },
            listen_addr: None,
        })
        .unwrap();

    let mock = tokio::spawn(async move {
        let mut link = support::accept_from_client(&listener, info_hash, 1).await;
        link.send(Message::Bitfield(support::bitfield(&[true]))).await.unwrap();
        loop {
            match link.next().await {
                Some(Ok(Message::Interested)) => {
                    link.send(Message::Unchoke).await.unwrap();
                }
                Some(Ok(Message::Request(block))) => {
                    let start = block.offset as usize;
                    let end = start + block.len as usize;
                    let data = piece_data[block.piece_index][start..end].to_vec();
                    link.send(Message::Block {
                        piece_index: block.piece_index,
                        offset: block.offset,
                        data: data.into(),
                    })
                    .await
                    .unwrap();
                }
                Some(Ok(_)) => {}
                _ => break,
            }
        }
    });

    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match alert_rx.recv().await {
                Some(Alert::TorrentComplete(completed_id)) => break completed_id,
                Some(_) => continue,
                None => panic!("alert channel closed before torrent completed"),
            }
        }
    })
    .await
    .expect("torrent did not complete in time");
    assert_eq!(completed, id);

    handle.shutdown().await.unwrap();
    mock.abort();
}

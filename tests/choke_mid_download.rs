//! Once a peer expresses interest in pieces we hold, the choke scheduler
//! grants it one of the unchoke slots on its next tick.

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
async fn peer_expressing_interest_is_eventually_unchoked() {
    let _ = env_logger::try_init();

    let (metainfo, piece_data) = support::build_metainfo("choke.bin", BLOCK_LEN, 1);
    let info_hash = metainfo.info_hash;

    let seed_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seed_addr = seed_listener.local_addr().unwrap();
    let client_listen_addr = support::free_addr().await;

    let download_dir = tempfile::tempdir().unwrap();
    let (handle, mut alert_rx) = engine::spawn(Conf::new(download_dir.path())).unwrap();

    let id = handle
        .create_torrent(TorrentParams {
            metainfo,
            conf: None,
            mode: Mode::Download { seeds: vec![seed_addr] },
            listen_addr: Some(client_listen_addr),
        })
        .unwrap();

    let seed = tokio::spawn(async move {
        let mut link = support::accept_from_client(&seed_listener, info_hash, 1).await;
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

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match alert_rx.recv().await {
                Some(Alert::TorrentComplete(completed_id)) if completed_id == id => break,
                Some(_) => continue,
                None => panic!("alert channel closed before torrent completed"),
            }
        }
    })
    .await
    .expect("client did not finish downloading from the seed in time");

    let mut leecher = support::connect_to_client(client_listen_addr, info_hash, 2).await;
    leecher.send(Message::Bitfield(support::bitfield(&[false]))).await.unwrap();
    leecher.send(Message::Interested).await.unwrap();

    let unchoked = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match leecher.next().await {
                Some(Ok(Message::Unchoke)) => break,
                Some(Ok(_)) => continue,
                other => panic!("leecher connection ended before being unchoked: {:?}", other.map(|r| r.is_ok())),
            }
        }
    })
    .await;
    assert!(unchoked.is_ok(), "client never unchoked the interested leecher");

    handle.shutdown().await.unwrap();
    seed.abort();
}

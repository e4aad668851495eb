//! Once endgame mode kicks in, the same block gets requested from more than
//! one peer; whichever peer loses the race is sent an explicit cancel.

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
async fn loser_of_the_endgame_race_is_cancelled() {
    let _ = env_logger::try_init();

    // One block per piece, so completing piece 0 alone drops the missing
    // block count to 1, well under the endgame threshold.
    let (metainfo, piece_data) = support::build_metainfo("endgame.bin", BLOCK_LEN, 2);
    let info_hash = metainfo.info_hash;

    let filler_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let filler_addr = filler_listener.local_addr().unwrap();
    let client_listen_addr = support::free_addr().await;

    let download_dir = tempfile::tempdir().unwrap();
    let (handle, mut alert_rx) = engine::spawn(Conf::new(download_dir.path())).unwrap();

    let id = handle
        .create_torrent(TorrentParams {
            metainfo,
            conf: None,
            mode: Mode::Download { seeds: vec![filler_addr] },
            listen_addr: Some(client_listen_addr),
        })
        .unwrap();

    // Both racers dial in and complete their handshake before the filler is
    // even accepted, so the client has already registered both of them by
    // the time piece 0 finishes and endgame is broadcast.
    let racer_a_link = support::connect_to_client(client_listen_addr, info_hash, 2).await;
    let racer_b_link = support::connect_to_client(client_listen_addr, info_hash, 3).await;

    let piece_data_a = piece_data.clone();
    let racer_a = tokio::spawn(async move {
        let mut link = racer_a_link;
        link.send(Message::Bitfield(support::bitfield(&[false, true]))).await.unwrap();
        loop {
            match link.next().await {
                Some(Ok(Message::Interested)) => {
                    link.send(Message::Unchoke).await.unwrap();
                }
                Some(Ok(Message::Request(block))) => {
                    let start = block.offset as usize;
                    let end = start + block.len as usize;
                    let data = piece_data_a[block.piece_index][start..end].to_vec();
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

    let racer_b = tokio::spawn(async move {
        let mut link = racer_b_link;
        link.send(Message::Bitfield(support::bitfield(&[false, true]))).await.unwrap();
        let mut requested = None;
        loop {
            match link.next().await {
                Some(Ok(Message::Interested)) => {
                    link.send(Message::Unchoke).await.unwrap();
                }
                Some(Ok(Message::Request(block))) => requested = Some(block),
                Some(Ok(Message::Cancel(block))) => return requested == Some(block),
                Some(Ok(_)) => {}
                _ => return false,
            }
        }
    });

    let filler = tokio::spawn(async move {
        let mut link = support::accept_from_client(&filler_listener, info_hash, 1).await;
        link.send(Message::Bitfield(support::bitfield(&[true, false]))).await.unwrap();
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

    let cancelled = tokio::time::timeout(Duration::from_secs(15), racer_b)
        .await
        .expect("racer B was never resolved")
        .expect("racer B task panicked");
    assert!(cancelled, "racer B did not receive a cancel for the block it was racing");

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
    .expect("torrent did not complete after the endgame race resolved");
    assert_eq!(completed, id);

    handle.shutdown().await.unwrap();
    racer_a.abort();
    filler.abort();
}

//! Given a choice of pieces to download, the client asks for the one with
//! the lowest swarm-wide availability first.

mod support;

use std::time::Duration;

use futures::{SinkExt, StreamExt};

use torrent_core::{
    conf::Conf,
    engine::{self, Mode, TorrentParams},
    peer::codec::message::Message,
};

#[tokio::test]
async fn rarer_piece_is_requested_before_a_more_common_one() {
    let _ = env_logger::try_init();

    let (metainfo, _) = support::build_metainfo("rarest.bin", 16384, 2);
    let info_hash = metainfo.info_hash;

    let client_listen_addr = support::free_addr().await;

    let download_dir = tempfile::tempdir().unwrap();
    let (handle, _alert_rx) = engine::spawn(Conf::new(download_dir.path())).unwrap();

    let _id = handle
        .create_torrent(TorrentParams {
            metainfo,
            conf: None,
            mode: Mode::Download { seeds: vec![] },
            listen_addr: Some(client_listen_addr),
        })
        .unwrap();

    // `y` only has piece 1 (inflating its availability) and never unchokes,
    // so it never actually serves anything; it exists purely to make piece 1
    // look more common than piece 0 before `x` connects.
    let mut y = support::connect_to_client(client_listen_addr, info_hash, 2).await;
    y.send(Message::Bitfield(support::bitfield(&[false, true]))).await.unwrap();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), y.next())
            .await
            .expect("client never registered interest in y's piece")
        {
            Some(Ok(Message::Interested)) => break,
            Some(Ok(_)) => continue,
            other => panic!("unexpected message/closure from y: {:?}", other.map(|r| r.is_ok())),
        }
    }

    // `x` has both pieces. Having already observed `y`'s piece 1 registered
    // as available, piece 0 is now the globally rarer one, so `x` should be
    // asked for piece 0 first even though it could serve either.
    let mut x = support::connect_to_client(client_listen_addr, info_hash, 3).await;
    x.send(Message::Bitfield(support::bitfield(&[true, true]))).await.unwrap();

    let mut unchoked = false;
    let first_request = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match x.next().await {
                Some(Ok(Message::Interested)) => {
                    x.send(Message::Unchoke).await.unwrap();
                    unchoked = true;
                }
                Some(Ok(Message::Request(block))) => break block,
                Some(Ok(_)) => continue,
                other => panic!("unexpected message/closure from x: {:?}", other.map(|r| r.is_ok())),
            }
        }
    })
    .await
    .expect("client never requested anything from x");
    assert!(unchoked);
    assert_eq!(first_request.piece_index, 0, "client should prefer the rarer piece 0 over piece 1");

    handle.shutdown().await.unwrap();
}

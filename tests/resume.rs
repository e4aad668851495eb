//! A torrent whose download directory already holds the full, correct data
//! resumes as complete without needing a single peer.

mod support;

use std::time::Duration;

use torrent_core::{
    alert::Alert,
    conf::Conf,
    engine::{self, Mode, TorrentParams},
};

#[tokio::test]
async fn already_complete_data_on_disk_resumes_without_any_peers() {
    let _ = env_logger::try_init();

    let (metainfo, piece_data) = support::build_metainfo("resume.bin", 16384, 3);
    let file_name = metainfo.files[0].path.clone();

    let download_dir = tempfile::tempdir().unwrap();
    std::fs::write(download_dir.path().join(&file_name), support::concat_pieces(&piece_data)).unwrap();

    let (handle, mut alert_rx) = engine::spawn(Conf::new(download_dir.path())).unwrap();

    let id = handle
        .create_torrent(TorrentParams {
            metainfo,
            conf: None,
            mode: Mode::Download { seeds: vec![] },
            listen_addr: None,
        })
        .unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match alert_rx.recv().await {
                Some(Alert::TorrentComplete(completed_id)) => break completed_id,
                Some(_) => continue,
                None => panic!("alert channel closed before torrent resumed as complete"),
            }
        }
    })
    .await
    .expect("torrent did not resume as complete from on-disk data");
    assert_eq!(completed, id);

    handle.shutdown().await.unwrap();
}

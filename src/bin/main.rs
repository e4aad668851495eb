//! A minimal CLI front end for the torrent engine: downloads (or seeds) a
//! single torrent and exits once it completes or the engine reports a fatal
//! error.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use clap::Parser;

use torrent_core::{
    alert::Alert,
    conf::Conf,
    engine::{self, Mode, TorrentParams},
    metainfo::Metainfo,
};

#[derive(Parser, Debug)]
#[command(name = "torrent-core", about = "A BitTorrent client core")]
struct Args {
    /// Path to the .torrent file to download or seed.
    torrent: PathBuf,

    /// Directory the torrent's files are downloaded into (or seeded from).
    download_dir: PathBuf,

    /// Port to listen on for incoming peer connections. 0 disables listening.
    #[arg(long, default_value_t = 6881)]
    port: u16,

    /// Seed the torrent instead of downloading it; the download directory
    /// must already contain the complete, correct files.
    #[arg(long)]
    seed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let bytes = std::fs::read(&args.torrent)?;
    let metainfo = Metainfo::from_bytes(&bytes)?;

    let conf = Conf::new(args.download_dir);
    let (handle, mut alert_rx) = engine::spawn(conf)?;

    let mode = if args.seed {
        Mode::Seed
    } else {
        Mode::Download { seeds: Vec::new() }
    };
    let listen_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), args.port);

    let id = handle.create_torrent(TorrentParams {
        metainfo,
        conf: None,
        mode,
        listen_addr: Some(listen_addr),
    })?;

    log::info!("Torrent {} started", id);

    while let Some(alert) = alert_rx.recv().await {
        match alert {
            Alert::TorrentComplete(completed_id) if completed_id == id => {
                log::info!("Torrent {} complete", id);
                break;
            }
            Alert::Error(e) => log::error!("Engine error: {}", e),
            _ => {}
        }
    }

    handle.shutdown().await?;
    Ok(())
}

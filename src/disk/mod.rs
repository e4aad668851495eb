//! The disk task owns all on-disk torrent state and performs every write
//! and read of piece data, off the async executor, behind a bounded pool of
//! blocking workers.

use std::{collections::HashMap, sync::Arc};

use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, Semaphore,
    },
    task,
};

use crate::{
    blockinfo::BlockInfo,
    conf::DISK_WORKER_COUNT,
    engine,
    error::{DiskResult, NewTorrentError},
    peer,
    storage_info::StorageInfo,
    torrent, Bitfield, PeerId, PieceIndex, TorrentId,
};

pub mod file;
pub mod piece;
pub mod store;

use store::PieceStore;

pub type JoinHandle = task::JoinHandle<DiskResult<()>>;

/// The channel for sending commands to the disk task.
pub type Sender = UnboundedSender<Command>;
/// The channel for the disk task uses to listen for commands.
pub type Receiver = UnboundedReceiver<Command>;

/// The type of commands that the disk can execute.
#[derive(Debug)]
pub enum Command {
    /// Allocate a new torrent in `Disk`.
    NewTorrent {
        id: TorrentId,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
        torrent_tx: torrent::Sender,
    },
    /// Request to eventually write a block to disk.
    WriteBlock {
        id: TorrentId,
        block_info: BlockInfo,
        data: Vec<u8>,
    },
    /// Request to eventually read a block from disk and return it via the
    /// sender.
    ReadBlock {
        id: TorrentId,
        block_info: BlockInfo,
        result_tx: peer::Sender,
    },
    /// Picks a piece for `peer_id` to download, among those set in `have`,
    /// using rarest-first selection, and marks it reserved. Answered on
    /// `result_tx` with `None` if the peer has nothing useful left to
    /// offer.
    ///
    /// Outside endgame, a piece already reserved to another peer is never a
    /// candidate; `endgame` lifts that restriction so the same piece can be
    /// raced against multiple peers.
    ///
    /// This only touches in-memory bookkeeping (not the files themselves),
    /// so unlike the other commands it's answered inline rather than
    /// dispatched to a blocking worker.
    ReservePiece {
        id: TorrentId,
        peer_id: PeerId,
        have: Bitfield,
        endgame: bool,
        result_tx: oneshot::Sender<Option<PieceIndex>>,
    },
    /// Releases `peer_id`'s claim on `index`, e.g. because it disconnected
    /// or choked us.
    ReleaseReservation {
        id: TorrentId,
        index: PieceIndex,
        peer_id: PeerId,
    },
    /// Registers a peer's full bitfield, just received, against the
    /// torrent's piece availability counter.
    RegisterAvailability { id: TorrentId, have: Bitfield },
    /// Registers a single piece a peer just announced via a `have` message.
    NotePieceAvailable { id: TorrentId, index: PieceIndex },
    /// Reverses a disconnected peer's contribution to the availability
    /// counter, carrying the last bitfield we knew it by.
    ForgetAvailability { id: TorrentId, have: Bitfield },
    /// Asks for a snapshot of the torrent's piece completion status, e.g. to
    /// build the bitfield sent to a newly connected peer, or to decide
    /// whether the torrent as a whole is complete.
    QueryStatus {
        id: TorrentId,
        result_tx: oneshot::Sender<TorrentStatus>,
    },
    /// Eventually shutdown the disk task.
    Shutdown,
}

/// A snapshot of a torrent's piece completion, returned by
/// [`Command::QueryStatus`].
#[derive(Debug, Clone)]
pub struct TorrentStatus {
    pub own_pieces: Bitfield,
    pub missing_piece_count: usize,
    pub is_complete: bool,
}

/// Spawns the disk task, which runs until it receives [`Command::Shutdown`].
///
/// `engine_tx` is used to report the result of allocating a new torrent's
/// files back to the engine, which isn't otherwise on the disk task's
/// command path.
pub fn spawn(engine_tx: engine::Sender) -> DiskResult<(JoinHandle, Sender)> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let mut disk = Disk {
        torrents: HashMap::new(),
        cmd_rx,
        engine_tx,
        // bounds how many blocking disk operations run concurrently, across
        // all torrents, regardless of how many are queued up.
        worker_permits: Arc::new(Semaphore::new(DISK_WORKER_COUNT)),
    };
    let join_handle = task::spawn(async move { disk.run().await });
    Ok((join_handle, cmd_tx))
}

struct TorrentEntry {
    store: Arc<std::sync::Mutex<PieceStore>>,
    torrent_tx: torrent::Sender,
}

struct Disk {
    torrents: HashMap<TorrentId, TorrentEntry>,
    cmd_rx: Receiver,
    engine_tx: engine::Sender,
    worker_permits: Arc<Semaphore>,
}

impl Disk {
    async fn run(&mut self) -> DiskResult<()> {
        log::info!("Starting disk task");
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    storage_info,
                    piece_hashes,
                    torrent_tx,
                } => self.new_torrent(id, storage_info, piece_hashes, torrent_tx).await,
                Command::WriteBlock { id, block_info, data } => {
                    self.write_block(id, block_info, data).await
                }
                Command::ReadBlock { id, block_info, result_tx } => {
                    self.read_block(id, block_info, result_tx).await
                }
                Command::ReservePiece { id, peer_id, have, endgame, result_tx } => {
                    self.reserve_piece(id, peer_id, have, endgame, result_tx)
                }
                Command::ReleaseReservation { id, index, peer_id } => {
                    self.release_reservation(id, index, peer_id)
                }
                Command::RegisterAvailability { id, have } => self.register_availability(id, have),
                Command::NotePieceAvailable { id, index } => self.note_piece_available(id, index),
                Command::ForgetAvailability { id, have } => self.forget_availability(id, have),
                Command::QueryStatus { id, result_tx } => self.query_status(id, result_tx),
                Command::Shutdown => break,
            }
        }
        log::info!("Disk task stopped");
        Ok(())
    }

    async fn new_torrent(
        &mut self,
        id: TorrentId,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
        torrent_tx: torrent::Sender,
    ) {
        let download_dir = storage_info.download_dir.clone();

        let permit = self.worker_permits.clone().acquire_owned().await.unwrap();
        let result = task::spawn_blocking(move || {
            let _permit = permit;
            let mut store = PieceStore::new(&download_dir, storage_info, piece_hashes)?;
            let resumed = store.verify_existing().map_err(|e| {
                NewTorrentError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            })?;
            Ok::<_, NewTorrentError>((store, resumed))
        })
        .await
        .expect("disk worker panicked");

        let allocation_result = match result {
            Ok((store, resumed)) => {
                for index in resumed {
                    torrent_tx
                        .send(torrent::Command::PieceCompletion(Ok(torrent::PieceCompletion {
                            index,
                            is_valid: true,
                        })))
                        .ok();
                }
                self.torrents.insert(
                    id,
                    TorrentEntry {
                        store: Arc::new(std::sync::Mutex::new(store)),
                        torrent_tx,
                    },
                );
                Ok(())
            }
            Err(e) => Err(e),
        };

        self.engine_tx
            .send(engine::Command::TorrentAllocation { id, result: allocation_result })
            .ok();
    }

    async fn write_block(&mut self, id: TorrentId, block_info: BlockInfo, data: Vec<u8>) {
        let Some(entry) = self.torrents.get(&id) else {
            log::warn!("Write for unknown torrent {}", id);
            return;
        };
        let store = entry.store.clone();
        let torrent_tx = entry.torrent_tx.clone();
        let permit = self.worker_permits.clone().acquire_owned().await.unwrap();

        task::spawn(async move {
            let result = task::spawn_blocking(move || {
                let _permit = permit;
                store.lock().unwrap().submit_block(block_info, data)
            })
            .await
            .expect("disk worker panicked");

            let cmd = match result {
                Ok(Some(is_valid)) => Some(torrent::Command::PieceCompletion(Ok(torrent::PieceCompletion {
                    index: block_info.piece_index,
                    is_valid,
                }))),
                Ok(None) => None,
                Err(e) => Some(torrent::Command::PieceCompletion(Err(e))),
            };
            if let Some(cmd) = cmd {
                torrent_tx.send(cmd).ok();
            }
        });
    }

    async fn read_block(&mut self, id: TorrentId, block_info: BlockInfo, result_tx: peer::Sender) {
        let Some(entry) = self.torrents.get(&id) else {
            log::warn!("Read for unknown torrent {}", id);
            return;
        };
        let store = entry.store.clone();
        let permit = self.worker_permits.clone().acquire_owned().await.unwrap();

        task::spawn(async move {
            let result = task::spawn_blocking(move || {
                let _permit = permit;
                store.lock().unwrap().read_block(block_info)
            })
            .await
            .expect("disk worker panicked");

            let cmd = match result {
                Ok(data) => peer::Command::BlockReady { block_info, data },
                Err(error) => peer::Command::ReadError { block_info, error },
            };
            result_tx.send(cmd).ok();
        });
    }

    fn reserve_piece(
        &mut self,
        id: TorrentId,
        peer_id: PeerId,
        have: Bitfield,
        endgame: bool,
        result_tx: oneshot::Sender<Option<PieceIndex>>,
    ) {
        let Some(entry) = self.torrents.get(&id) else {
            log::warn!("Reservation request for unknown torrent {}", id);
            result_tx.send(None).ok();
            return;
        };
        let index = entry.store.lock().unwrap().reserve_piece(peer_id, &have, endgame);
        result_tx.send(index).ok();
    }

    fn release_reservation(&mut self, id: TorrentId, index: PieceIndex, peer_id: PeerId) {
        if let Some(entry) = self.torrents.get(&id) {
            entry.store.lock().unwrap().release_reservation(index, peer_id);
        }
    }

    fn register_availability(&mut self, id: TorrentId, have: Bitfield) {
        if let Some(entry) = self.torrents.get(&id) {
            entry.store.lock().unwrap().register_availability(&have);
        }
    }

    fn note_piece_available(&mut self, id: TorrentId, index: PieceIndex) {
        if let Some(entry) = self.torrents.get(&id) {
            entry.store.lock().unwrap().register_piece_availability(index);
        }
    }

    fn forget_availability(&mut self, id: TorrentId, have: Bitfield) {
        if let Some(entry) = self.torrents.get(&id) {
            entry.store.lock().unwrap().forget_availability(&have);
        }
    }

    fn query_status(&mut self, id: TorrentId, result_tx: oneshot::Sender<TorrentStatus>) {
        let Some(entry) = self.torrents.get(&id) else {
            log::warn!("Status query for unknown torrent {}", id);
            return;
        };
        let store = entry.store.lock().unwrap();
        let status = TorrentStatus {
            own_pieces: store.own_bitfield(),
            missing_piece_count: store.missing_piece_count(),
            is_complete: store.is_complete(),
        };
        result_tx.send(status).ok();
    }
}

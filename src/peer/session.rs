//! Drives a single peer connection: reads and reacts to wire messages,
//! executes commands sent down from the torrent and the disk task, and
//! keeps the request pipeline filled while we're interested and unchoked.

use std::{collections::HashSet, net::SocketAddr, time::Instant};

use tokio::{net::TcpStream, sync::oneshot};

use crate::{
    blockinfo::BlockInfo,
    conf::{PEER_IDLE_TIMEOUT, SESSION_TICK_INTERVAL},
    counter::ThruputCounters,
    disk,
    error::peer::{PeerError, Result},
    storage_info::StorageInfo,
    torrent, Bitfield, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

use super::{
    codec::message::Message,
    link::{self, Link, PeerLink},
    pipeline::RequestPipeline,
    scorer::PeerScorer,
    Command, Receiver, Sender, SessionState, SessionTick,
};

/// Immutable parameters a session needs for its whole lifetime, shared by
/// every peer the torrent connects to or accepts.
#[derive(Clone)]
pub struct SessionParams {
    pub torrent_id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub piece_count: usize,
    pub storage_info: StorageInfo,
    pub disk_tx: disk::Sender,
    pub torrent_tx: torrent::Sender,
}

/// Performs the outbound side of the handshake and runs the session.
pub async fn run_outbound(
    addr: SocketAddr,
    params: SessionParams,
    self_tx: Sender,
    cmd_rx: Receiver,
) -> Result<()> {
    let (remote_id, link) = link::connect(addr, params.info_hash, params.client_id).await?;
    Session::new(addr, remote_id, link, params, self_tx, cmd_rx).run().await
}

/// Performs the inbound side of the handshake on an already accepted socket
/// and runs the session.
pub async fn run_inbound(
    addr: SocketAddr,
    socket: TcpStream,
    params: SessionParams,
    self_tx: Sender,
    cmd_rx: Receiver,
) -> Result<()> {
    let (remote_id, link) = link::accept(socket, params.info_hash, params.client_id).await?;
    Session::new(addr, remote_id, link, params, self_tx, cmd_rx).run().await
}

struct Session {
    addr: SocketAddr,
    remote_id: PeerId,
    link: PeerLink,
    params: SessionParams,
    self_tx: Sender,
    cmd_rx: Receiver,

    pipeline: RequestPipeline,
    scorer: PeerScorer,
    counters: ThruputCounters,

    peer_have: Bitfield,
    /// A local snapshot of our own completed pieces, refreshed once at
    /// startup and kept current via [`Command::PieceCompletion`] so that
    /// checking interest doesn't need a disk round trip per message.
    own_pieces: Bitfield,
    bitfield_received: bool,
    am_interested: bool,
    peer_choking_us: bool,
    peer_interested: bool,
    choking_peer: bool,
    endgame: bool,

    /// Pieces this session itself fully delivered but whose validation
    /// result hasn't come back from the disk task yet.
    delivered_pieces: HashSet<PieceIndex>,
    last_activity: Instant,
}

impl Session {
    fn new(
        addr: SocketAddr,
        remote_id: PeerId,
        link: Link,
        params: SessionParams,
        self_tx: Sender,
        cmd_rx: Receiver,
    ) -> Self {
        let piece_count = params.piece_count;
        Self {
            addr,
            remote_id,
            link: PeerLink::new(link),
            params,
            self_tx,
            cmd_rx,
            pipeline: RequestPipeline::new(),
            scorer: PeerScorer::new(),
            counters: ThruputCounters::new(),
            peer_have: Bitfield::repeat(false, piece_count),
            own_pieces: Bitfield::repeat(false, piece_count),
            bitfield_received: false,
            am_interested: false,
            peer_choking_us: true,
            peer_interested: false,
            choking_peer: true,
            endgame: false,
            delivered_pieces: HashSet::new(),
            last_activity: Instant::now(),
        }
    }

    async fn run(mut self) -> Result<()> {
        self.params
            .torrent_tx
            .send(torrent::Command::PeerConnected { addr: self.addr, id: self.remote_id })?;

        self.send_initial_bitfield().await;

        let mut tick = tokio::time::interval(SESSION_TICK_INTERVAL);
        let result = loop {
            tokio::select! {
                msg = self.link.recv() => {
                    match msg {
                        Some(Ok(msg)) => {
                            self.last_activity = Instant::now();
                            if let Err(e) = self.handle_message(msg).await {
                                break Err(e);
                            }
                        }
                        Some(Err(e)) => break Err(e),
                        None => break Ok(()),
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => break Ok(()),
                        Some(cmd) => {
                            if let Err(e) = self.handle_command(cmd).await {
                                break Err(e);
                            }
                        }
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = self.on_tick().await {
                        break Err(e);
                    }
                }
            }
        };

        self.params
            .disk_tx
            .send(disk::Command::ForgetAvailability {
                id: self.params.torrent_id,
                have: self.peer_have.clone(),
            })
            .ok();
        self.params
            .torrent_tx
            .send(torrent::Command::PeerDisconnected { addr: self.addr, counters: self.counters })
            .ok();

        result
    }

    async fn send_initial_bitfield(&mut self) {
        let (tx, rx) = oneshot::channel();
        if self
            .params
            .disk_tx
            .send(disk::Command::QueryStatus { id: self.params.torrent_id, result_tx: tx })
            .is_err()
        {
            return;
        }
        if let Ok(status) = rx.await {
            self.own_pieces = status.own_pieces.clone();
            if status.missing_piece_count < self.params.piece_count {
                self.link.try_send(Message::Bitfield(status.own_pieces)).ok();
            }
        }
    }

    async fn on_tick(&mut self) -> Result<()> {
        self.scorer.tick(SESSION_TICK_INTERVAL);

        if self.last_activity.elapsed() > PEER_IDLE_TIMEOUT {
            return Err(PeerError::InactivityTimeout);
        }

        for block in self.pipeline.timed_out_requests() {
            self.pipeline.cancel(&block);
        }

        if !self.peer_choking_us && self.am_interested {
            self.fill_requests().await?;
        }

        self.params
            .torrent_tx
            .send(torrent::Command::PeerState {
                addr: self.addr,
                info: SessionTick {
                    state: SessionState::Connected,
                    counters: self.counters,
                    piece_count: self.peer_have.count_ones(),
                    peer_interested: self.peer_interested,
                    choking_peer: self.choking_peer,
                },
            })
            .ok();

        Ok(())
    }

    /// Tops up the request pipeline, reserving new pieces from the disk
    /// task's rarest-first picker as the current ones run low.
    async fn fill_requests(&mut self) -> Result<()> {
        loop {
            let (blocks, remaining) = self.pipeline.fill();
            for block in blocks {
                self.link.try_send(Message::Request(block))?;
            }
            if remaining == 0 {
                break;
            }

            let (tx, rx) = oneshot::channel();
            self.params.disk_tx.send(disk::Command::ReservePiece {
                id: self.params.torrent_id,
                peer_id: self.remote_id,
                have: self.peer_have.clone(),
                endgame: self.endgame,
                result_tx: tx,
            })?;

            match rx.await {
                Ok(Some(index)) => {
                    let piece_len = self
                        .params
                        .storage_info
                        .piece_len(index)
                        .map_err(|_| PeerError::InvalidPieceIndex)?;
                    self.pipeline.start_piece(index, piece_len);
                }
                _ => break,
            }
        }
        Ok(())
    }

    async fn handle_message(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Bitfield(bitfield) => {
                if self.bitfield_received {
                    return Err(PeerError::BitfieldNotAfterHandshake);
                }
                if bitfield.len() != self.params.piece_count {
                    return Err(PeerError::OversizeBitfield);
                }
                self.bitfield_received = true;
                self.peer_have = bitfield;
                self.params
                    .disk_tx
                    .send(disk::Command::RegisterAvailability {
                        id: self.params.torrent_id,
                        have: self.peer_have.clone(),
                    })
                    .ok();
                self.update_interest().await?;
            }
            Message::Choke => {
                self.peer_choking_us = true;
                self.pipeline.clear_requests();
            }
            Message::Unchoke => {
                self.peer_choking_us = false;
                self.fill_requests().await?;
            }
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have { piece_index } => {
                if piece_index >= self.params.piece_count {
                    return Err(PeerError::InvalidPieceIndex);
                }
                let already_had = self.peer_have.get(piece_index).map(|b| *b).unwrap_or(false);
                self.peer_have.set(piece_index, true);
                if !already_had {
                    self.params
                        .disk_tx
                        .send(disk::Command::NotePieceAvailable {
                            id: self.params.torrent_id,
                            index: piece_index,
                        })
                        .ok();
                }
                self.update_interest().await?;
            }
            Message::Request(block_info) => {
                if self.choking_peer {
                    return Err(PeerError::RequestWhileChocked);
                }
                self.params.disk_tx.send(disk::Command::ReadBlock {
                    id: self.params.torrent_id,
                    block_info,
                    result_tx: self.self_tx.clone(),
                })?;
            }
            Message::Block { piece_index, offset, data } => {
                let data = data.into_owned();
                let block = BlockInfo { piece_index, offset, len: data.len() as u32 };
                self.scorer.record_delivery(block.len as u64);
                self.counters.block_download.add(block.len as u64);
                self.counters.payload_download.add(block.len as u64);

                if !self.pipeline.is_outstanding(&block) {
                    log::debug!("Dropping unsolicited block {}", block);
                    return Ok(());
                }
                if self.endgame {
                    self.params
                        .torrent_tx
                        .send(torrent::Command::BlockArrived { addr: self.addr, block })
                        .ok();
                }
                if self.pipeline.receive_block(block).is_some() {
                    self.delivered_pieces.insert(block.piece_index);
                }
                self.params.disk_tx.send(disk::Command::WriteBlock {
                    id: self.params.torrent_id,
                    block_info: block,
                    data,
                })?;
            }
            Message::Cancel(_) => {
                // We serve requests as soon as they're read off disk; by the
                // time a cancel would reach us the block has often already
                // been queued for sending, so there is nothing to undo here.
            }
        }
        Ok(())
    }

    async fn update_interest(&mut self) -> Result<()> {
        let has_useful_piece = (0..self.params.piece_count).any(|i| {
            self.peer_have.get(i).map(|b| *b).unwrap_or(false)
                && !self.own_pieces.get(i).map(|b| *b).unwrap_or(true)
        });

        if has_useful_piece && !self.am_interested {
            self.am_interested = true;
            self.link.try_send(Message::Interested)?;
        } else if !has_useful_piece && self.am_interested {
            self.am_interested = false;
            self.link.try_send(Message::NotInterested)?;
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::PieceCompletion { index, is_valid } => {
                if self.delivered_pieces.remove(&index) {
                    if is_valid {
                        self.scorer.record_valid_piece();
                    } else {
                        self.scorer.record_corrupt_piece();
                        self.params
                            .torrent_tx
                            .send(torrent::Command::CorruptPiece { peer_id: self.remote_id })
                            .ok();
                    }
                }
                self.pipeline.abandon_piece(index);
                if is_valid {
                    self.own_pieces.set(index, true);
                    let peer_already_has_it =
                        self.peer_have.get(index).map(|b| *b).unwrap_or(true);
                    if !peer_already_has_it {
                        self.link.try_send(Message::Have { piece_index: index })?;
                    }
                    self.update_interest().await?;
                }
            }
            Command::BlockReady { block_info, data } => {
                self.counters.block_upload.add(block_info.len as u64);
                self.counters.payload_upload.add(block_info.len as u64);
                self.link.try_send(Message::Block {
                    piece_index: block_info.piece_index,
                    offset: block_info.offset,
                    data: data.into(),
                })?;
            }
            Command::ReadError { block_info, error } => {
                log::warn!("Failed to read {} for peer {}: {}", block_info, self.addr, error);
            }
            Command::SetChoked(choked) => {
                self.choking_peer = choked;
                self.link
                    .try_send(if choked { Message::Choke } else { Message::Unchoke })?;
            }
            Command::SetEndgame(endgame) => {
                self.endgame = endgame;
                self.pipeline.set_endgame(endgame);
            }
            Command::CancelBlock(block) => {
                if self.pipeline.is_outstanding(&block) {
                    self.pipeline.cancel(&block);
                    self.link.try_send(Message::Cancel(block))?;
                }
            }
            Command::Shutdown => unreachable!("handled by the caller"),
        }
        Ok(())
    }
}

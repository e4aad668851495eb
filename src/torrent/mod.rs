//! The session coordinator: owns a torrent's peer table, drives the choke
//! scheduler and tracker re-announces, and fans piece completions and
//! endgame transitions out to every connected peer session.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    time::Instant,
};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task, time,
};

use crate::{
    alert::{Alert, AlertSender},
    blockinfo,
    choke::{ChokeScheduler, PeerSnapshot},
    conf::{TorrentConf, CHOKE_TICK_INTERVAL, ENDGAME_BLOCK_THRESHOLD, PEER_CORRUPTION_BAN_THRESHOLD},
    counter::ThruputCounters,
    disk,
    error::{disk::WriteError, torrent::Result as TorrentResult, Error},
    peer::{self, session::SessionParams, SessionState, SessionTick},
    storage_info::StorageInfo,
    tracker::{
        announce::{Announce, Event},
        client::{self, TrackerClient},
    },
    Bitfield, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

pub mod stats;

use stats::TorrentStats;

/// The channel on which the engine and peer sessions send commands to a
/// torrent.
pub type Sender = UnboundedSender<Command>;
/// The channel on which a torrent listens for commands.
pub type Receiver = UnboundedReceiver<Command>;

/// The type returned on completing a piece.
#[derive(Debug)]
pub struct PieceCompletion {
    /// The index of the piece.
    pub index: PieceIndex,
    /// Whether the piece is valid. If it's not, it's not written to disk.
    pub is_valid: bool,
}

/// Commands that flow into a torrent from the disk task, the engine, or one
/// of its own peer sessions.
#[derive(Debug)]
pub enum Command {
    /// Sent when some blocks were written to disk or an error occurred
    /// while writing.
    PieceCompletion(Result<PieceCompletion, WriteError>),

    /// A message sent only once, after a peer session has completed its
    /// handshake.
    PeerConnected { addr: SocketAddr, id: PeerId },

    /// Peer sessions periodically send this to report their latest state.
    PeerState { addr: SocketAddr, info: SessionTick },

    /// A peer session has exited, carrying its final transfer counters.
    PeerDisconnected { addr: SocketAddr, counters: ThruputCounters },

    /// A peer session attributes a just-failed piece hash check to the
    /// remote peer it downloaded the piece from.
    CorruptPiece { peer_id: PeerId },

    /// A peer session received `block` while in endgame mode; broadcast a
    /// cancel to every other session so they can drop their own outstanding
    /// request for the same block.
    BlockArrived { addr: SocketAddr, block: crate::blockinfo::BlockInfo },

    /// A backgrounded tracker announce (one that lost the race in
    /// [`client::announce_all`]) came back with more peers.
    PeersDiscovered(Vec<SocketAddr>),

    /// Gracefully shuts down the torrent.
    ///
    /// This command tells all active peer sessions of the torrent to do the
    /// same, waits for them, and announces our exit to trackers.
    Shutdown,
}

/// Parameters needed to construct a torrent.
pub struct Params {
    pub id: TorrentId,
    pub disk_tx: disk::Sender,
    pub info_hash: Sha1Hash,
    pub storage_info: StorageInfo,
    pub own_pieces: Bitfield,
    pub trackers: Vec<TrackerClient>,
    pub client_id: PeerId,
    pub listen_addr: SocketAddr,
    pub conf: TorrentConf,
    pub alert_tx: AlertSender,
}

/// A single connected (or connecting) peer, as tracked by the torrent.
struct PeerEntry {
    cmd_tx: peer::Sender,
    peer_id: Option<PeerId>,
    state: SessionState,
    piece_count: usize,
    peer_interested: bool,
    we_are_choking: bool,
    counters: ThruputCounters,
    download_rate: f64,
    last_block_download_total: u64,
    last_tick_at: Instant,
    join_handle: task::JoinHandle<crate::error::PeerResult<()>>,
}

impl PeerEntry {
    fn new(
        cmd_tx: peer::Sender,
        join_handle: task::JoinHandle<crate::error::PeerResult<()>>,
    ) -> Self {
        Self {
            cmd_tx,
            peer_id: None,
            state: SessionState::Connecting,
            piece_count: 0,
            peer_interested: false,
            we_are_choking: true,
            counters: ThruputCounters::new(),
            download_rate: 0.0,
            last_block_download_total: 0,
            last_tick_at: Instant::now(),
            join_handle,
        }
    }

    fn apply_tick(&mut self, info: SessionTick) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_tick_at).as_secs_f64().max(0.001);

        let download_total = info.counters.block_download.total();
        self.download_rate =
            download_total.saturating_sub(self.last_block_download_total) as f64 / elapsed;
        self.last_block_download_total = download_total;
        self.last_tick_at = now;

        self.state = info.state;
        self.counters = info.counters;
        self.piece_count = info.piece_count;
        self.peer_interested = info.peer_interested;
    }
}

pub struct Torrent {
    id: TorrentId,
    info_hash: Sha1Hash,
    client_id: PeerId,
    disk_tx: disk::Sender,
    storage_info: StorageInfo,
    trackers: Vec<TrackerClient>,
    listen_addr: SocketAddr,
    conf: TorrentConf,
    alert_tx: AlertSender,

    cmd_rx: Receiver,
    self_tx: Sender,

    peers: HashMap<SocketAddr, PeerEntry>,
    choke: ChokeScheduler,
    stats: TorrentStats,

    completed_pieces: HashSet<PieceIndex>,
    corrupt_counts: HashMap<PeerId, u32>,
    banned: HashSet<PeerId>,
    endgame: bool,
    is_complete: bool,
}

impl Torrent {
    /// Builds a torrent, returning it along with the sender other parts of
    /// the engine use to command it.
    pub fn new(params: Params) -> (Self, Sender) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let mut stats = TorrentStats::new();
        stats.piece_count = params.storage_info.piece_count;
        stats.missing_piece_count = params.storage_info.piece_count;

        let torrent = Self {
            id: params.id,
            info_hash: params.info_hash,
            client_id: params.client_id,
            disk_tx: params.disk_tx,
            storage_info: params.storage_info,
            trackers: params.trackers,
            listen_addr: params.listen_addr,
            conf: params.conf,
            alert_tx: params.alert_tx,
            cmd_rx,
            self_tx: cmd_tx.clone(),
            peers: HashMap::new(),
            choke: ChokeScheduler::new(),
            stats,
            completed_pieces: HashSet::new(),
            corrupt_counts: HashMap::new(),
            banned: HashSet::new(),
            endgame: false,
            is_complete: params.own_pieces.count_ones() == params.own_pieces.len()
                && !params.own_pieces.is_empty(),
        };
        (torrent, cmd_tx)
    }

    /// Runs the torrent until it's told to shut down.
    ///
    /// Connects to `seeds` right away, then drives the torrent's event loop:
    /// incoming commands, inbound connections, tracker re-announces and
    /// choke ticks.
    pub async fn start(&mut self, seeds: &[SocketAddr]) -> TorrentResult<()> {
        log::info!("Starting torrent {}", self.id);

        let listener = if self.listen_addr.port() != 0 {
            match TcpListener::bind(self.listen_addr).await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    log::warn!("Torrent {} failed to bind {}: {}", self.id, self.listen_addr, e);
                    None
                }
            }
        } else {
            None
        };

        for addr in seeds {
            self.connect_peer(*addr);
        }

        if !self.trackers.is_empty() {
            self.announce(Some(Event::Started)).await;
        }

        let mut announce_tick = time::interval(self.conf.announce_interval);
        announce_tick.tick().await;
        let mut choke_tick = time::interval(CHOKE_TICK_INTERVAL);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                accepted = accept(&listener) => {
                    match accepted {
                        Ok((socket, addr)) => self.accept_peer(socket, addr),
                        Err(e) => log::warn!("Torrent {} accept error: {}", self.id, e),
                    }
                }
                _ = announce_tick.tick() => {
                    self.announce(None).await;
                }
                _ = choke_tick.tick() => {
                    self.run_choke_tick();
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::PieceCompletion(Ok(completion)) => self.on_piece_completion(completion),
            Command::PieceCompletion(Err(e)) => {
                log::error!("Torrent {} failed to write piece: {}", self.id, e);
            }
            Command::PeerConnected { addr, id } => {
                if let Some(entry) = self.peers.get_mut(&addr) {
                    entry.peer_id = Some(id);
                    entry.state = SessionState::Connected;
                }
            }
            Command::PeerState { addr, info } => {
                if let Some(entry) = self.peers.get_mut(&addr) {
                    entry.apply_tick(info);
                }
            }
            Command::PeerDisconnected { addr, counters } => {
                self.stats.retire_session(counters);
                self.peers.remove(&addr);
            }
            Command::CorruptPiece { peer_id } => self.on_corrupt_piece(peer_id),
            Command::BlockArrived { addr, block } => self.on_block_arrived(addr, block),
            Command::PeersDiscovered(peers) => {
                for addr in peers {
                    self.connect_peer(addr);
                }
            }
            Command::Shutdown => unreachable!("handled by the caller"),
        }
    }

    fn on_piece_completion(&mut self, completion: PieceCompletion) {
        let PieceCompletion { index, is_valid } = completion;

        if is_valid && self.completed_pieces.insert(index) {
            self.stats.missing_piece_count =
                self.storage_info.piece_count - self.completed_pieces.len();
            if self.completed_pieces.len() == self.storage_info.piece_count {
                self.is_complete = true;
                self.alert_tx.send(Alert::TorrentComplete(self.id)).ok();
            }
        }

        for peer in self.peers.values() {
            peer.cmd_tx.send(peer::Command::PieceCompletion { index, is_valid }).ok();
        }

        self.update_endgame();
    }

    fn on_corrupt_piece(&mut self, peer_id: PeerId) {
        let count = self.corrupt_counts.entry(peer_id).or_insert(0);
        *count += 1;
        if *count < PEER_CORRUPTION_BAN_THRESHOLD {
            return;
        }

        log::warn!("Banning peer {:?}: too many corrupt pieces", peer_id);
        self.banned.insert(peer_id);
        for entry in self.peers.values().filter(|p| p.peer_id == Some(peer_id)) {
            entry.cmd_tx.send(peer::Command::Shutdown).ok();
        }
    }

    fn on_block_arrived(&mut self, addr: SocketAddr, block: crate::blockinfo::BlockInfo) {
        for (peer_addr, peer) in self.peers.iter() {
            if *peer_addr == addr {
                continue;
            }
            peer.cmd_tx.send(peer::Command::CancelBlock(block)).ok();
        }
    }

    fn update_endgame(&mut self) {
        let missing_pieces = self.storage_info.piece_count - self.completed_pieces.len();
        let missing_blocks = missing_pieces * blockinfo::block_count(self.storage_info.piece_len);
        let endgame = missing_blocks <= ENDGAME_BLOCK_THRESHOLD;
        if endgame != self.endgame {
            self.endgame = endgame;
            for peer in self.peers.values() {
                peer.cmd_tx.send(peer::Command::SetEndgame(endgame)).ok();
            }
        }
    }

    fn run_choke_tick(&mut self) {
        let download_rate: f64 = self.peers.values().map(|p| p.download_rate).sum();
        let snapshots: Vec<PeerSnapshot> = self
            .peers
            .iter()
            .filter(|(_, p)| p.peer_id.is_some())
            .map(|(addr, p)| PeerSnapshot {
                addr: *addr,
                download_rate: p.download_rate,
                interested: p.peer_interested,
                unchoked: !p.we_are_choking,
            })
            .collect();

        let decision = self.choke.tick(&snapshots, download_rate);

        for (addr, entry) in self.peers.iter_mut() {
            let should_unchoke = decision.unchoked.contains(addr);
            if should_unchoke == !entry.we_are_choking {
                continue;
            }
            entry.we_are_choking = !should_unchoke;
            entry.cmd_tx.send(peer::Command::SetChoked(entry.we_are_choking)).ok();
        }
    }

    fn connect_peer(&mut self, addr: SocketAddr) {
        if !self.can_accept_peer(addr) {
            return;
        }
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let params = self.session_params();
        let self_tx = cmd_tx.clone();
        let join_handle =
            task::spawn(async move { peer::session::run_outbound(addr, params, self_tx, cmd_rx).await });
        self.peers.insert(addr, PeerEntry::new(cmd_tx, join_handle));
    }

    fn accept_peer(&mut self, socket: TcpStream, addr: SocketAddr) {
        if !self.can_accept_peer(addr) {
            return;
        }
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let params = self.session_params();
        let self_tx = cmd_tx.clone();
        let join_handle = task::spawn(async move {
            peer::session::run_inbound(addr, socket, params, self_tx, cmd_rx).await
        });
        self.peers.insert(addr, PeerEntry::new(cmd_tx, join_handle));
    }

    fn can_accept_peer(&self, addr: SocketAddr) -> bool {
        !self.peers.contains_key(&addr) && self.peers.len() < self.conf.max_connected_peer_count
    }

    fn session_params(&self) -> SessionParams {
        SessionParams {
            torrent_id: self.id,
            info_hash: self.info_hash,
            client_id: self.client_id,
            piece_count: self.storage_info.piece_count,
            storage_info: self.storage_info.clone(),
            disk_tx: self.disk_tx.clone(),
            torrent_tx: self.self_tx.clone(),
        }
    }

    async fn announce(&mut self, event: Option<Event>) {
        if self.trackers.is_empty() {
            return;
        }

        let aggregate = self.stats.aggregate(self.peers.values().map(|p| &p.counters));
        let announce = Announce {
            info_hash: self.info_hash,
            peer_id: self.client_id,
            port: self.listen_addr.port(),
            ip: None,
            downloaded: aggregate.payload_download.total(),
            uploaded: aggregate.payload_upload.total(),
            left: self.bytes_left(),
            peer_count: Some(self.conf.min_requested_peer_count),
            tracker_id: None,
            event,
        };

        match client::announce_all(&self.trackers, &announce, self.self_tx.clone()).await {
            Ok(peers) => {
                for addr in peers {
                    self.connect_peer(addr);
                }
            }
            Err(e) => {
                log::warn!("Torrent {} announce failed: {}", self.id, e);
                self.alert_tx.send(Alert::Error(Error::Tracker { id: self.id, error: e })).ok();
            }
        }
    }

    fn bytes_left(&self) -> u64 {
        let completed_bytes: u64 = self
            .completed_pieces
            .iter()
            .filter_map(|&index| self.storage_info.piece_len(index).ok())
            .map(|len| len as u64)
            .sum();
        self.storage_info.download_len.saturating_sub(completed_bytes)
    }

    async fn shutdown(&mut self) {
        log::info!("Shutting down torrent {}", self.id);

        for peer in self.peers.values() {
            peer.cmd_tx.send(peer::Command::Shutdown).ok();
        }
        for (_, peer) in self.peers.drain() {
            peer.join_handle.await.ok();
        }

        if !self.trackers.is_empty() {
            self.announce(Some(Event::Stopped)).await;
        }
    }
}

/// Awaits the next inbound connection if `listener` is bound, or never
/// resolves otherwise, so it can be used unconditionally in a `select!`.
async fn accept(listener: &Option<TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

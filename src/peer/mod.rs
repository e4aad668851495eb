use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{
    blockinfo::{BlockInfo, CachedBlock},
    counter::ThruputCounters,
    error::disk::ReadError,
    PieceIndex,
};

pub mod codec;
pub mod link;
pub mod pipeline;
pub mod scorer;
pub mod session;

/// The channel on which a torrent (or the disk task) sends commands to a
/// peer session.
pub type Sender = UnboundedSender<Command>;
/// The channel on which a peer session listens for commands.
pub type Receiver = UnboundedReceiver<Command>;

/// Commands that flow into a single peer session, either from the owning
/// [`Torrent`](crate::torrent::Torrent) or from the disk task in response to
/// a read request the session issued on behalf of the remote peer.
#[derive(Debug)]
pub enum Command {
    /// The coordinator completed (or failed) a piece; broadcast a `Have` for
    /// it to the peer if it was successful and the peer doesn't have it yet.
    PieceCompletion { index: PieceIndex, is_valid: bool },
    /// A block the session requested on this remote's behalf has been read
    /// from disk and is ready to send as a `Block` message.
    BlockReady {
        block_info: BlockInfo,
        data: CachedBlock,
    },
    /// The disk failed to read a block the remote requested.
    ReadError {
        block_info: BlockInfo,
        error: ReadError,
    },
    /// Tells the session to choke or unchoke the remote peer, as decided by
    /// the torrent's choke scheduler.
    SetChoked(bool),
    /// Tells the session to enter or leave endgame mode.
    SetEndgame(bool),
    /// Another session delivered this block first during endgame racing;
    /// cancel it here too, on the wire and in our own pipeline, if it's
    /// still outstanding toward this peer.
    CancelBlock(BlockInfo),
    /// Gracefully shuts down the session.
    Shutdown,
}

/// The lifecycle state of a peer session, mirrored in each [`SessionTick`]
/// so the coordinator can display/act on it without owning the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not yet connected, or connection was dropped.
    #[default]
    Disconnected,
    /// TCP connection attempt in progress.
    Connecting,
    /// TCP connected, handshake exchange in progress.
    Handshaking,
    /// Handshake complete, waiting for the initial bitfield/have burst.
    AvailabilityExchange,
    /// Steady state: handshake and (optional) bitfield exchanged, ready to
    /// exchange piece messages.
    Connected,
}

/// The most essential information of a peer session
/// that is sent to torrent with each session tick.
#[derive(Debug, Clone, Copy)]
pub struct SessionTick {
    /// A snapshot of the session state.
    pub state: SessionState,
    /// Various transfer statistics.
    pub counters: ThruputCounters,
    /// The number of pieces the peer has available.
    pub piece_count: usize,
    /// Whether the peer has told us it's interested in downloading from us.
    pub peer_interested: bool,
    /// Whether we currently have the peer unchoked.
    pub choking_peer: bool,
}

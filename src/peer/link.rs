//! Owns the TCP socket to a single peer: the handshake exchange and the
//! framed message stream built on top of it.

use std::net::SocketAddr;

use futures::{stream::SplitStream, SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, task, time::timeout};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    conf::{HANDSHAKE_TIMEOUT, KEEP_ALIVE_INTERVAL, PEER_SEND_QUEUE_CAPACITY},
    error::peer::PeerError,
    PeerId, Sha1Hash,
};

use super::codec::{
    handshake::{Handshake, HandshakeCodec, PROTOCOL_STRING},
    message::Message,
    peercodec::PeerCodec,
};

/// The framed, post-handshake socket, ready to exchange peer wire messages.
pub type Link = Framed<TcpStream, PeerCodec>;

/// Owns the post-handshake socket and decouples writing from reading.
///
/// Outbound messages go through a bounded queue serviced by a dedicated
/// writer task, which also injects a keep-alive on every idle interval.
/// A slow peer that doesn't drain its queue in time is disconnected rather
/// than let the queue grow without bound.
pub struct PeerLink {
    stream: SplitStream<Link>,
    outbound_tx: mpsc::Sender<Message>,
    writer_task: task::JoinHandle<()>,
}

impl PeerLink {
    pub fn new(link: Link) -> Self {
        let (sink, stream) = link.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(PEER_SEND_QUEUE_CAPACITY);
        let writer_task = task::spawn(Self::run_writer(sink, outbound_rx));
        Self { stream, outbound_tx, writer_task }
    }

    async fn run_writer(
        mut sink: futures::stream::SplitSink<Link, Message>,
        mut outbound_rx: mpsc::Receiver<Message>,
    ) {
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        keep_alive.tick().await;
        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    let Some(msg) = msg else { break };
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                    keep_alive.reset();
                }
                _ = keep_alive.tick() => {
                    if sink.send(Message::KeepAlive).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Enqueues `msg` for the writer task, failing immediately (rather than
    /// waiting) if the outbound queue is full.
    pub fn try_send(&self, msg: Message) -> Result<(), PeerError> {
        self.outbound_tx.try_send(msg).map_err(|_| PeerError::SlowPeer)
    }

    /// Awaits the next message from the peer.
    pub async fn recv(&mut self) -> Option<Result<Message, PeerError>> {
        self.stream.next().await
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.writer_task.abort();
    }
}

/// Connects to `addr` and performs the outbound side of the handshake.
///
/// Returns the peer's advertised id and the framed socket, switched over to
/// [`PeerCodec`] for the rest of the session.
pub async fn connect(
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
) -> Result<(PeerId, Link), PeerError> {
    let socket = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::HandshakeTimeout)??;
    handshake(socket, info_hash, client_id, true).await
}

/// Performs the inbound side of the handshake on an already accepted socket.
pub async fn accept(
    socket: TcpStream,
    info_hash: Sha1Hash,
    client_id: PeerId,
) -> Result<(PeerId, Link), PeerError> {
    handshake(socket, info_hash, client_id, false).await
}

async fn handshake(
    socket: TcpStream,
    info_hash: Sha1Hash,
    client_id: PeerId,
    send_first: bool,
) -> Result<(PeerId, Link), PeerError> {
    use futures::{SinkExt, StreamExt};

    let mut socket = Framed::new(socket, HandshakeCodec);
    let our_handshake = Handshake::new(info_hash, client_id);

    if send_first {
        timeout(HANDSHAKE_TIMEOUT, socket.send(our_handshake))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;
    }

    let peer_handshake = timeout(HANDSHAKE_TIMEOUT, socket.next())
        .await
        .map_err(|_| PeerError::HandshakeTimeout)?
        .ok_or_else(|| {
            PeerError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            ))
        })??;

    debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());
    if peer_handshake.info_hash != info_hash {
        return Err(PeerError::InvalidInfoHash);
    }

    if !send_first {
        timeout(HANDSHAKE_TIMEOUT, socket.send(our_handshake))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;
    }

    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Ok((peer_handshake.peer_id, Framed::from_parts(new_parts)))
}

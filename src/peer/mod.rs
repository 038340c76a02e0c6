//! One wire-protocol session with a single peer: handshake, state machine,
//! and the message exchange loop.

mod codec;

use std::{net::SocketAddr, time::Duration};

use futures::{select, stream::SplitSink, FutureExt, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::Instant,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    bitfield::BitField,
    error::{Error, ProtocolError, Result},
    BlockInfo, PeerId, PieceIndex, Sha1Hash,
};
use codec::{Handshake, HandshakeCodec, Message, PeerCodec};

/// A peer connection is driven by commands sent from its owning `Torrent`.
#[derive(Debug)]
pub(crate) enum Command {
    /// Request a block from the peer.
    Request(BlockInfo),
    /// Cancel a previously issued request.
    Cancel(BlockInfo),
    /// Tell the peer we now have a piece.
    Have { piece_index: PieceIndex },
    /// Choke/unchoke the peer (our own choking state towards them).
    Choke,
    Unchoke,
    /// Tell the peer whether we want any piece it has (our own interest in
    /// them).
    Interested,
    NotInterested,
    /// Serve a block the peer had requested from us.
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    /// Close the connection from our side.
    Shutdown,
}

/// Events a peer connection reports back to its owning `Torrent`.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    /// The handshake completed and the peer's id is now known. `Torrent`
    /// uses this to promote the command sender it's held keyed by `addr`
    /// since `outbound()` returned it, to being keyed by `peer_id`.
    Connected { addr: SocketAddr },
    /// The peer announced its piece availability.
    BitfieldReceived(BitField),
    /// The peer announced it has piece `piece_index`.
    HaveReceived { piece_index: PieceIndex },
    /// The peer choked/unchoked us.
    Choked,
    Unchoked,
    /// The peer is/isn't interested in us.
    Interested,
    NotInterested,
    /// A requested block arrived.
    BlockReceived { block: BlockInfo, data: Vec<u8> },
    /// The peer is requesting a block from us.
    RequestReceived(BlockInfo),
    /// The peer cancelled an earlier request to us.
    CancelReceived(BlockInfo),
    /// The connection closed, for the given reason.
    Closed { reason: String },
}

pub(crate) type EventSender = UnboundedSender<(PeerId, PeerEvent)>;
pub(crate) type CommandSender = UnboundedSender<Command>;
type CommandReceiver = UnboundedReceiver<Command>;

/// The peer connection's lifecycle phase, per the BEP 3 handshake sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Connecting,
    Handshaking,
    /// Waiting for the peer's BITFIELD (or first HAVE) message, or for the
    /// grace period to elapse.
    Bitfield,
    Established,
}

/// A peer's last reported piece availability and message-level state, as
/// maintained by the owning `Torrent` for scheduling purposes.
#[derive(Clone, Debug)]
pub(crate) struct PeerInfo {
    pub peer_id: PeerId,
    pub bitfield: BitField,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub requests_pending: usize,
}

impl PeerInfo {
    fn new(peer_id: PeerId, piece_count: usize) -> Self {
        Self {
            peer_id,
            bitfield: BitField::new(piece_count),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            requests_pending: 0,
        }
    }
}

/// The grace period after which, if no BITFIELD or HAVE has arrived, the
/// connection is nonetheless promoted out of the `Bitfield` phase and
/// treated as a peer with no pieces.
const BITFIELD_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// How long we tolerate silence from the peer before considering the
/// connection dead.
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(120);

/// One peer connection's session state and network handle.
pub(crate) struct PeerConnection {
    info_hash: Sha1Hash,
    client_id: PeerId,
    piece_count: usize,
    addr: SocketAddr,
    state: State,
    peer: Option<PeerInfo>,
    cmd_port: CommandReceiver,
    events: EventSender,
}

impl PeerConnection {
    /// Creates a new outbound connection to `addr`, returning it alongside
    /// the command channel its owning `Torrent` uses to drive it.
    pub fn outbound(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        client_id: PeerId,
        piece_count: usize,
        events: EventSender,
    ) -> (Self, CommandSender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                info_hash,
                client_id,
                piece_count,
                addr,
                state: State::Connecting,
                peer: None,
                cmd_port,
                events,
            },
            cmd_chan,
        )
    }

    /// Runs the connection until it closes, for whatever reason. Ordinary
    /// peer-caused failures are reported via a `PeerEvent::Closed` and this
    /// returns `Ok(())`; only internal channel failures propagate as `Err`.
    pub async fn run(&mut self) -> Result<()> {
        let reason = match self.run_inner().await {
            Ok(()) => "shutdown".to_owned(),
            Err(e) => e.to_string(),
        };
        log::info!("Peer {} session closed: {}", self.addr, reason);
        if let Some(peer) = &self.peer {
            let _ = self.events.send((peer.peer_id, PeerEvent::Closed { reason }));
        }
        Ok(())
    }

    async fn run_inner(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.state = State::Connecting;
        let socket = TcpStream::connect(self.addr).await?;
        log::info!("Connected to peer {}", self.addr);

        self.state = State::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);
        let handshake = Handshake::new(self.info_hash, self.client_id);
        socket.send(handshake).await?;

        let peer_handshake = match socket.next().await {
            Some(h) => h?,
            None => {
                return Err(Error::Protocol(ProtocolError::InvalidHandshake));
            }
        };
        if peer_handshake.info_hash != self.info_hash {
            return Err(Error::Protocol(ProtocolError::InvalidInfoHash));
        }
        self.peer = Some(PeerInfo::new(peer_handshake.peer_id, self.piece_count));
        log::info!("Peer {} handshake complete", self.addr);
        let _ = self
            .events
            .send((peer_handshake.peer_id, PeerEvent::Connected { addr: self.addr }));

        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.state = State::Bitfield;
        self.message_loop(socket).await
    }

    async fn message_loop(&mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();
        let mut last_recv_at = Instant::now();

        loop {
            if self.state != State::Established
                && last_recv_at.elapsed() >= BITFIELD_GRACE_PERIOD
            {
                self.enter_established();
            }
            if last_recv_at.elapsed() >= KEEPALIVE_TIMEOUT {
                return Err(Error::Protocol(ProtocolError::KeepAliveTimeout));
            }

            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    last_recv_at = Instant::now();
                    self.handle_incoming(&mut sink, msg).await?;
                }
                cmd = self.cmd_port.recv().fuse() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            log::info!("Peer {} session shutting down", self.addr);
                            return Ok(());
                        }
                        Some(cmd) => self.handle_command(&mut sink, cmd).await?,
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(5)).fuse() => {
                    // idle tick: re-check the keepalive/bitfield-grace deadlines above
                }
            }
        }
    }

    fn enter_established(&mut self) {
        if self.state != State::Established {
            log::debug!("Peer {} entering Established state", self.addr);
            self.state = State::Established;
        }
    }

    async fn handle_incoming(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        let peer_id = self.peer.as_ref().expect("handshake completed").peer_id;

        match msg {
            Message::KeepAlive => {}
            Message::Bitfield(mut bitfield) => {
                if self.state == State::Established {
                    return Err(Error::Protocol(ProtocolError::BitfieldNotAfterHandshake));
                }
                bitfield.resize(self.piece_count);
                if let Some(peer) = &mut self.peer {
                    peer.bitfield = bitfield.clone();
                }
                self.enter_established();
                let _ = self.events.send((peer_id, PeerEvent::BitfieldReceived(bitfield)));
            }
            Message::Have { piece_index } => {
                if let Some(peer) = &mut self.peer {
                    peer.bitfield.set(piece_index, true);
                }
                self.enter_established();
                let _ = self
                    .events
                    .send((peer_id, PeerEvent::HaveReceived { piece_index }));
            }
            Message::Choke => {
                if let Some(peer) = &mut self.peer {
                    peer.peer_choking = true;
                }
                let _ = self.events.send((peer_id, PeerEvent::Choked));
            }
            Message::Unchoke => {
                if let Some(peer) = &mut self.peer {
                    peer.peer_choking = false;
                }
                let _ = self.events.send((peer_id, PeerEvent::Unchoked));
            }
            Message::Interested => {
                if let Some(peer) = &mut self.peer {
                    peer.peer_interested = true;
                }
                let _ = self.events.send((peer_id, PeerEvent::Interested));
            }
            Message::NotInterested => {
                if let Some(peer) = &mut self.peer {
                    peer.peer_interested = false;
                }
                let _ = self.events.send((peer_id, PeerEvent::NotInterested));
            }
            Message::Request(block) => {
                let _ = self.events.send((peer_id, PeerEvent::RequestReceived(block)));
            }
            Message::Cancel(block) => {
                let _ = self.events.send((peer_id, PeerEvent::CancelReceived(block)));
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                if let Some(peer) = &mut self.peer {
                    peer.requests_pending = peer.requests_pending.saturating_sub(1);
                }
                let _ = self
                    .events
                    .send((peer_id, PeerEvent::BlockReceived { block, data }));
            }
        }

        let _ = sink;
        Ok(())
    }

    async fn handle_command(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        cmd: Command,
    ) -> Result<()> {
        match cmd {
            Command::Request(block) => {
                if let Some(peer) = &mut self.peer {
                    peer.requests_pending += 1;
                }
                sink.send(Message::Request(block)).await?;
            }
            Command::Cancel(block) => {
                if let Some(peer) = &mut self.peer {
                    peer.requests_pending = peer.requests_pending.saturating_sub(1);
                }
                sink.send(Message::Cancel(block)).await?;
            }
            Command::Have { piece_index } => {
                sink.send(Message::Have { piece_index }).await?;
            }
            Command::Choke => {
                if let Some(peer) = &mut self.peer {
                    peer.am_choking = true;
                }
                sink.send(Message::Choke).await?;
            }
            Command::Unchoke => {
                if let Some(peer) = &mut self.peer {
                    peer.am_choking = false;
                }
                sink.send(Message::Unchoke).await?;
            }
            Command::Interested => {
                if let Some(peer) = &mut self.peer {
                    peer.am_interested = true;
                }
                sink.send(Message::Interested).await?;
            }
            Command::NotInterested => {
                if let Some(peer) = &mut self.peer {
                    peer.am_interested = false;
                }
                sink.send(Message::NotInterested).await?;
            }
            Command::Block {
                piece_index,
                offset,
                data,
            } => {
                sink.send(Message::Block {
                    piece_index,
                    offset,
                    data,
                })
                .await?;
            }
            Command::Shutdown => unreachable!("handled by caller before dispatch"),
        }
        Ok(())
    }
}

pub(crate) mod codec;

use {
    futures::{select, stream::Fuse, SinkExt, StreamExt},
    std::sync::Arc,
    tokio::{
        net::TcpStream,
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        error::Result,
        peer::{ConnId, Peer},
    },
    codec::*,
};

/// The channel on which the peer can hand a connection frames to forward.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a connection's writer services.
///
/// Everything any part of the peer sends on a link travels through this
/// channel, so enqueueing under the peer lock is all it takes to keep a
/// read-modify-send sequence atomic, and a single task owns the socket.
#[derive(Debug)]
pub(crate) enum Command {
    /// Forward a protocol message to the remote end.
    Send(Message),
}

/// A connection with one remote peer. Each TCP link in the swarm is driven
/// by exactly one session on either end.
pub(crate) struct PeerSession {
    /// The peer this session belongs to, holding all state shared with the
    /// peer's other sessions.
    peer: Arc<Peer>,
    /// The remote address, for dialing and logging.
    addr: String,
    /// Whether this side opens the connection and therefore handshakes
    /// first.
    is_outbound: bool,
    /// The already accepted socket of an inbound session.
    socket: Option<TcpStream>,
    /// This session's key in the peer's connection registry.
    conn_id: ConnId,
    /// The remote's id, learned from its handshake.
    remote_id: Option<crate::PeerId>,
    /// The port on which the session receives frames to forward.
    cmd_port: Fuse<Receiver>,
}

impl PeerSession {
    /// Creates a new session that dials the neighbor at the given address.
    pub fn outbound(peer: Arc<Peer>, addr: String) -> Self {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let conn_id = peer.state().register(cmd_chan);
        Self {
            peer,
            addr,
            is_outbound: true,
            socket: None,
            conn_id,
            remote_id: None,
            cmd_port: cmd_port.fuse(),
        }
    }

    /// Creates a new session over a socket the listener accepted.
    pub fn inbound(peer: Arc<Peer>, socket: TcpStream, addr: String) -> Self {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let conn_id = peer.state().register(cmd_chan);
        Self {
            peer,
            addr,
            is_outbound: false,
            socket: Some(socket),
            conn_id,
            remote_id: None,
            cmd_port: cmd_port.fuse(),
        }
    }

    /// Runs the session until the swarm completes, the remote goes away, or
    /// the link fails. The connection is always deregistered on exit so a
    /// dead link can neither serve requests nor hold up termination.
    pub async fn start(mut self) -> Result<()> {
        let res = self.run().await;
        self.peer.state().deregister(self.conn_id);
        if let Err(ref e) = res {
            log::warn!(
                "Peer {}: connection with {} failed: {}",
                self.peer.id(),
                self.addr,
                e
            );
        }
        res
    }

    async fn run(&mut self) -> Result<()> {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => {
                log::info!("Peer {} connecting to {}", self.peer.id(), self.addr);
                TcpStream::connect(self.addr.as_str()).await?
            }
        };

        let mut socket = Framed::new(socket, HandshakeCodec);

        if self.is_outbound {
            log::info!("Peer {} sent handshake to {}", self.peer.id(), self.addr);
            socket.send(Handshake::new(self.peer.id())).await?;
        }

        let handshake = match socket.next().await {
            Some(handshake) => handshake?,
            // remote went away before handshaking
            None => return Ok(()),
        };
        let remote_id = handshake.peer_id;
        self.remote_id = Some(remote_id);
        self.peer.state().set_remote_id(self.conn_id, remote_id);
        log::info!(
            "Peer {} received handshake from peer {}",
            self.peer.id(),
            remote_id
        );

        if !self.is_outbound {
            log::info!("Peer {} sent handshake to peer {}", self.peer.id(), remote_id);
            socket.send(Handshake::new(self.peer.id())).await?;
        }

        // now that the handshakes are exchanged, switch to the message codec
        // (keeping the buffers, as the remote may have pipelined frames right
        // behind its handshake)
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, self.peer.message_codec());
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // a peer that already holds pieces advertises them first thing
        let own_bitfield = self.peer.state().own_bitfield();
        if let Some(bitfield) = own_bitfield {
            log::info!("Peer {} sent bitfield to peer {}", self.peer.id(), remote_id);
            sink.send(Message::Bitfield(bitfield)).await?;
        }

        loop {
            select! {
                msg = stream.next() => match msg {
                    Some(msg) => self.handle_msg(msg?)?,
                    // remote closed the link
                    None => break,
                },
                cmd = self.cmd_port.select_next_some() => match cmd {
                    Command::Send(msg) => {
                        log::info!(
                            "Peer {} sent {:?} to peer {}",
                            self.peer.id(),
                            msg.id(),
                            remote_id
                        );
                        sink.send(msg).await?;
                    }
                },
            }

            // the link has served its purpose once nobody on it, nor any
            // other neighbor, is missing pieces
            if self.peer.state().swarm_complete() {
                log::info!(
                    "Peer {} closed connection with peer {}",
                    self.peer.id(),
                    remote_id
                );
                break;
            }
        }

        Ok(())
    }

    fn handle_msg(&mut self, msg: Message) -> Result<()> {
        let remote_id = self.remote_id.unwrap_or_default();
        log::info!(
            "Peer {} received {:?} from peer {}",
            self.peer.id(),
            msg.id(),
            remote_id
        );

        let mut state = self.peer.state();
        match msg {
            // no "remote is choking us" bit is kept; outstanding requests
            // simply go unanswered until the next unchoke
            Message::Choke => {}
            Message::Unchoke => state.request_missing(self.conn_id),
            Message::Interested => state.set_interested(self.conn_id, true),
            Message::NotInterested => state.set_interested(self.conn_id, false),
            Message::Have { piece_index } => {
                state.record_remote_have(self.conn_id, piece_index)?;
                state.notify_interest(self.conn_id);
            }
            Message::Bitfield(bitfield) => {
                state.record_remote_bitfield(self.conn_id, bitfield);
                state.notify_interest(self.conn_id);
            }
            Message::Request { piece_index } => {
                state.serve_piece(self.conn_id, piece_index)?;
            }
            Message::Piece { piece_index, data } => {
                state.receive_piece(self.conn_id, piece_index, data)?;
            }
        }

        Ok(())
    }
}

use {
    rand::seq::SliceRandom,
    std::{
        collections::HashMap,
        path::Path,
        sync::{Arc, Mutex, MutexGuard},
        time::Duration,
    },
    tokio::{
        net::TcpListener,
        time::{self, Instant},
    },
};

use crate::{
    choker::{self, NeighborSnapshot},
    conf::{Conf, PeerEntry},
    error::Result,
    session::{
        codec::{Message, PeerCodec},
        Command, PeerSession, Sender,
    },
    storage::{PieceStore, StorageInfo},
    Bitfield, PeerId, PieceIndex,
};

/// Connections are keyed in the peer's registry by a monotonically
/// increasing local id, independent of the remote's peer id (which is not
/// known until its handshake arrives).
pub(crate) type ConnId = u32;

/// One member of the swarm: a listening socket, a slot for the shared file,
/// and the connections to its neighbors.
pub(crate) struct Peer {
    id: PeerId,
    host: String,
    port: u16,
    /// Whether the peer started out with the complete file.
    is_seed: bool,
    /// How many slots the ranked tick may fill. One of the configured
    /// neighbor slots is left to the optimistic rotation.
    preferred_slots: usize,
    unchoke_interval: Duration,
    optimistic_interval: Duration,
    state: Mutex<PeerState>,
}

impl Peer {
    pub fn new(entry: &PeerEntry, conf: &Conf, root: &Path) -> Result<Arc<Self>> {
        let info = StorageInfo::new(conf, entry.id, entry.has_file, root);
        let store = if entry.has_file {
            PieceStore::seed(info)?
        } else {
            PieceStore::leech(info)?
        };
        log::info!(
            "Peer {} sharing {} bytes in {} pieces at {:?}",
            entry.id,
            store.info().file_len,
            store.info().piece_count,
            store.info().path
        );
        Ok(Arc::new(Self {
            id: entry.id,
            host: entry.host.clone(),
            port: entry.port,
            is_seed: entry.has_file,
            preferred_slots: conf.preferred_neighbor_count.saturating_sub(1),
            unchoke_interval: conf.unchoke_interval,
            optimistic_interval: conf.optimistic_unchoke_interval,
            state: Mutex::new(PeerState {
                peer_id: entry.id,
                store,
                connections: HashMap::new(),
                optimistic_id: None,
                next_conn_id: 0,
            }),
        }))
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Takes the peer lock. Every read or write of the shared state below
    /// goes through this guard.
    pub(crate) fn state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap()
    }

    /// Returns a message codec sized for this swarm's piece geometry.
    pub(crate) fn message_codec(&self) -> PeerCodec {
        let state = self.state();
        let info = state.store.info();
        PeerCodec::new(info.piece_count, info.piece_len)
    }

    /// Binds the peer's listening socket.
    ///
    /// Binding is separated from `start` so that the supervisor can bring
    /// every listener up before any sibling peer starts dialing.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        log::info!("Peer {} listening on {}:{}", self.id, self.host, self.port);
        Ok(listener)
    }

    /// Runs the peer: starts the two choke timers, dials every neighbor
    /// that came up before it, and accepts inbound connections for the rest
    /// of its life.
    pub async fn start(
        self: Arc<Self>,
        mut listener: TcpListener,
        neighbors: Vec<(String, u16)>,
    ) -> Result<()> {
        tokio::spawn(Self::preferred_tick(Arc::clone(&self)));
        tokio::spawn(Self::optimistic_tick(Arc::clone(&self)));

        for (host, port) in neighbors {
            let peer = Arc::clone(&self);
            let addr = format!("{}:{}", host, port);
            tokio::spawn(async move {
                let session = PeerSession::outbound(peer, addr);
                // a failed session has already been deregistered and logged
                let _ = session.start().await;
            });
        }

        loop {
            let (socket, addr) = listener.accept().await?;
            let peer = Arc::clone(&self);
            tokio::spawn(async move {
                let session = PeerSession::inbound(peer, socket, addr.to_string());
                let _ = session.start().await;
            });
        }
    }

    /// The contribution-ranked unchoke evaluation, firing once per
    /// interval, starting one interval after the peer comes up.
    async fn preferred_tick(self: Arc<Self>) {
        let mut tick = time::interval_at(
            Instant::now() + self.unchoke_interval,
            self.unchoke_interval,
        );
        loop {
            tick.tick().await;
            self.state()
                .reshuffle_preferred(self.preferred_slots, self.is_seed);
        }
    }

    /// The optimistic unchoke rotation, on its own independent period.
    async fn optimistic_tick(self: Arc<Self>) {
        let mut tick = time::interval_at(
            Instant::now() + self.optimistic_interval,
            self.optimistic_interval,
        );
        loop {
            tick.tick().await;
            self.state().rotate_optimistic();
        }
    }
}

/// Bookkeeping the peer holds for one live connection.
///
/// `remote_have` only ever gains bits, and `pieces_received` is zeroed by
/// every ranked evaluation.
struct Connection {
    remote_id: Option<PeerId>,
    remote_have: Bitfield,
    interested: bool,
    choked: bool,
    pieces_received: u64,
    cmd_chan: Sender,
}

/// All state shared between a peer's sessions and its timers, guarded by
/// the single peer lock.
pub(crate) struct PeerState {
    peer_id: PeerId,
    store: PieceStore,
    connections: HashMap<ConnId, Connection>,
    /// The currently optimistically unchoked neighbor, if any.
    optimistic_id: Option<PeerId>,
    next_conn_id: ConnId,
}

impl PeerState {
    /// Adds a new connection to the registry and returns its key.
    pub fn register(&mut self, cmd_chan: Sender) -> ConnId {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        self.connections.insert(
            conn_id,
            Connection {
                remote_id: None,
                remote_have: Bitfield::repeat(false, self.store.info().piece_count),
                interested: false,
                choked: true,
                pieces_received: 0,
                cmd_chan,
            },
        );
        conn_id
    }

    pub fn deregister(&mut self, conn_id: ConnId) {
        self.connections.remove(&conn_id);
    }

    pub fn set_remote_id(&mut self, conn_id: ConnId, remote_id: PeerId) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.remote_id = Some(remote_id);
        }
    }

    pub fn set_interested(&mut self, conn_id: ConnId, interested: bool) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.interested = interested;
        }
    }

    /// Returns the peer's own bitfield, or `None` when it holds nothing yet
    /// and there is nothing worth advertising.
    pub fn own_bitfield(&self) -> Option<Bitfield> {
        let have = self.store.have();
        if have.any() {
            Some(have.clone())
        } else {
            None
        }
    }

    /// Marks one more piece as held by the remote.
    pub fn record_remote_have(&mut self, conn_id: ConnId, index: PieceIndex) -> Result<()> {
        if index >= self.store.info().piece_count {
            return Err(crate::error::Error::InvalidPieceIndex(index));
        }
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.remote_have.set(index, true);
        }
        Ok(())
    }

    /// Replaces the remote's availability with its advertised bitfield. The
    /// wire bitmap is padded to whole bytes, so it is cut down to the
    /// swarm's piece count.
    pub fn record_remote_bitfield(&mut self, conn_id: ConnId, mut bitfield: Bitfield) {
        bitfield.resize(self.store.info().piece_count, false);
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.remote_have = bitfield;
        }
    }

    /// Tells the remote whether it has anything we want. Sent on every
    /// availability change; repeating the current answer is harmless.
    pub fn notify_interest(&self, conn_id: ConnId) {
        let msg = if self.missing_from(conn_id).is_empty() {
            Message::NotInterested
        } else {
            Message::Interested
        };
        self.send_to(conn_id, msg);
    }

    /// Requests one piece, chosen uniformly at random among those the
    /// remote has and we lack. No request is sent when there is nothing to
    /// ask for.
    pub fn request_missing(&self, conn_id: ConnId) {
        let candidates = self.missing_from(conn_id);
        if let Some(&piece_index) = candidates.choose(&mut rand::thread_rng()) {
            self.send_to(conn_id, Message::Request { piece_index });
        }
    }

    /// Answers a request with the piece's bytes. A request for a piece we
    /// don't hold is a protocol violation and kills the connection.
    pub fn serve_piece(&self, conn_id: ConnId, index: PieceIndex) -> Result<()> {
        let data = self.store.piece(index)?.to_vec();
        self.send_to(
            conn_id,
            Message::Piece {
                piece_index: index,
                data,
            },
        );
        Ok(())
    }

    /// Takes delivery of a piece: stores and persists it, credits the
    /// connection it came in on, announces it to every neighbor (the
    /// delivering one included), and asks the same remote for another one.
    pub fn receive_piece(
        &mut self,
        conn_id: ConnId,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        self.store.write_piece(index, data)?;
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.pieces_received += 1;
        }
        for conn in self.connections.values() {
            // a sibling that is shutting down no longer cares
            let _ = conn
                .cmd_chan
                .send(Command::Send(Message::Have { piece_index: index }));
        }
        if self.store.is_complete() {
            log::info!("Peer {} has downloaded the complete file", self.peer_id);
        }
        self.request_missing(conn_id);
        Ok(())
    }

    /// True once this peer and every connected neighbor have all pieces.
    /// Both the sessions' read loops and this check run under the peer
    /// lock, so a session observing completion can close cleanly.
    pub fn swarm_complete(&self) -> bool {
        let piece_count = self.store.info().piece_count;
        self.store.is_complete()
            && self
                .connections
                .values()
                .all(|conn| conn.remote_have.count_ones() == piece_count)
    }

    /// Applies one contribution-ranked evaluation and starts the next
    /// measurement window.
    pub fn reshuffle_preferred(&mut self, slots: usize, is_seed: bool) {
        let shuffle =
            choker::pick_preferred(&self.snapshots(), slots, is_seed, &mut rand::thread_rng());
        if !shuffle.to_choke.is_empty() || !shuffle.to_unchoke.is_empty() {
            log::info!(
                "Peer {} preferred neighbors change: unchoking {:?}, choking {:?}",
                self.peer_id,
                shuffle.to_unchoke,
                shuffle.to_choke
            );
        }
        for conn in self.connections.values_mut() {
            conn.pieces_received = 0;
            let remote_id = match conn.remote_id {
                Some(id) => id,
                None => continue,
            };
            if shuffle.to_choke.contains(&remote_id) {
                conn.choked = true;
                let _ = conn.cmd_chan.send(Command::Send(Message::Choke));
            } else if shuffle.to_unchoke.contains(&remote_id) {
                conn.choked = false;
                let _ = conn.cmd_chan.send(Command::Send(Message::Unchoke));
            }
        }
    }

    /// Rotates the optimistic unchoke slot to a random interested-but-
    /// choked neighbor, releasing the previous holder.
    pub fn rotate_optimistic(&mut self) {
        let pick = match choker::pick_optimistic(&self.snapshots(), &mut rand::thread_rng()) {
            Some(pick) => pick,
            None => return,
        };
        if Some(pick) != self.optimistic_id {
            log::info!(
                "Peer {} optimistically unchoked peer {}",
                self.peer_id,
                pick
            );
            let previous = self.optimistic_id;
            for conn in self.connections.values_mut() {
                if conn.remote_id.is_some() && conn.remote_id == previous {
                    conn.choked = true;
                    let _ = conn.cmd_chan.send(Command::Send(Message::Choke));
                } else if conn.remote_id == Some(pick) {
                    conn.choked = false;
                    let _ = conn.cmd_chan.send(Command::Send(Message::Unchoke));
                }
            }
        }
        self.optimistic_id = Some(pick);
    }

    /// The indices the remote on this connection has and we lack.
    fn missing_from(&self, conn_id: ConnId) -> Vec<PieceIndex> {
        let conn = match self.connections.get(&conn_id) {
            Some(conn) => conn,
            None => return Vec::new(),
        };
        let have = self.store.have();
        (0..have.len())
            .filter(|&i| conn.remote_have[i] && !have[i])
            .collect()
    }

    fn send_to(&self, conn_id: ConnId, msg: Message) {
        if let Some(conn) = self.connections.get(&conn_id) {
            let _ = conn.cmd_chan.send(Command::Send(msg));
        }
    }

    /// A snapshot of the handshaken connections for the choke policies.
    fn snapshots(&self) -> Vec<NeighborSnapshot> {
        self.connections
            .values()
            .filter_map(|conn| {
                conn.remote_id.map(|peer_id| NeighborSnapshot {
                    peer_id,
                    interested: conn.interested,
                    choked: conn.choked,
                    pieces_received: conn.pieces_received,
                })
            })
            .collect()
    }
}

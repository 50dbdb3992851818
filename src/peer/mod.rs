//! A session with a single peer: handshake, availability exchange,
//! choke/interest negotiation, request pipelining and the BEP 6 fast
//! extension.
//!
//! Each session runs as its own task and owns its TCP connection. It talks
//! to the rest of the engine through the shared piece picker, the disk
//! handle, and the torrent's event channel; the torrent addresses it
//! through a command channel. The session holds no owning reference to the
//! torrent.

pub(crate) mod codec;

use {
    futures::{
        select,
        stream::{Fuse, SplitSink},
        SinkExt, StreamExt,
    },
    sha1::{Digest, Sha1},
    std::{
        collections::HashMap,
        net::{IpAddr, SocketAddr},
        sync::Arc,
        time::{Duration, Instant},
    },
    tokio::{
        net::TcpStream,
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        sync::RwLock,
        time,
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        counter::ThruputCounters,
        disk::{BlockRead, DiskHandle},
        error::PeerError,
        piece_picker::{PickOptions, PiecePicker},
        torrent::{self, SharedStatus},
        Bitfield, BlockInfo, PeerId, PeerKey, PieceIndex, Sha1Hash,
        BLOCK_LEN,
    },
    codec::*,
};

/// The largest block length we are willing to serve. Some legacy clients
/// request more than one 16 KiB block at a time.
const MAX_REQUEST_LEN: u32 = 8 * BLOCK_LEN;

/// How many allowed-fast pieces we grant a peer (BEP 6 suggests 10).
const ALLOWED_FAST_COUNT: usize = 10;

/// How many suggested pieces we remember per peer.
const MAX_SUGGESTED_PIECES: usize = 16;

type Result<T, E = PeerError> = std::result::Result<T, E>;
type MessageSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

pub(crate) struct PeerSession {
    /// Shared information of the torrent.
    torrent: Arc<SharedStatus>,
    /// The piece picker picks the next most optimal piece to download and is
    /// shared by other entities in the same torrent.
    piece_picker: Arc<RwLock<PiecePicker>>,
    /// The entity used to save downloaded file blocks to disk and to read
    /// blocks back for serving.
    disk: DiskHandle,
    /// The channel on which to notify the torrent of session events.
    torrent_chan: torrent::Sender,
    /// The port on which the peer session receives commands from its
    /// torrent.
    cmd_port: Fuse<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// The handle by which the torrent and the picker refer to this peer.
    key: PeerKey,
    /// Session related information.
    status: Status,
    /// Our pending requests that we sent to peer, with the time each was
    /// sent (for timeout detection). It represents the blocks that we are
    /// expecting; a block arriving that has no entry here and no entry in
    /// `cancelled_requests` is a protocol error.
    outgoing_requests: HashMap<BlockInfo, Instant>,
    /// Requests we cancelled but whose blocks may legitimately still
    /// arrive: the peer may have been mid-transmit when the cancel crossed
    /// its block message on the wire.
    cancelled_requests: Vec<BlockInfo>,
    /// The requests the peer sent us that are queued for serving.
    incoming_requests: Vec<BlockInfo>,
    /// The allowed-fast pieces we granted this peer.
    allowed_fast_out: Vec<PieceIndex>,
    /// The allowed-fast pieces the peer granted us: requests for these may
    /// stay outstanding (and be issued) while we are choked.
    allowed_fast_in: Vec<PieceIndex>,
    /// Pieces the peer suggested we download (BEP 6). A reject for one of
    /// these takes it back out.
    suggested_pieces: Vec<PieceIndex>,
    /// The channel on which the disk task returns read blocks for serving.
    disk_read_port: Fuse<BlockReadReceiver>,
    disk_read_chan: UnboundedSender<BlockRead>,
    /// Information about the peer that is set after a successful handshake.
    peer_info: Option<PeerInfo>,
    /// Traffic accounting for this session.
    counters: ThruputCounters,
}

type BlockReadReceiver = UnboundedReceiver<BlockRead>;

impl PeerSession {
    /// Creates a new session with the peer at the given address. Whether
    /// it acts as the connecting or the accepting side is decided by which
    /// of [`Self::start_outbound`] and [`Self::start_inbound`] is called.
    pub fn new(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        disk: DiskHandle,
        torrent_chan: torrent::Sender,
        addr: SocketAddr,
        key: PeerKey,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (disk_read_chan, disk_read_port) = mpsc::unbounded_channel();
        (
            Self {
                torrent,
                piece_picker,
                disk,
                torrent_chan,
                cmd_port: cmd_port.fuse(),
                addr,
                key,
                status: Status::default(),
                outgoing_requests: HashMap::new(),
                cancelled_requests: Vec::new(),
                incoming_requests: Vec::new(),
                allowed_fast_out: Vec::new(),
                allowed_fast_in: Vec::new(),
                suggested_pieces: Vec::new(),
                disk_read_port: disk_read_port.fuse(),
                disk_read_chan,
                peer_info: None,
                counters: ThruputCounters::default(),
            },
            cmd_chan,
        )
    }

    /// Starts an outbound session: connects, handshakes, and runs the
    /// session until disconnect. The disconnect reason (or clean shutdown)
    /// is reported to the torrent before returning.
    pub async fn start_outbound(&mut self) {
        log::info!("Starting outbound peer {} session", self.addr);
        let result = self.connect_and_run().await;
        self.shutdown(result).await;
    }

    /// Starts an inbound session on an accepted socket whose handshake has
    /// already been read (and matched to our torrent) by the engine.
    pub async fn start_inbound(
        &mut self,
        socket: Framed<TcpStream, HandshakeCodec>,
        peer_handshake: Handshake,
    ) {
        log::info!("Starting inbound peer {} session", self.addr);
        let result = self.handshake_inbound(socket, peer_handshake).await;
        self.shutdown(result).await;
    }

    async fn connect_and_run(&mut self) -> Result<()> {
        self.status.state = State::Connecting;
        let timeout = self.torrent.conf.handshake_timeout;
        let socket =
            time::timeout(timeout, TcpStream::connect(self.addr))
                .await
                .map_err(|_| PeerError::HandshakeTimeout)??;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.status.state = State::Handshaking;
        let wire_hash = self
            .torrent
            .info_hash
            .wire_hash()
            .ok_or(PeerError::InvalidInfoHash)?;
        let handshake = Handshake::new(wire_hash, self.torrent.client_id);
        socket.send(handshake).await?;

        let peer_handshake =
            match time::timeout(timeout, socket.next()).await {
                Ok(Some(handshake)) => handshake?,
                Ok(None) => {
                    return Err(PeerError::Io("connection closed".into()))
                }
                Err(_) => return Err(PeerError::HandshakeTimeout),
            };
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);

        // verify that the advertised torrent info hash is the same as ours
        if !self.torrent.info_hash.matches_wire_hash(&peer_handshake.info_hash)
        {
            return Err(PeerError::InvalidInfoHash);
        }
        self.check_self_connection(&peer_handshake)?;
        self.register_peer_capabilities(&peer_handshake);

        self.run(socket).await
    }

    async fn handshake_inbound(
        &mut self,
        mut socket: Framed<TcpStream, HandshakeCodec>,
        peer_handshake: Handshake,
    ) -> Result<()> {
        self.status.state = State::Handshaking;
        self.check_self_connection(&peer_handshake)?;
        self.register_peer_capabilities(&peer_handshake);

        // reply with our handshake
        let wire_hash = self
            .torrent
            .info_hash
            .wire_hash()
            .ok_or(PeerError::InvalidInfoHash)?;
        let handshake = Handshake::new(wire_hash, self.torrent.client_id);
        socket.send(handshake).await?;

        self.run(socket).await
    }

    fn check_self_connection(&self, handshake: &Handshake) -> Result<()> {
        if handshake.peer_id == self.torrent.client_id {
            return Err(PeerError::SelfConnection);
        }
        Ok(())
    }

    fn register_peer_capabilities(&mut self, handshake: &Handshake) {
        self.status.peer_supports_fast = handshake.supports_fast();
        self.status.peer_supports_extension = handshake.supports_extension();
        self.status.peer_supports_dht = handshake.supports_dht();
        self.peer_info = Some(PeerInfo {
            peer_id: handshake.peer_id,
            pieces: {
                let mut pieces =
                    Bitfield::with_capacity(self.torrent.storage.piece_count);
                pieces.resize(self.torrent.storage.piece_count, false);
                pieces
            },
        });
    }

    /// Runs the session after the handshakes are exchanged.
    ///
    /// This is the main session "loop" and performs the core of the session
    /// logic: exchange of messages, timeout logic, etc.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, HandshakeCodec>,
    ) -> Result<()> {
        // now that we have the handshake, we need to switch to the peer
        // message codec and save the socket in self (note that we need to
        // keep the buffer from the original codec as it may contain bytes
        // of any potential message the peer may have sent after the
        // handshake)
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        // reuse buffers of previous codec
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        // split the sink and stream so that we can pass the sink while
        // holding a reference to the stream in the loop
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // the availability exchange: our bitfield (or have-all/have-none
        // with the fast extension), then the allowed-fast set
        self.status.state = State::AvailabilityExchange;
        self.send_availability(&mut sink).await?;
        self.send_allowed_fast(&mut sink).await?;

        self.status.last_incoming_time = Instant::now();
        let mut tick = time::interval(Duration::from_secs(1)).fuse();

        loop {
            select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg.map_err(PeerError::from)?,
                        // the remote side closed the connection
                        None => {
                            return Err(PeerError::Io(
                                "connection closed by peer".into(),
                            ));
                        }
                    };
                    log::debug!(
                        "Received message from peer {}: {:?}",
                        self.addr,
                        msg.id()
                    );
                    self.status.last_incoming_time = Instant::now();
                    self.handle_msg(&mut sink, msg).await?;
                }
                block = self.disk_read_port.select_next_some() => {
                    self.serve_block(&mut sink, block).await?;
                }
                _ = tick.select_next_some() => {
                    self.tick(&mut sink).await?;
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::PieceCompleted(piece_index) => {
                            self.handle_piece_completed(
                                &mut sink,
                                piece_index,
                            ).await?;
                        }
                        Command::Shutdown => {
                            log::info!(
                                "Shutting down peer {} session",
                                self.addr
                            );
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Sends our piece availability: with the fast extension have-all or
    /// have-none when applicable, otherwise a bitfield (elided when we have
    /// nothing and the peer doesn't support the fast extension).
    async fn send_availability(&mut self, sink: &mut MessageSink) -> Result<()> {
        let (own_pieces, is_complete, num_have) = {
            let picker = self.piece_picker.read().await;
            (picker.own_pieces(), picker.is_complete(), picker.num_have())
        };
        if self.status.peer_supports_fast && is_complete {
            self.send(sink, Message::HaveAll).await
        } else if self.status.peer_supports_fast && num_have == 0 {
            self.send(sink, Message::HaveNone).await
        } else if num_have > 0 || self.status.peer_supports_fast {
            self.send(sink, Message::Bitfield(own_pieces)).await
        } else {
            Ok(())
        }
    }

    /// Computes and sends the allowed-fast set for this peer (BEP 6).
    async fn send_allowed_fast(&mut self, sink: &mut MessageSink) -> Result<()> {
        if !self.status.peer_supports_fast {
            return Ok(());
        }
        self.allowed_fast_out = compute_allowed_fast(
            &self.addr.ip(),
            &self
                .torrent
                .info_hash
                .wire_hash()
                .ok_or(PeerError::InvalidInfoHash)?,
            self.torrent.storage.piece_count,
            ALLOWED_FAST_COUNT,
        );
        for piece_index in self.allowed_fast_out.clone() {
            self.send(sink, Message::AllowedFast { piece_index }).await?;
        }
        Ok(())
    }

    async fn handle_msg(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> Result<()> {
        // the availability window: a bitfield, have-all, or have-none may
        // only be the very first message after the handshake
        if self.status.state == State::AvailabilityExchange {
            match &msg {
                Message::Bitfield(_)
                | Message::HaveAll
                | Message::HaveNone => {}
                _ => {
                    self.status.state = State::Connected;
                }
            }
        }

        match msg {
            Message::KeepAlive => {}
            Message::Bitfield(bitfield) => {
                if self.status.state != State::AvailabilityExchange {
                    log::warn!(
                        "Peer {} sent a bitfield outside the handshake \
                         window",
                        self.addr
                    );
                    return Err(PeerError::DuplicateBitfield);
                }
                self.status.state = State::Connected;
                self.handle_peer_availability(sink, bitfield).await?;
            }
            Message::HaveAll => {
                if self.status.state != State::AvailabilityExchange
                    || !self.status.peer_supports_fast
                {
                    return Err(PeerError::InvalidHaveAll);
                }
                self.status.state = State::Connected;
                let mut pieces =
                    Bitfield::with_capacity(self.torrent.storage.piece_count);
                pieces.resize(self.torrent.storage.piece_count, true);
                self.handle_peer_availability(sink, pieces).await?;
            }
            Message::HaveNone => {
                if self.status.state != State::AvailabilityExchange
                    || !self.status.peer_supports_fast
                {
                    return Err(PeerError::InvalidHaveAll);
                }
                self.status.state = State::Connected;
                // an explicitly empty peer: nothing to register
            }
            Message::Have { piece_index } => {
                self.handle_have(sink, piece_index).await?;
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    self.handle_choked().await;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    // now that we are allowed to request blocks, start the
                    // download pipeline if we're interested
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                    // unchoke interested peers; a smarter choker can hook
                    // in here later
                    if self.status.is_peer_choked {
                        self.status.is_peer_choked = false;
                        self.send(sink, Message::Unchoke).await?;
                    }
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                }
            }
            Message::Request(block) => {
                self.handle_request(sink, block).await?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block(block_info, data).await?;
                // we may be able to make more requests now that a block
                // has arrived
                self.make_requests(sink).await?;
            }
            Message::Cancel(block) => {
                self.incoming_requests.retain(|b| *b != block);
            }
            Message::RejectRequest(block) => {
                self.handle_reject(block).await?;
            }
            Message::SuggestPiece { piece_index } => {
                if piece_index >= self.torrent.storage.piece_count {
                    return Err(PeerError::InvalidMessage);
                }
                if !self.suggested_pieces.contains(&piece_index)
                    && self.suggested_pieces.len() < MAX_SUGGESTED_PIECES
                {
                    self.suggested_pieces.push(piece_index);
                }
            }
            Message::AllowedFast { piece_index } => {
                if piece_index >= self.torrent.storage.piece_count {
                    return Err(PeerError::InvalidMessage);
                }
                if !self.allowed_fast_in.contains(&piece_index) {
                    self.allowed_fast_in.push(piece_index);
                }
            }
            Message::DhtPort(port) => {
                if !self.status.peer_supports_dht {
                    return Err(PeerError::InvalidMessage);
                }
                // the DHT is an external collaborator; just log the
                // announcement
                log::debug!("Peer {} announced DHT port {}", self.addr, port);
            }
            Message::Extended { id, .. } => {
                if !self.status.peer_supports_extension {
                    return Err(PeerError::InvalidMessage);
                }
                // the extension surface isn't wired up; recognizing the
                // envelope is enough for interop
                log::debug!(
                    "Peer {} sent extension message {}",
                    self.addr,
                    id
                );
            }
        }

        Ok(())
    }

    /// Registers the peer's initial piece availability and expresses
    /// interest if it has anything we want.
    async fn handle_peer_availability(
        &mut self,
        sink: &mut MessageSink,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        // The bitfield raw data that is sent over the wire may be longer
        // than the logical pieces it represents, if the number of pieces in
        // torrent is not a multiple of 8. Therefore, we need to slice off
        // the last part of the bitfield.
        bitfield.resize(self.torrent.storage.piece_count, false);

        let is_interested = self
            .piece_picker
            .write()
            .await
            .register_peer_pieces(&bitfield);
        if let Some(peer_info) = &mut self.peer_info {
            peer_info.pieces = bitfield;
        }

        if is_interested && !self.status.is_interested {
            log::info!("Interested in peer {}", self.addr);
            self.status.is_interested = true;
            self.send(sink, Message::Interested).await?;
            // This is the start of the download, so set the request queue
            // size so we can request blocks. Set it optimistically to 4 for
            // now; the bandwidth-delay estimate takes over as soon as
            // blocks start arriving.
            self.status.best_request_queue_len = Some(4);
            self.make_requests(sink).await?;
        }
        Ok(())
    }

    async fn handle_have(
        &mut self,
        sink: &mut MessageSink,
        piece_index: PieceIndex,
    ) -> Result<()> {
        if piece_index >= self.torrent.storage.piece_count {
            return Err(PeerError::InvalidMessage);
        }
        let newly_available = match &mut self.peer_info {
            Some(peer_info) => {
                let had = peer_info.pieces[piece_index];
                peer_info.pieces.set(piece_index, true);
                !had
            }
            None => false,
        };
        if !newly_available {
            return Ok(());
        }

        let mut picker = self.piece_picker.write().await;
        picker.inc_refcount(piece_index);
        let want = !picker.have_piece(piece_index)
            && picker.piece_priority(piece_index) > 0;
        drop(picker);

        if want && !self.status.is_interested {
            self.status.is_interested = true;
            self.send(sink, Message::Interested).await?;
            if self.status.best_request_queue_len.is_none() {
                self.status.best_request_queue_len = Some(4);
            }
            self.make_requests(sink).await?;
        }
        Ok(())
    }

    /// We were choked: outside the fast extension all outstanding requests
    /// are implicitly dropped by the remote side; with it, only requests
    /// for allowed-fast pieces survive (the rest will be explicitly
    /// rejected by the choker).
    async fn handle_choked(&mut self) {
        let mut picker = self.piece_picker.write().await;
        if self.status.peer_supports_fast {
            let allowed = &self.allowed_fast_in;
            let cancelled = &mut self.cancelled_requests;
            let key = self.key;
            self.outgoing_requests.retain(|block, _| {
                if allowed.contains(&block.piece_index) {
                    true
                } else {
                    picker.abort_download(*block, key);
                    // the block may have been mid-transmit; tolerate its
                    // late arrival
                    cancelled.push(*block);
                    false
                }
            });
        } else {
            for block in self.outgoing_requests.keys() {
                picker.abort_download(*block, self.key);
                self.cancelled_requests.push(*block);
            }
            self.outgoing_requests.clear();
        }
    }

    /// Handles an incoming request, enforcing the choke and allowed-fast
    /// rules, and forwards it to the disk task.
    async fn handle_request(
        &mut self,
        sink: &mut MessageSink,
        block: BlockInfo,
    ) -> Result<()> {
        // basic validity: a sane length and a range within the piece
        if block.len == 0
            || block.len > MAX_REQUEST_LEN
            || block.piece_index >= self.torrent.storage.piece_count
        {
            return Err(PeerError::InvalidRequest);
        }
        let piece_len = self
            .torrent
            .storage
            .piece_len(block.piece_index)
            .map_err(|_| PeerError::InvalidRequest)?;
        if block.offset.checked_add(block.len).map(|end| end > piece_len)
            != Some(false)
        {
            return Err(PeerError::InvalidRequest);
        }

        let we_have = self
            .piece_picker
            .read()
            .await
            .have_piece(block.piece_index);

        if self.status.is_peer_choked {
            let allowed = self.status.peer_supports_fast
                && self.allowed_fast_out.contains(&block.piece_index)
                && we_have;
            if !allowed {
                if self.status.peer_supports_fast {
                    self.send(sink, Message::RejectRequest(block)).await?;
                }
                return Ok(());
            }
        } else if !we_have {
            // a spurious request for a piece we don't have
            if self.status.peer_supports_fast {
                self.send(sink, Message::RejectRequest(block)).await?;
            }
            return Ok(());
        }

        if self.incoming_requests.contains(&block) {
            // a duplicate request; serving it once is enough
            return Ok(());
        }
        self.incoming_requests.push(block);
        self.disk
            .read_block(
                self.torrent.id,
                block,
                self.disk_read_chan.clone(),
            )
            .map_err(|_| PeerError::Io("disk task gone".into()))?;
        Ok(())
    }

    /// Sends a block read from disk, unless its request has since been
    /// cancelled.
    async fn serve_block(
        &mut self,
        sink: &mut MessageSink,
        block: BlockRead,
    ) -> Result<()> {
        let pos = self
            .incoming_requests
            .iter()
            .position(|b| *b == block.info);
        if pos.is_none() {
            // cancelled while the read was in flight
            return Ok(());
        }
        self.incoming_requests.remove(pos.expect("checked above"));
        self.counters.up.payload.add(block.info.len as u64);
        self.send(
            sink,
            Message::Block {
                piece_index: block.info.piece_index,
                offset: block.info.offset,
                data: block.data,
            },
        )
        .await
    }

    /// Verifies block validity, registers the download with the picker and
    /// hands the data to the disk task.
    async fn handle_block(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::debug!("Received block from peer {}: {:?}", self.addr, block_info);

        match self.outgoing_requests.remove(&block_info) {
            Some(sent_time) => {
                // fold the request round trip into the latency estimate
                let rtt = sent_time.elapsed();
                self.status.update_request_latency(rtt);
            }
            None => {
                // a block arriving after our cancel crossed it on the wire
                // is fine and is written out; anything else is a protocol
                // violation
                let cancelled = self
                    .cancelled_requests
                    .iter()
                    .position(|b| *b == block_info);
                match cancelled {
                    Some(pos) => {
                        self.cancelled_requests.remove(pos);
                    }
                    None => return Err(PeerError::InvalidPiece),
                }
            }
        }

        // a delivered block clears the snub
        self.status.is_snubbed = false;
        self.counters.down.payload.add(block_info.len as u64);

        let redundant = !self
            .piece_picker
            .write()
            .await
            .mark_as_writing(block_info, self.key);
        if redundant {
            // an end-game race: another peer delivered this block first
            self.counters.waste.add(block_info.len as u64);
            return Ok(());
        }

        self.disk
            .write_block(self.torrent.id, block_info, data)
            .map_err(|_| PeerError::Io("disk task gone".into()))?;
        Ok(())
    }

    /// A reject must match an outstanding (or just-cancelled) request.
    async fn handle_reject(&mut self, block: BlockInfo) -> Result<()> {
        if self.outgoing_requests.remove(&block).is_none() {
            let cancelled = self
                .cancelled_requests
                .iter()
                .position(|b| *b == block);
            match cancelled {
                Some(pos) => {
                    self.cancelled_requests.remove(pos);
                    return Ok(());
                }
                None => return Err(PeerError::InvalidReject),
            }
        }
        self.piece_picker
            .write()
            .await
            .abort_download(block, self.key);
        // don't chase a suggested piece the peer then rejected
        self.suggested_pieces.retain(|p| *p != block.piece_index);
        // a rejected allowed-fast piece wasn't so allowed after all
        self.allowed_fast_in.retain(|p| *p != block.piece_index);
        Ok(())
    }

    /// Fills the session's download pipeline with the optimal number of
    /// requests: the bandwidth-delay product keeps the link saturated
    /// without over-buffering, and a snubbed peer is clamped to a single
    /// outstanding request.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {
        if !self.status.is_interested {
            return Ok(());
        }
        if self.status.is_choked
            && (!self.status.peer_supports_fast
                || self.allowed_fast_in.is_empty())
        {
            return Ok(());
        }
        // respect the disk write queue's backpressure: no new requests
        // until it drains
        if self.disk.is_congested() {
            return Ok(());
        }

        let target = if self.status.is_snubbed {
            1
        } else {
            self.status
                .best_request_queue_len
                .unwrap_or(4)
                .min(self.torrent.conf.max_out_request_queue)
        };
        if self.outgoing_requests.len() >= target {
            return Ok(());
        }
        let to_request_count = target - self.outgoing_requests.len();

        let peer_pieces = match &self.peer_info {
            Some(peer_info) => peer_info.pieces.clone(),
            None => return Ok(()),
        };
        // while choked, only the allowed-fast pieces may be requested
        let peer_pieces = if self.status.is_choked {
            let mut restricted = Bitfield::with_capacity(peer_pieces.len());
            restricted.resize(peer_pieces.len(), false);
            for piece_index in &self.allowed_fast_in {
                if *piece_index < peer_pieces.len()
                    && peer_pieces[*piece_index]
                {
                    restricted.set(*piece_index, true);
                }
            }
            restricted
        } else {
            peer_pieces
        };

        let mut picker = self.piece_picker.write().await;
        let options = PickOptions {
            prioritize_partials: true,
            suggest: true,
            end_game: picker.is_end_game(),
            ..Default::default()
        };
        let blocks = picker.pick(
            &peer_pieces,
            to_request_count,
            self.key,
            options,
            &self.suggested_pieces,
        );
        drop(picker);

        log::debug!(
            "Requesting {} block(s) from peer {}",
            blocks.len(),
            self.addr
        );
        let now = Instant::now();
        for block in blocks {
            self.outgoing_requests.insert(block, now);
            self.counters.up.protocol.add(17);
            self.send(sink, Message::Request(block)).await?;
        }
        Ok(())
    }

    /// The torrent completed a piece: announce it, drop interest if there
    /// is nothing left to want, and cancel now-redundant requests.
    async fn handle_piece_completed(
        &mut self,
        sink: &mut MessageSink,
        piece_index: PieceIndex,
    ) -> Result<()> {
        self.send(sink, Message::Have { piece_index }).await?;

        // cancel requests for the piece that are still outstanding towards
        // this peer (end-game races)
        let stale: Vec<BlockInfo> = self
            .outgoing_requests
            .keys()
            .filter(|block| block.piece_index == piece_index)
            .copied()
            .collect();
        for block in stale {
            self.outgoing_requests.remove(&block);
            self.cancelled_requests.push(block);
            self.send(sink, Message::Cancel(block)).await?;
        }

        let is_complete = self.piece_picker.read().await.is_complete();
        if is_complete && self.status.is_interested {
            self.status.is_interested = false;
            self.send(sink, Message::NotInterested).await?;
        }
        Ok(())
    }

    /// The once-a-second housekeeping: request timeouts (snubbing),
    /// keep-alives, inactivity, statistics rounds, and pipeline resizing.
    async fn tick(&mut self, sink: &mut MessageSink) -> Result<()> {
        let now = Instant::now();

        // a peer that has gone quiet for too long is dropped
        if now.duration_since(self.status.last_incoming_time)
            > self.torrent.conf.inactivity_timeout
        {
            return Err(PeerError::InactivityTimeout);
        }

        // outstanding requests that timed out are aborted and the peer is
        // snubbed: it keeps a single in-flight request until it proves
        // itself again
        let timeout = self.torrent.conf.request_timeout;
        let timed_out: Vec<BlockInfo> = self
            .outgoing_requests
            .iter()
            .filter(|(_, sent_time)| now.duration_since(**sent_time) > timeout)
            .map(|(block, _)| *block)
            .collect();
        if !timed_out.is_empty() {
            log::info!(
                "Peer {} timed out on {} request(s), snubbing",
                self.addr,
                timed_out.len()
            );
            self.status.is_snubbed = true;
            let mut picker = self.piece_picker.write().await;
            for block in timed_out {
                self.outgoing_requests.remove(&block);
                picker.abort_download(block, self.key);
                // should it arrive after all, deliver it rather than
                // treating it as unsolicited
                self.cancelled_requests.push(block);
            }
        }

        // close the statistics round and resize the pipeline to the
        // bandwidth-delay product
        self.counters.tick();
        self.status.download_rate = self.counters.down.payload.avg();
        self.status.update_best_request_queue_len();

        // blocks for long-cancelled requests aren't coming anymore
        if self.cancelled_requests.len() > 64 {
            let excess = self.cancelled_requests.len() - 64;
            self.cancelled_requests.drain(..excess);
        }

        // keep the connection alive if we haven't said anything in a while
        if now.duration_since(self.status.last_outgoing_time)
            > self.torrent.conf.keep_alive_interval
        {
            self.send(sink, Message::KeepAlive).await?;
        }

        // the write queue may have drained, or requests may have been
        // aborted: top the pipeline back up
        self.make_requests(sink).await?;
        Ok(())
    }

    async fn send(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        self.status.last_outgoing_time = Instant::now();
        sink.send(msg).await.map_err(PeerError::from)
    }

    /// Winds the session down: re-queues its outstanding requests, takes
    /// its availability back out of the picker, and reports the disconnect
    /// to the torrent. The request re-queueing happens before the torrent
    /// learns the peer is gone.
    async fn shutdown(&mut self, result: Result<()>) {
        let mut picker = self.piece_picker.write().await;
        for block in self.outgoing_requests.keys() {
            picker.abort_download(*block, self.key);
        }
        self.outgoing_requests.clear();
        if let Some(peer_info) = &self.peer_info {
            if self.status.state == State::Connected
                || self.status.state == State::AvailabilityExchange
            {
                picker.unregister_peer_pieces(&peer_info.pieces);
            }
        }
        drop(picker);

        let reason = result.err();
        if let Some(reason) = &reason {
            log::info!("Peer {} session error: {}", self.addr, reason);
        }
        let _ = self.torrent_chan.send(torrent::Event::PeerDisconnected {
            key: self.key,
            reason,
        });
        self.status.state = State::Disconnected;
    }
}

/// The channel on which the torrent can send a command to the peer session
/// task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// The torrent completed and verified a piece: announce it to the peer.
    PieceCompleted(PieceIndex),
    /// Eventually shut down the peer session.
    Shutdown,
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    is_peer_interested: bool,
    /// A peer that let a request time out is snubbed: deprioritized and
    /// clamped to a single outstanding request until it delivers again.
    is_snubbed: bool,
    // capabilities negotiated in the handshake
    peer_supports_fast: bool,
    peer_supports_extension: bool,
    peer_supports_dht: bool,
    /// The request queue size, which is the number of block requests we
    /// keep outstanding to fully saturate the link.
    ///
    /// This value is derived from the bandwidth-delay product: the running
    /// average of the downloaded bytes per second times the average request
    /// latency. It is recalculated on every tick to keep the link
    /// saturated. Only set once we start downloading.
    best_request_queue_len: Option<usize>,
    /// The exponentially smoothed request round-trip time, feeding the
    /// bandwidth-delay product.
    request_latency: Option<Duration>,
    /// The smoothed download rate in bytes per second, updated each tick
    /// from the session counters.
    download_rate: u64,
    last_incoming_time: Instant,
    last_outgoing_time: Instant,
}

impl Status {
    fn update_request_latency(&mut self, rtt: Duration) {
        self.request_latency = Some(match self.request_latency {
            // same 2:1 smoothing as the rate counters
            Some(avg) => (avg * 2 + rtt) / 3,
            None => rtt,
        });
    }

    fn update_best_request_queue_len(&mut self) {
        let latency = match self.request_latency {
            Some(latency) => latency,
            None => return,
        };
        // the bandwidth-delay product, in blocks
        let bytes_in_flight =
            self.download_rate as f64 * latency.as_secs_f64();
        let queue_len = (bytes_in_flight / BLOCK_LEN as f64).ceil() as usize;
        // never shrink below the optimistic initial pipeline
        self.best_request_queue_len = Some(queue_len.max(4));
    }
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            is_snubbed: false,
            peer_supports_fast: false,
            peer_supports_extension: false,
            peer_supports_dht: false,
            best_request_queue_len: None,
            request_latency: None,
            download_rate: 0,
            last_incoming_time: Instant::now(),
            last_outgoing_time: Instant::now(),
        }
    }
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// This state is optional, it is used to verify that the availability
    /// exchange (bitfield, or have-all/have-none with the fast extension)
    /// occurs right after the handshake and never later. Any subsequent
    /// bitfield message is rejected and the connection is dropped, as per
    /// the standard.
    AvailabilityExchange,
    /// This is the normal state of a peer session, in which any messages,
    /// apart from the 'handshake' and 'bitfield', may be exchanged.
    Connected,
}

/// The default (and initial) state of a peer session is `Disconnected`.
impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Information about the peer we're connected to.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    #[allow(dead_code)]
    peer_id: PeerId,
    /// All pieces peer has, updated when it announces to us a new piece.
    pieces: Bitfield,
}

/// Computes the allowed-fast piece set for a peer: the pieces we commit to
/// serving it even while it is choked (BEP 6).
///
/// The set is a function of the peer's masked IP address and the torrent's
/// info hash, so both sides can compute it independently.
fn compute_allowed_fast(
    ip: &IpAddr,
    info_hash: &Sha1Hash,
    num_pieces: usize,
    count: usize,
) -> Vec<PieceIndex> {
    let count = count.min(num_pieces);
    let mut x = Vec::with_capacity(24);
    match ip {
        IpAddr::V4(ip) => {
            let mut octets = ip.octets();
            // the low octet is masked out so a peer can't get a fresh set
            // by hopping addresses within its /24
            octets[3] = 0;
            x.extend_from_slice(&octets);
        }
        IpAddr::V6(ip) => {
            // mask the lower 64 bits, the customary interface identifier
            let mut octets = ip.octets();
            for octet in octets[8..].iter_mut() {
                *octet = 0;
            }
            x.extend_from_slice(&octets);
        }
    }
    x.extend_from_slice(info_hash);

    let mut allowed = Vec::with_capacity(count);
    let mut digest = Sha1::digest(&x);
    while allowed.len() < count {
        for chunk in digest.chunks(4) {
            if allowed.len() >= count {
                break;
            }
            let mut bytes = [0; 4];
            bytes.copy_from_slice(chunk);
            let index =
                (u32::from_be_bytes(bytes) as usize) % num_pieces;
            if !allowed.contains(&index) {
                allowed.push(index);
            }
        }
        digest = Sha1::digest(&digest);
    }
    allowed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_fast_reference_vector() {
        // the reference vector from BEP 6: address 80.4.4.200, an info
        // hash of 20 0xaa bytes, 1313 pieces, 7 fast pieces
        let ip: IpAddr = "80.4.4.200".parse().unwrap();
        let allowed = compute_allowed_fast(&ip, &[0xaa; 20], 1313, 7);
        assert_eq!(allowed, vec![1059, 431, 808, 1217, 287, 376, 1188]);
    }

    #[test]
    fn test_allowed_fast_masks_low_octet() {
        // addresses within the same /24 get the same set
        let a: IpAddr = "80.4.4.200".parse().unwrap();
        let b: IpAddr = "80.4.4.7".parse().unwrap();
        let c: IpAddr = "80.4.5.200".parse().unwrap();
        let set_a = compute_allowed_fast(&a, &[0xaa; 20], 1313, 7);
        let set_b = compute_allowed_fast(&b, &[0xaa; 20], 1313, 7);
        let set_c = compute_allowed_fast(&c, &[0xaa; 20], 1313, 7);
        assert_eq!(set_a, set_b);
        assert_ne!(set_a, set_c);
    }

    #[test]
    fn test_allowed_fast_bounded_by_piece_count() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let allowed = compute_allowed_fast(&ip, &[1; 20], 3, 10);
        assert_eq!(allowed.len(), 3);
        // every piece exactly once
        let mut sorted = allowed;
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2]);
    }

    #[test]
    fn test_request_queue_len_tracks_bandwidth_delay() {
        let mut status = Status::default();
        // 1 MiB/s at 500 ms of latency wants ~32 blocks in flight
        status.download_rate = 1024 * 1024;
        status.update_request_latency(Duration::from_millis(500));
        status.update_best_request_queue_len();
        assert_eq!(status.best_request_queue_len, Some(32));

        // a trickle never drops below the floor
        status.download_rate = 100;
        status.update_best_request_queue_len();
        assert_eq!(status.best_request_queue_len, Some(4));
    }
}

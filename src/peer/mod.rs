pub(crate) mod codec;

use {
    futures::{
        select,
        stream::{Fuse, SplitSink},
        FutureExt, SinkExt, StreamExt,
    },
    std::{net::SocketAddr, sync::Arc, time::Duration},
    tokio::{
        net::TcpStream,
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        time::{self, Instant},
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        download::PieceDownload,
        error::*,
        torrent::{CompletedPiece, PieceSender, TorrentContext},
        Bitfield, BlockInfo, PeerId, PieceIndex,
    },
    codec::*,
};

/// The channel on which the torrent can send a command to the peer session
/// task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
}

/// The sink through which the session's protocol messages go out.
type MessageSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

/// A connection with a single peer of the swarm, driving the download of
/// one piece at a time through it.
pub(crate) struct PeerSession {
    /// Shared information of the torrent, immutable over the session's
    /// lifetime.
    torrent: Arc<TorrentContext>,
    /// Verified piece payloads are handed to the torrent on this channel.
    piece_chan: PieceSender,
    /// The port on which the peer session receives commands.
    cmd_port: Fuse<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// Session related information.
    status: Status,
    /// The piece this session is currently downloading, if any. A session
    /// downloads at most one piece at a time; the piece is released back to
    /// the picker exactly once if the session ends before finishing it.
    download: Option<PieceDownload>,
    /// Our pending block requests that we sent to peer. It represents the
    /// blocks that we are expecting: a received block that is not in this
    /// list is dropped, a received block that is gets its entry removed.
    ///
    /// Emptied when we're choked, as in that case we don't expect
    /// outstanding requests to be served.
    outgoing_requests: Vec<BlockInfo>,
    /// Information about the peer that is set after a successful handshake.
    peer_info: Option<PeerInfo>,
    /// When the last message (including keep-alives) arrived from the peer.
    last_incoming: Instant,
    /// When we last sent anything to the peer.
    last_outgoing: Instant,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    ///
    /// The connection is not established until [`Self::start`] is called.
    pub fn outbound(
        torrent: Arc<TorrentContext>,
        piece_chan: PieceSender,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrent,
                piece_chan,
                cmd_port: cmd_port.fuse(),
                addr,
                status: Status::default(),
                download: None,
                outgoing_requests: Vec::new(),
                peer_info: None,
                last_incoming: Instant::now(),
                last_outgoing: Instant::now(),
            },
            cmd_chan,
        )
    }

    /// Starts the peer session and returns when the connection is closed,
    /// an error occurs, or the torrent shuts the session down.
    ///
    /// Whatever way the session ends, its in-flight piece (if any) is handed
    /// back to the piece picker so another session can pick it up.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting peer {} session", self.addr);
        let result = self.connect_and_run().await;

        if let Some(download) = self.download.take() {
            let index = download.piece_index();
            log::info!(
                "Peer {} session ended mid-piece, releasing piece {}",
                self.addr,
                index
            );
            self.torrent.piece_picker.write().await.release_piece(index);
        }
        self.outgoing_requests.clear();
        self.status.state = State::Disconnected;

        result
    }

    /// Establishes the TCP connection, exchanges handshakes and runs the
    /// message loop.
    async fn connect_and_run(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;

        let socket = {
            let connect = time::timeout(
                self.torrent.conf.dial_timeout,
                TcpStream::connect(self.addr),
            )
            .fuse();
            futures::pin_mut!(connect);
            select! {
                res = connect => match res {
                    Ok(socket) => socket?,
                    Err(_) => return Err(Error::ConnectTimeout),
                },
                cmd = self.cmd_port.select_next_some() => match cmd {
                    Command::Shutdown => return Ok(()),
                },
            }
        };
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.status.state = State::Handshaking;
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        log::info!("Sending handshake to peer {}", self.addr);
        socket.send(handshake).await?;

        log::info!("Waiting for peer {} handshake", self.addr);
        let peer_handshake = {
            let handshake_read = time::timeout(
                self.torrent.conf.handshake_timeout,
                socket.next(),
            )
            .fuse();
            futures::pin_mut!(handshake_read);
            select! {
                res = handshake_read => match res {
                    Ok(Some(handshake)) => handshake?,
                    Ok(None) => return Err(Error::ConnectionClosed),
                    Err(_) => return Err(Error::HandshakeTimeout),
                },
                cmd = self.cmd_port.select_next_some() => match cmd {
                    Command::Shutdown => return Ok(()),
                },
            }
        };
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);

        // verify that the advertised torrent info hash is the same as ours;
        // the peer id is recorded but intentionally not checked against
        // anything
        if peer_handshake.info_hash != self.torrent.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(Error::InvalidPeerInfoHash);
        }
        log::info!(
            "Handshake with peer {} done, peer id {}",
            self.addr,
            hex::encode(&peer_handshake.peer_id)
        );
        self.peer_info = Some(PeerInfo {
            peer_id: peer_handshake.peer_id,
            pieces: None,
        });

        // Now that we have the handshake, we need to switch to the peer
        // message codec. Note that we need to keep the buffers of the
        // original codec as they may contain bytes of any message the peer
        // may have sent after the handshake.
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(
            old_parts.io,
            PeerCodec::new(self.torrent.conf.max_frame_len),
        );
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        // enter the piece availability exchange state: if the peer has
        // anything to offer, its bitfield must be the next message (we don't
        // send one as we have nothing when the download starts)
        self.status.state = State::AvailabilityExchange;
        log::info!(
            "Peer {} session state: {:?}",
            self.addr,
            self.status.state
        );

        self.run(socket).await
    }

    /// Runs the session after the connection to the peer is established.
    ///
    /// This is the main session "loop" and performs the core of the session
    /// logic: exchange of messages, timeout logic, etc.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        self.last_incoming = Instant::now();
        self.last_outgoing = Instant::now();

        // split the sink and stream so that we can pass the sink while
        // holding a reference to the stream in the loop
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // drives keep-alives, the idle deadline, and piece pick retries
        let mut ticker = time::interval(Duration::from_secs(1)).fuse();

        loop {
            select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        None => return Err(Error::ConnectionClosed),
                    };
                    log::debug!(
                        "Received message {:?} from peer {}",
                        msg.id(),
                        self.addr
                    );
                    self.last_incoming = Instant::now();

                    // The bitfield message may only be received directly
                    // after the handshake. A peer whose first message is
                    // something else simply starts out with no pieces; its
                    // later Have messages fill the availability in.
                    if let State::AvailabilityExchange = self.status.state {
                        self.status.state = State::Connected;
                        log::info!(
                            "Peer {} session state: {:?}",
                            self.addr,
                            self.status.state
                        );
                        match msg {
                            Message::Bitfield(bitfield) => {
                                self.handle_bitfield_msg(&mut sink, bitfield)
                                    .await?;
                            }
                            msg => self.handle_msg(&mut sink, msg).await?,
                        }
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                _ = ticker.select_next_some() => {
                    self.tick(&mut sink).await?;
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
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

    /// Handles the peer's bitfield, which must have been the first message
    /// after the handshake.
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut MessageSink,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        log::info!("Handling peer {} Bitfield message", self.addr);
        log::trace!("Bitfield: {:?}", bitfield);

        // The bitfield raw data that is sent over the wire may be longer
        // than the logical pieces it represents, if the number of pieces in
        // torrent is not a multiple of 8. Therefore we need to slice off the
        // padding; a bitfield that can't even cover the pieces is rejected.
        let piece_count = self.torrent.storage.piece_count;
        if bitfield.len() < piece_count {
            log::warn!(
                "Peer {} sent a bitfield of {} bits for {} pieces",
                self.addr,
                bitfield.len(),
                piece_count
            );
            return Err(Error::InvalidBitfield);
        }
        bitfield.resize(piece_count, false);

        if let Some(peer_info) = &mut self.peer_info {
            peer_info.pieces = Some(bitfield);
        }

        self.update_interest(sink).await
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(_) => {
                log::warn!(
                    "Peer {} sent bitfield not after handshake",
                    self.addr
                );
                return Err(Error::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {
                log::debug!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    // since we're choked we don't expect to receive blocks
                    // for our pending requests, and the piece in flight goes
                    // back to the picker for other sessions
                    self.outgoing_requests.clear();
                    if let Some(download) = self.download.take() {
                        let index = download.piece_index();
                        log::info!(
                            "Peer {} choked us mid-piece, releasing piece {}",
                            self.addr,
                            index
                        );
                        self.torrent
                            .piece_picker
                            .write()
                            .await
                            .release_piece(index);
                    }
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    // now that we are allowed to request blocks, start the
                    // download pipeline
                    self.update_interest(sink).await?;
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                // recorded but not acted upon: we never upload
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                }
            }
            Message::Have { piece_index } => {
                self.handle_have_msg(sink, piece_index).await?;
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
                self.handle_block_msg(block_info, data).await?;

                // we may be able to make more requests now that a block has
                // arrived
                self.make_requests(sink).await?;
            }
            Message::Request(block) => {
                // we are strictly a leech
                log::debug!(
                    "Peer {} requested block {:?}, not serving",
                    self.addr,
                    block
                );
            }
            Message::Cancel(block) => {
                log::debug!(
                    "Peer {} canceled block {:?}, nothing to cancel",
                    self.addr,
                    block
                );
            }
            Message::Unknown { id, payload } => {
                log::debug!(
                    "Peer {} sent unknown message id {} with {} bytes",
                    self.addr,
                    id,
                    payload.len()
                );
            }
        }

        Ok(())
    }

    /// Registers that the peer acquired a new piece and kicks the request
    /// pipeline in case we were waiting for a provider of that piece.
    async fn handle_have_msg(
        &mut self,
        sink: &mut MessageSink,
        piece_index: PieceIndex,
    ) -> Result<()> {
        log::debug!("Peer {} has piece {}", self.addr, piece_index);
        let piece_count = self.torrent.storage.piece_count;
        if piece_index >= piece_count {
            log::warn!(
                "Peer {} announced invalid piece {}",
                self.addr,
                piece_index
            );
            return Err(Error::InvalidPieceIndex);
        }

        if let Some(peer_info) = &mut self.peer_info {
            // a peer that never sent a bitfield starts out with all zeroes
            let pieces = peer_info
                .pieces
                .get_or_insert_with(|| Bitfield::repeat(false, piece_count));
            pieces.set(piece_index, true);
        }

        self.update_interest(sink).await?;
        if !self.status.is_choked {
            self.make_requests(sink).await?;
        }
        Ok(())
    }

    /// Expresses interest in the peer if it has pieces we are still missing
    /// and we haven't done so yet. Sending Interested is idempotent from the
    /// peer's point of view, but we only send it once.
    async fn update_interest(&mut self, sink: &mut MessageSink) -> Result<()> {
        if self.status.is_interested {
            return Ok(());
        }

        let is_interested = if let Some(pieces) =
            self.peer_info.as_ref().and_then(|p| p.pieces.as_ref())
        {
            self.torrent.piece_picker.read().await.has_missing_in(pieces)
        } else {
            false
        };

        if is_interested {
            log::info!("Interested in peer {}", self.addr);
            self.send_msg(sink, Message::Interested).await?;
            self.status.is_interested = true;
        }

        Ok(())
    }

    /// Fills the session's download pipeline with the configured number of
    /// outstanding block requests, picking a new piece from the picker if
    /// none is in flight.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {
        if self.status.is_choked || !self.status.is_interested {
            return Ok(());
        }

        if self.download.is_none() {
            if let Some(pieces) =
                self.peer_info.as_ref().and_then(|p| p.pieces.as_ref())
            {
                let index = self
                    .torrent
                    .piece_picker
                    .write()
                    .await
                    .pick_piece(pieces);
                if let Some(index) = index {
                    log::info!(
                        "Session {} picked piece {}",
                        self.addr,
                        index
                    );
                    self.download = Some(PieceDownload::new(
                        index,
                        self.torrent.storage.piece_hash(index)?,
                        self.torrent.storage.piece_len(index)?,
                    ));
                }
            }
        }

        // the outgoing request queue mustn't exceed the configured pipeline
        // depth
        let mut blocks = Vec::new();
        let to_request_count = self
            .torrent
            .conf
            .request_queue_len
            .saturating_sub(self.outgoing_requests.len());
        if let Some(download) = &mut self.download {
            download.pick_blocks(to_request_count, &mut blocks);
        }

        // save the current volley of requests, then make the actual requests
        self.outgoing_requests.extend_from_slice(&blocks);
        for block in blocks {
            self.send_msg(sink, Message::Request(block)).await?;
        }

        Ok(())
    }

    /// Buffers a received block with the in-flight piece download and, if
    /// this was the last missing block, verifies the piece: a good piece is
    /// reported to the picker and handed to the torrent, a corrupt one is
    /// released and closes the session.
    async fn handle_block_msg(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::debug!(
            "Received block from peer {}: {:?}",
            self.addr,
            block_info
        );

        // find the block in the list of pending requests
        let block_pos = match self
            .outgoing_requests
            .iter()
            .position(|b| *b == block_info)
        {
            Some(pos) => pos,
            None => {
                // the peer sent a block we didn't ask for (or one whose
                // request was abandoned on a choke); drop it without
                // touching any state
                log::warn!(
                    "Peer {} sent not requested block: {:?}",
                    self.addr,
                    block_info,
                );
                return Ok(());
            }
        };
        self.outgoing_requests.remove(block_pos);

        // an entry in `outgoing_requests` always belongs to the download in
        // flight
        let is_complete = match &mut self.download {
            Some(download)
                if download.piece_index() == block_info.piece_index =>
            {
                download.received_block(block_info.offset, data)?;
                download.count_missing_blocks() == 0
            }
            _ => {
                debug_assert!(
                    false,
                    "pending request without matching download"
                );
                log::warn!(
                    "Peer {} sent block {:?} for a piece not in flight",
                    self.addr,
                    block_info
                );
                return Ok(());
            }
        };
        if !is_complete {
            return Ok(());
        }

        if let Some(download) = self.download.take() {
            let index = download.piece_index();
            if download.verify() {
                log::info!(
                    "Finished piece {} via peer {}",
                    index,
                    self.addr
                );
                // register the piece before handing its payload on, so that
                // no other session can pick it in between
                self.torrent
                    .piece_picker
                    .write()
                    .await
                    .received_piece(index)?;
                self.piece_chan
                    .send(CompletedPiece {
                        index,
                        data: download.into_bytes(),
                    })
                    .await
                    .map_err(|_| Error::ChannelClosed)?;
            } else {
                log::warn!(
                    "Piece {} downloaded from peer {} failed verification",
                    index,
                    self.addr
                );
                self.torrent
                    .piece_picker
                    .write()
                    .await
                    .release_piece(index);
                // the peer served corrupt data; the piece will be retried
                // through another session
                return Err(Error::PieceHashMismatch(index));
            }
        }

        Ok(())
    }

    /// Runs the session's once-a-second upkeep: enforces the idle deadline,
    /// emits keep-alives, and retries the picker in case another session
    /// released a piece this peer can provide.
    async fn tick(&mut self, sink: &mut MessageSink) -> Result<()> {
        let idle_timeout = self.torrent.conf.idle_timeout;
        let keep_alive_interval = self.torrent.conf.keep_alive_interval;

        if self.last_incoming.elapsed() >= idle_timeout {
            log::warn!("Peer {} has been idle too long", self.addr);
            return Err(Error::IdleTimeout);
        }

        if self.last_outgoing.elapsed() >= keep_alive_interval {
            log::debug!("Sending keep alive to peer {}", self.addr);
            self.send_msg(sink, Message::KeepAlive).await?;
        }

        if !self.status.is_choked
            && self.status.is_interested
            && self.download.is_none()
        {
            self.make_requests(sink).await?;
        }

        Ok(())
    }

    /// Sends a message to the peer and notes the send time for the
    /// keep-alive schedule.
    async fn send_msg(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> Result<()> {
        log::debug!("Sending message {:?} to peer {}", msg.id(), self.addr);
        self.last_outgoing = Instant::now();
        sink.send(msg).await?;
        Ok(())
    }
}

/// The status of a peer session.
///
/// Both sides of the connection start off choked and not interested in the
/// other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have. Recorded only; we never serve.
    is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_interested: false,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// This state is set once the handshakes are exchanged and is changed as
    /// soon as we receive the bitfield or the first message that is not a
    /// bitfield. Any subsequent bitfield messages are rejected and the
    /// connection is dropped, as per the standard.
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
    /// The peer's 20 byte BitTorrent id, as advertised in its handshake.
    #[allow(dead_code)]
    peer_id: PeerId,
    /// All pieces the peer has, updated when it announces a new piece.
    /// `None` until the peer tells us anything about its pieces.
    pieces: Option<Bitfield>,
}

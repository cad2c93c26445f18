//! The torrent coordinates a whole download: it discovers peers through the
//! tracker, runs one peer session per peer, and hands verified pieces to the
//! caller.

use {
    futures::{
        select,
        stream::{Fuse, FuturesUnordered},
        FutureExt, StreamExt,
    },
    std::{
        collections::HashMap, io, net::SocketAddr, sync::Arc, time::Duration,
    },
    tokio::{
        sync::{
            mpsc::{self, Receiver, Sender},
            RwLock,
        },
        task::{self, JoinHandle},
        time,
    },
};

use crate::{
    conf::Conf,
    error::*,
    metainfo::Metainfo,
    peer::{self, PeerSession},
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    tracker::{self, AnnounceParams},
    PeerId, PieceIndex, Sha1Hash,
};

/// A piece that has been fully downloaded and has matched its expected
/// hash. Pieces arrive in completion order, not index order; each index is
/// delivered exactly once.
#[derive(Debug)]
pub struct CompletedPiece {
    /// The piece's index in the torrent.
    pub index: PieceIndex,
    /// The piece's payload. Its place in the downloaded file is at byte
    /// offset `index * piece_length`.
    pub data: Vec<u8>,
}

pub(crate) type PieceSender = Sender<CompletedPiece>;
/// The channel on which the caller receives the torrent's verified pieces.
pub type PieceReceiver = Receiver<CompletedPiece>;

/// Information about the torrent that is shared with every peer session.
pub(crate) struct TorrentContext {
    /// The torrent's info hash, identifying the swarm.
    pub info_hash: Sha1Hash,
    /// Our own id, sent in every handshake.
    pub client_id: PeerId,
    /// The torrent's piece geometry and expected piece hashes.
    pub storage: StorageInfo,
    /// Which pieces we have, which are assigned to a session. The lock
    /// serializes every pick, release and completion across sessions.
    pub piece_picker: RwLock<PiecePicker>,
    /// The engine configuration.
    pub conf: Conf,
}

type SessionJoins = FuturesUnordered<JoinHandle<(SocketAddr, Result<()>)>>;

/// A single torrent download.
pub struct Torrent {
    /// Information shared with the peer sessions.
    ctx: Arc<TorrentContext>,
    /// The tracker we announce to.
    announce_url: String,
    /// The channel on which the sessions deliver verified pieces.
    piece_port: Fuse<PieceReceiver>,
    /// The prototype piece sender, cloned into each session.
    piece_chan: PieceSender,
    /// Verified pieces are passed on to the caller through this channel.
    /// Dropped when the download ends, successfully or not, so that the
    /// consumer's receive loop observes the end of the stream.
    completed_chan: Option<PieceSender>,
    /// The command channels of the sessions currently running.
    sessions: HashMap<SocketAddr, peer::Sender>,
    /// The HTTP client announces go through.
    http: reqwest::Client,
    /// How long to wait between periodic announces. Overridden by the
    /// interval the tracker reports.
    announce_interval: Duration,
    /// The number of verified payload bytes downloaded so far.
    downloaded: u64,
}

impl Torrent {
    /// Creates a torrent for the given metainfo and returns it along with
    /// the channel its verified pieces are delivered on.
    pub fn new(
        metainfo: &Metainfo,
        conf: Conf,
    ) -> Result<(Self, PieceReceiver)> {
        let info_hash = metainfo.create_info_hash()?;
        let storage = StorageInfo::new(metainfo);
        log::info!(
            "Torrent {} has {} pieces of {} bytes ({} bytes in total)",
            hex::encode(&info_hash),
            storage.piece_count,
            storage.piece_len,
            storage.download_len,
        );

        // sessions rarely finish pieces at the same moment; a small buffer
        // is enough to keep them from blocking on one another
        let (piece_chan, piece_port) = mpsc::channel(8);
        let (completed_chan, completed_port) = mpsc::channel(8);

        let announce_interval = conf.announce_interval;
        let piece_count = storage.piece_count;
        let ctx = Arc::new(TorrentContext {
            info_hash,
            client_id: conf.client_id,
            storage,
            piece_picker: RwLock::new(PiecePicker::new(piece_count)),
            conf,
        });

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok((
            Self {
                ctx,
                announce_url: metainfo.announce.clone(),
                piece_port: piece_port.fuse(),
                piece_chan,
                completed_chan: Some(completed_chan),
                sessions: HashMap::new(),
                http,
                announce_interval,
                downloaded: 0,
            },
            completed_port,
        ))
    }

    /// Runs the download until every piece has been verified and delivered,
    /// a fatal error occurs, or the peers and the announce retry budget are
    /// exhausted. Individual peer failures are not fatal: their sessions
    /// are logged and removed, and their pieces retried elsewhere.
    pub async fn start(&mut self) -> Result<()> {
        let result = self.run().await;
        // close the caller-facing channel so that a consumer waiting for
        // pieces sees the download end even when it failed
        self.completed_chan = None;
        result
    }

    async fn run(&mut self) -> Result<()> {
        // without a first successful announce there is no swarm to talk to
        let peers = self.announce().await?;
        if peers.is_empty() {
            log::warn!("Tracker handed out no peers");
        }

        let mut joins = SessionJoins::new();
        self.connect_to_peers(peers, &mut joins);

        let mut retry_budget = self.ctx.conf.announce_retry_budget;
        let mut announce_delay = time::delay_for(if self.sessions.is_empty()
        {
            // no usable peers yet, ask again soon
            Duration::from_secs(5)
        } else {
            self.announce_interval
        });

        let result = loop {
            select! {
                piece = self.piece_port.select_next_some() => {
                    match self.handle_piece_completion(piece).await {
                        Ok(true) => break Ok(()),
                        Ok(false) => {}
                        Err(e) => break Err(e),
                    }
                }
                join = joins.select_next_some() => {
                    if let Err(e) = self.handle_session_end(join) {
                        break Err(e);
                    }
                    if self.sessions.is_empty()
                        && !self.ctx.piece_picker.read().await.is_done()
                    {
                        // every peer is gone with pieces still missing; ask
                        // the tracker again, within the retry budget
                        if retry_budget == 0 {
                            break Err(Error::TorrentIncomplete);
                        }
                        retry_budget -= 1;
                        log::warn!(
                            "Out of peers, re-announcing ({} retries left)",
                            retry_budget
                        );
                        announce_delay =
                            time::delay_for(Duration::from_secs(0));
                    }
                }
                _ = (&mut announce_delay).fuse() => {
                    announce_delay =
                        time::delay_for(self.announce_interval);
                    match self.announce().await {
                        Ok(peers) => {
                            self.connect_to_peers(peers, &mut joins);
                            if self.sessions.is_empty() {
                                if retry_budget == 0 {
                                    break Err(Error::TorrentIncomplete);
                                }
                                retry_budget -= 1;
                                log::warn!(
                                    "Still no usable peers ({} retries left)",
                                    retry_budget
                                );
                                announce_delay = time::delay_for(
                                    Duration::from_secs(5),
                                );
                            }
                        }
                        Err(e) => {
                            log::warn!("Announce failed: {}", e);
                            if retry_budget == 0 {
                                break Err(Error::TorrentIncomplete);
                            }
                            retry_budget -= 1;
                            announce_delay =
                                time::delay_for(Duration::from_secs(5));
                        }
                    }
                }
            }
        };

        self.shutdown_sessions(&mut joins).await;
        result
    }

    /// Announces to the tracker, reporting our progress, and returns the
    /// peers it handed out.
    async fn announce(&mut self) -> Result<Vec<SocketAddr>> {
        let params = AnnounceParams {
            info_hash: self.ctx.info_hash,
            peer_id: self.ctx.client_id,
            port: self.ctx.conf.listen_port,
            uploaded: 0,
            downloaded: self.downloaded,
            left: self
                .ctx
                .storage
                .download_len
                .saturating_sub(self.downloaded),
        };

        log::info!("Announcing to tracker {}", self.announce_url);
        let response =
            tracker::announce(&self.http, &self.announce_url, &params)
                .await?;

        if let Some(interval) = response.interval {
            self.announce_interval = interval;
        }
        if let (Some(seeders), Some(leechers)) =
            (response.complete, response.incomplete)
        {
            log::info!(
                "Swarm has {} seeders and {} leechers",
                seeders,
                leechers
            );
        }
        log::info!("Tracker returned {} peers", response.peers.len());

        Ok(response.peers)
    }

    /// Spawns a session for every peer address we don't already have a
    /// running session with.
    fn connect_to_peers(
        &mut self,
        peers: Vec<SocketAddr>,
        joins: &mut SessionJoins,
    ) {
        let mut count = 0;
        for addr in peers {
            // one session per address; peers that died may come back on a
            // later announce round
            if self.sessions.contains_key(&addr) {
                continue;
            }
            let (mut session, cmd_chan) = PeerSession::outbound(
                Arc::clone(&self.ctx),
                self.piece_chan.clone(),
                addr,
            );
            self.sessions.insert(addr, cmd_chan);
            joins.push(task::spawn(async move {
                let result = session.start().await;
                (addr, result)
            }));
            count += 1;
        }
        if count > 0 {
            log::info!("Connecting to {} new peers", count);
        }
    }

    /// Forwards a verified piece to the caller and reports whether the
    /// download is now complete.
    async fn handle_piece_completion(
        &mut self,
        piece: CompletedPiece,
    ) -> Result<bool> {
        self.downloaded += piece.data.len() as u64;
        let (own_count, piece_count) = {
            let picker = self.ctx.piece_picker.read().await;
            (picker.own_piece_count(), picker.piece_count())
        };
        log::info!(
            "Downloaded piece {} ({}/{} pieces, {}/{} bytes)",
            piece.index,
            own_count,
            piece_count,
            self.downloaded,
            self.ctx.storage.download_len,
        );

        match self.completed_chan.as_mut() {
            Some(chan) => chan
                .send(piece)
                .await
                .map_err(|_| Error::ChannelClosed)?,
            None => return Err(Error::ChannelClosed),
        }

        Ok(own_count == piece_count)
    }

    /// Removes a finished session, logging why it ended. Per-peer errors
    /// are not propagated; a violated cross-session invariant or a panicked
    /// session task is.
    fn handle_session_end(
        &mut self,
        join: std::result::Result<(SocketAddr, Result<()>), task::JoinError>,
    ) -> Result<()> {
        match join {
            Ok((addr, Ok(()))) => {
                self.sessions.remove(&addr);
                log::info!("Peer {} session finished", addr);
            }
            Ok((addr, Err(e))) => {
                self.sessions.remove(&addr);
                log::warn!("Peer {} session ended: {}", addr, e);
                if e.is_invariant_violation() {
                    return Err(e);
                }
            }
            Err(e) => {
                log::error!("Peer session task failed: {}", e);
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    e,
                )));
            }
        }
        Ok(())
    }

    /// Tells every running session to shut down and waits for them to
    /// finish.
    async fn shutdown_sessions(&mut self, joins: &mut SessionJoins) {
        log::info!("Shutting down {} peer sessions", self.sessions.len());
        for (_, cmd_chan) in self.sessions.drain() {
            // a session that exited on its own has dropped its receiver,
            // which is fine
            let _ = cmd_chan.send(peer::Command::Shutdown);
        }
        // sessions abort their current read within a bounded time; don't
        // wait forever on a hung task
        let drain = async {
            while joins.next().await.is_some() {}
        };
        if time::timeout(Duration::from_secs(10), drain).await.is_err() {
            log::warn!("Some peer sessions did not shut down in time");
        }
    }
}

//! The error types the torrent engine and its parts may return.

use thiserror::Error;

use crate::PieceIndex;

/// The crate-wide result type, defaulting to [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors that may occur while downloading a torrent.
///
/// Most of these are local to a single peer session: they tear down that
/// connection and release its in-flight piece, but leave the rest of the
/// swarm running. Metainfo and first-announce failures, as well as violated
/// scheduler invariants, abort the whole download.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A low-level network or file read/write failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The metainfo file or the tracker response could not be bencode
    /// decoded or encoded.
    #[error(transparent)]
    Bencode(#[from] serde_bencode::Error),

    /// The tracker HTTP request failed.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The metainfo file decoded but its contents are not usable.
    #[error("invalid metainfo: {0}")]
    InvalidMetainfo(&'static str),

    /// The tracker answered but its response is not usable, or it carried
    /// a failure reason.
    #[error("tracker error: {0}")]
    Tracker(String),

    /// The TCP connection to the peer could not be established within the
    /// dial timeout.
    #[error("peer connect timed out")]
    ConnectTimeout,

    /// The peer closed the connection in the middle of a session.
    #[error("peer closed the connection")]
    ConnectionClosed,

    /// The peer did not complete the handshake within the deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The peer's handshake did not carry the BitTorrent protocol string.
    #[error("handshake protocol string mismatch")]
    HandshakeProtocolMismatch,

    /// The info hash in the peer's handshake is not the one of the torrent
    /// this session belongs to.
    #[error("info hash mismatch in peer handshake")]
    InvalidPeerInfoHash,

    /// The peer sent a frame whose length prefix exceeds the allowed
    /// maximum.
    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    /// The byte stream ended before a full frame could be read.
    #[error("stream ended mid-frame")]
    ShortRead,

    /// A frame's payload does not have the shape its message id requires.
    #[error("malformed frame")]
    MalformedFrame,

    /// The peer sent nothing, not even a keep-alive, for too long.
    #[error("peer connection idle for too long")]
    IdleTimeout,

    /// The peer sent a bitfield after the first message of the session.
    #[error("bitfield sent not directly after handshake")]
    BitfieldNotAfterHandshake,

    /// The peer's bitfield is too short to cover the torrent's pieces.
    #[error("bitfield does not cover all pieces in torrent")]
    InvalidBitfield,

    /// A piece index is out of range for the torrent.
    #[error("piece index is invalid")]
    InvalidPieceIndex,

    /// A block's offset is misaligned or outside its piece.
    #[error("block at offset {offset} in piece {piece_index} has a bad offset")]
    BadOffset { piece_index: PieceIndex, offset: u32 },

    /// A block was delivered for an offset that has already been filled.
    #[error("duplicate block at offset {offset} in piece {piece_index}")]
    DuplicateBlock { piece_index: PieceIndex, offset: u32 },

    /// A piece was reported complete without having been assigned.
    #[error("piece {0} completed but was not pending")]
    NotPending(PieceIndex),

    /// A fully downloaded piece did not match its expected hash.
    #[error("piece {0} failed hash verification")]
    PieceHashMismatch(PieceIndex),

    /// An internal channel was closed while the download was still running.
    #[error("internal channel closed")]
    ChannelClosed,

    /// Every peer has been tried and the retry budget is exhausted, but
    /// pieces are still missing.
    #[error("no peer could provide the remaining pieces")]
    TorrentIncomplete,
}

impl Error {
    /// Returns true if the error indicates a broken cross-session invariant
    /// rather than a misbehaving peer. Such errors abort the torrent instead
    /// of just the session that surfaced them.
    pub(crate) fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::NotPending(_))
    }
}
